//! Per-device transfer counters

use protocol::Direction;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free transfer statistics for one device context
#[derive(Debug, Default)]
pub struct TransferStats {
    transfers: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    short_transfers: AtomicU64,
    stalls: AtomicU64,
    halt_clears: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`TransferStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatsSnapshot {
    pub transfers: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub short_transfers: u64,
    pub stalls: u64,
    pub halt_clears: u64,
    pub timeouts: u64,
    pub errors: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_completed(&self, direction: Direction, requested: usize, actual: usize) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        let counter = match direction {
            Direction::In => &self.bytes_in,
            Direction::Out => &self.bytes_out,
        };
        counter.fetch_add(actual as u64, Ordering::Relaxed);
        if actual < requested {
            self.short_transfers.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_halt_clear(&self) {
        self.halt_clears.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            transfers: self.transfers.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            short_transfers: self.short_transfers.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            halt_clears: self.halt_clears.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_counts_bytes_by_direction() {
        let stats = TransferStats::new();
        stats.record_completed(Direction::In, 64, 64);
        stats.record_completed(Direction::In, 64, 10);
        stats.record_completed(Direction::Out, 32, 32);

        let snap = stats.snapshot();
        assert_eq!(snap.transfers, 3);
        assert_eq!(snap.bytes_in, 74);
        assert_eq!(snap.bytes_out, 32);
        assert_eq!(snap.short_transfers, 1);
    }

    #[test]
    fn test_failure_counters() {
        let stats = TransferStats::new();
        stats.record_stall();
        stats.record_halt_clear();
        stats.record_timeout();
        stats.record_error();

        let snap = stats.snapshot();
        assert_eq!(snap.stalls, 1);
        assert_eq!(snap.halt_clears, 1);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.transfers, 2);
    }
}

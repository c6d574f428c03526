//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// bmRequestType uses a reserved kind or recipient
    #[error("Invalid request type: {0:#04x}")]
    InvalidRequestType(u8),

    /// Device filter string is malformed
    #[error(
        "Invalid filter format '{0}', expected VID:PID (e.g., '0x21e1:0x0001' or '0x21e1:*')"
    )]
    InvalidFilter(String),

    /// A VID or PID field is not a 16-bit hex value
    #[error("Invalid {field} '{value}': must be a 16-bit hex value")]
    InvalidHexId { field: &'static str, value: String },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

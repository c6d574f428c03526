//! Caller memory bridge
//!
//! Data moves between caller memory and the device context's transfer
//! buffer only through [`stage_in`] and [`stage_out`]. Caller memory is never
//! handed to the transfer channel, so halt recovery and retries only ever
//! touch the driver-owned buffer.
//!
//! Access to caller memory goes through [`UserMemory`], which reports an
//! inaccessible region as an ordinary error instead of faulting.

use common::{Error, Result};

/// Caller memory could not be accessed for the requested range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryFault;

/// A caller-supplied memory region
///
/// Implementations check the whole range before copying, so a failed copy
/// never leaves a partial result behind.
pub trait UserMemory {
    /// Length the caller declared for this region
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the first `dst.len()` bytes of the region into `dst`
    fn read_into(&self, dst: &mut [u8]) -> std::result::Result<(), MemoryFault>;

    /// Copy `src` into the start of the region
    fn write_from(&mut self, src: &[u8]) -> std::result::Result<(), MemoryFault>;
}

impl UserMemory for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn read_into(&self, dst: &mut [u8]) -> std::result::Result<(), MemoryFault> {
        let src = self.get(..dst.len()).ok_or(MemoryFault)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_from(&mut self, src: &[u8]) -> std::result::Result<(), MemoryFault> {
        let dst = self.get_mut(..src.len()).ok_or(MemoryFault)?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

impl UserMemory for Vec<u8> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn read_into(&self, dst: &mut [u8]) -> std::result::Result<(), MemoryFault> {
        self.as_slice().read_into(dst)
    }

    fn write_from(&mut self, src: &[u8]) -> std::result::Result<(), MemoryFault> {
        self.as_mut_slice().write_from(src)
    }
}

/// Read-only caller region whose declared length may exceed what is mapped
///
/// Models a caller handing over a pointer/length pair where only part of the
/// range is backed by accessible memory.
#[derive(Debug, Clone, Copy)]
pub struct UserSlice<'a> {
    mapped: &'a [u8],
    declared_len: usize,
}

impl<'a> UserSlice<'a> {
    pub fn new(mapped: &'a [u8], declared_len: usize) -> Self {
        Self {
            mapped,
            declared_len,
        }
    }
}

impl UserMemory for UserSlice<'_> {
    fn len(&self) -> usize {
        self.declared_len
    }

    fn read_into(&self, dst: &mut [u8]) -> std::result::Result<(), MemoryFault> {
        if dst.len() > self.declared_len {
            return Err(MemoryFault);
        }
        self.mapped.read_into(dst)
    }

    fn write_from(&mut self, _src: &[u8]) -> std::result::Result<(), MemoryFault> {
        Err(MemoryFault)
    }
}

/// Writable caller region whose declared length may exceed what is mapped
#[derive(Debug)]
pub struct UserSliceMut<'a> {
    mapped: &'a mut [u8],
    declared_len: usize,
}

impl<'a> UserSliceMut<'a> {
    pub fn new(mapped: &'a mut [u8], declared_len: usize) -> Self {
        Self {
            mapped,
            declared_len,
        }
    }
}

impl UserMemory for UserSliceMut<'_> {
    fn len(&self) -> usize {
        self.declared_len
    }

    fn read_into(&self, dst: &mut [u8]) -> std::result::Result<(), MemoryFault> {
        if dst.len() > self.declared_len {
            return Err(MemoryFault);
        }
        (*self.mapped).read_into(dst)
    }

    fn write_from(&mut self, src: &[u8]) -> std::result::Result<(), MemoryFault> {
        if src.len() > self.declared_len {
            return Err(MemoryFault);
        }
        (*self.mapped).write_from(src)
    }
}

/// Copy `length` bytes of caller memory into the transfer buffer
///
/// The length is checked against the buffer before anything is copied.
pub fn stage_in<'b, M>(user: &M, length: usize, buffer: &'b mut [u8]) -> Result<&'b [u8]>
where
    M: UserMemory + ?Sized,
{
    if length > buffer.len() {
        return Err(Error::InvalidLength {
            requested: length,
            capacity: buffer.len(),
        });
    }
    if length > user.len() {
        return Err(Error::FaultyUserMemory);
    }

    let staged = &mut buffer[..length];
    user.read_into(staged).map_err(|_| Error::FaultyUserMemory)?;
    Ok(staged)
}

/// Copy the first `count` bytes of the transfer buffer to caller memory
pub fn stage_out<M>(buffer: &[u8], count: usize, user: &mut M) -> Result<()>
where
    M: UserMemory + ?Sized,
{
    if count > buffer.len() {
        return Err(Error::InvalidLength {
            requested: count,
            capacity: buffer.len(),
        });
    }

    user.write_from(&buffer[..count])
        .map_err(|_| Error::FaultyUserMemory)
}

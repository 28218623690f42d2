//! Details shared between the kernel core and the layers around it.
//!
//! The filesystem, the virtual-memory code, and the block drivers all need to agree with the
//! buffer cache and the page allocator on sizes and on how failures are reported, so those
//! definitions live here.

#![no_std]

pub mod param;

/// Possible kinds of errors reported by the kernel core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The system is out of memory.
    OutOfMemory,
    /// Generic I/O error.
    Io,
    /// The request named a block or address outside the device or region.
    OutOfRange,
}
impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::OutOfMemory => "Out of memory",
            Self::Io => "I/O Error",
            Self::OutOfRange => "Request outside the valid range",
        })
    }
}

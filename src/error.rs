//! Error types.

use core::{error, fmt};

pub use shared::ErrorKind;

/// A [`core::result::Result`] defaulting to this module's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A generic error that can be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    /// The kind of the error.
    pub kind: ErrorKind,
}
impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}
impl error::Error for Error {}

/// There are no free pages left.
///
/// This is recoverable: the caller fails whatever higher-level operation needed the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;
impl From<OutOfMemory> for Error {
    fn from(_: OutOfMemory) -> Self {
        ErrorKind::OutOfMemory.into()
    }
}
impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&ErrorKind::OutOfMemory, f)
    }
}
impl error::Error for OutOfMemory {}

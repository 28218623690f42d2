//! Physical memory allocation for the kernel.
//!
//! See [`PageAllocator`].

mod page;

use core::{fmt, ops::Add};

pub use crate::param::PAGE_SIZE;
pub use page::{ALLOC_JUNK, FREE_JUNK, PageAllocator};

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);
impl PhysAddr {
    /// Wrap a raw address.
    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// The raw address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Get whether this address is the start of a page.
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0.is_multiple_of(PAGE_SIZE)
    }

    /// The first page boundary at or above this address.
    #[must_use]
    pub const fn page_round_up(self) -> Self {
        Self(self.0.next_multiple_of(PAGE_SIZE))
    }
}
impl Add<usize> for PhysAddr {
    type Output = Self;
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}
impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}
impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

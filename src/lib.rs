//! The resource-management core of the kernel.
//!
//! Two fixed pools live here, each shared by every CPU:
//! - [`bio::BufferCache`], a hash-sharded cache of disk blocks with global LRU eviction and
//!   one-holder-at-a-time access to each cached block.
//! - [`alloc::PageAllocator`], a free-list allocator over physical page frames, with a reference
//!   count per frame so that pages can be shared copy-on-write.
//!
//! Both are constructed once by the boot code and handed to their users by shared reference.
//! Neither depends on the other; they only need the locks in [`sync`] and, for the cache, a
//! [`bio::BlockDevice`].

#![no_std]

pub mod alloc;
pub mod bio;
pub mod error;
pub mod logger;
pub mod sync;

pub use shared::param;

//! Compile-time sizing of the kernel's fixed pools.

/// Max num of blocks any FS op writes.
pub const MAXOPBLOCKS: usize = 10;

/// Size of disk block cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Number of hash buckets the block cache is sharded into.
///
/// A prime keeps consecutive block numbers spread evenly.
pub const NBUCKET: usize = 13;

/// Size of a disk block, in bytes.
pub const BSIZE: usize = 1024;

/// The size of a single physical page, in bytes.
pub const PAGE_SIZE: usize = 4096;

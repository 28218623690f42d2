//! Host-side stand-ins for the pieces of the kernel the core is plugged into.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::{
    cell::Cell,
    collections::HashMap,
    ptr::NonNull,
    sync::{
        Mutex, Once,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
};

use kernel_core::{
    alloc::{PageAllocator, PhysAddr},
    bio::{BlockData, BlockDevice, BlockId},
    error::{ErrorKind, Result},
    logger::{self, Console},
    param::{BSIZE, PAGE_SIZE},
    sync::{ContextId, Scheduler},
};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CONTEXT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

fn fresh_context() -> ContextId {
    ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
}

/// A scheduler where every OS thread is its own context.
pub struct ThreadScheduler;
impl Scheduler for ThreadScheduler {
    fn current(&self) -> ContextId {
        CONTEXT.with(|ctx| {
            ctx.get().unwrap_or_else(|| {
                let id = fresh_context();
                ctx.set(Some(id));
                id
            })
        })
    }

    fn yield_now(&self) {
        thread::yield_now();
    }
}

/// Make this thread look like a different context until the guard is dropped.
pub fn impersonate() -> Impersonation {
    let prev = ThreadScheduler.current();
    CONTEXT.with(|ctx| ctx.set(Some(fresh_context())));
    Impersonation { prev }
}

/// Returned by [`impersonate`].
pub struct Impersonation {
    prev: ContextId,
}
impl Drop for Impersonation {
    fn drop(&mut self) {
        CONTEXT.with(|ctx| ctx.set(Some(self.prev)));
    }
}

/// An in-memory disk.
///
/// Blocks that were never written read back as [`pattern`].
pub struct RamDisk {
    /// Blocks per device.
    size: u32,
    blocks: Mutex<HashMap<BlockId, Box<BlockData>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
}
impl RamDisk {
    pub fn new() -> Self {
        Self::with_size(1024)
    }

    /// A disk whose devices each have `size` blocks.
    pub fn with_size(size: u32) -> Self {
        Self {
            size,
            blocks: Mutex::default(),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
        }
    }

    fn check_range(&self, block: BlockId) -> Result<()> {
        if block.blockno >= self.size {
            return Err(ErrorKind::OutOfRange.into());
        }
        Ok(())
    }

    /// Successful reads so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every read fail with an I/O error until turned off again.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// What's on the disk for `block`.
    pub fn contents(&self, block: BlockId) -> BlockData {
        self.blocks
            .lock()
            .unwrap()
            .get(&block)
            .map_or_else(|| pattern(block), |data| **data)
    }
}
impl BlockDevice for RamDisk {
    fn read_block(&self, block: BlockId, data: &mut BlockData) -> Result<()> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(ErrorKind::Io.into());
        }
        self.check_range(block)?;
        *data = self.contents(block);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, block: BlockId, data: &BlockData) -> Result<()> {
        self.check_range(block)?;
        self.blocks.lock().unwrap().insert(block, Box::new(*data));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// The contents of a block nobody wrote: its id, then filler.
pub fn pattern(block: BlockId) -> BlockData {
    let mut data = [0xaa; BSIZE];
    data[..4].copy_from_slice(&block.dev.to_le_bytes());
    data[4..8].copy_from_slice(&block.blockno.to_le_bytes());
    data
}

/// Read back the block id stamped by [`pattern`].
pub fn tag(data: &BlockData) -> BlockId {
    BlockId::new(
        u32::from_le_bytes(data[..4].try_into().unwrap()),
        u32::from_le_bytes(data[4..8].try_into().unwrap()),
    )
}

#[repr(C, align(4096))]
struct Frames<const N: usize>([[u8; PAGE_SIZE]; N]);

/// A page allocator over `N` leaked frames, the first `reserved` of which play the kernel image.
pub fn page_allocator<const N: usize>(reserved: usize) -> PageAllocator<N> {
    let frames: &'static mut Frames<N> = Box::leak(Box::new(Frames([[0; PAGE_SIZE]; N])));
    let base = NonNull::from(frames).cast::<u8>();
    let kernel_end = PhysAddr::new(base.addr().get() + reserved * PAGE_SIZE);
    // SAFETY:
    // The frames are leaked, so they live forever and nothing else has them.
    unsafe { PageAllocator::new(base, kernel_end) }
}

/// Copy a page's contents out.
pub fn page_contents<const N: usize>(alloc: &PageAllocator<N>, page: PhysAddr) -> Vec<u8> {
    // SAFETY:
    // The tests only look at pages they own, or at free pages while nothing else is running.
    unsafe { std::slice::from_raw_parts(alloc.as_ptr(page), PAGE_SIZE) }.to_vec()
}

struct Stderr;
impl Console for Stderr {
    fn write_str(&self, s: &str) {
        eprint!("{s}");
    }
}

/// Send kernel log lines to stderr. Safe to call from every test.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| logger::init_logger(&Stderr, log::LevelFilter::Debug));
}

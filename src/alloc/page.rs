//! Page-based allocation routines.
//!
//! Allocates whole pages of physical memory for user processes, kernel stacks, page-table pages,
//! and pipe buffers. Every page carries a reference count so the virtual-memory code can map one
//! physical page into several address spaces and copy it only when one of them writes.
//!
//! # Lock order
//! The reference table lock comes before the free list lock. [`PageAllocator::resolve_write`]
//! takes the free list while holding the table; nothing takes them the other way round.
//! [`PageAllocator::alloc`] and [`PageAllocator::free`] each hold only one at a time.

use core::ptr::NonNull;

use bytemuck::{Pod, Zeroable};

use super::{PAGE_SIZE, PhysAddr};
use crate::{error::OutOfMemory, sync::KSpinLock};

/// The byte freshly allocated pages are filled with, to catch reads of uninitialized memory.
pub const ALLOC_JUNK: u8 = 0x05;

/// The byte freed pages are filled with, to catch dangling references.
pub const FREE_JUNK: u8 = 0x01;

/// A fixed pool of `NFRAMES` physical pages, starting at a page-aligned base address.
///
/// Frames below the end of the kernel image are part of the reference table but are never handed
/// out.
pub struct PageAllocator<const NFRAMES: usize> {
    /// Frame 0. Every page pointer is derived from this one.
    base: NonNull<u8>,
    /// The first page that is actually managed.
    start: PhysAddr,
    free: KSpinLock<FreeList>,
    /// References to each frame. A frame is on the free list iff its count is 0.
    refs: KSpinLock<[u32; NFRAMES]>,
}
impl<const NFRAMES: usize> PageAllocator<NFRAMES> {
    /// Take over the pages from `kernel_end` (rounded up) to the end of the region at `base`.
    ///
    /// # Safety
    /// `base` must be page-aligned and valid for reads and writes of `NFRAMES * PAGE_SIZE` bytes
    /// for as long as the allocator, or any page it hands out, is in use. Nothing else may use
    /// the memory from `kernel_end` to the end of that region.
    pub unsafe fn new(base: NonNull<u8>, kernel_end: PhysAddr) -> Self {
        let base_addr = PhysAddr::new(base.addr().get());
        assert!(base_addr.is_page_aligned(), "kinit: base {base_addr} not page aligned");
        let this = Self {
            base,
            start: kernel_end.page_round_up().max(base_addr),
            free: KSpinLock::new(FreeList { head: None, len: 0 }),
            // Every frame starts out held once, so freeing a managed page brings it to zero.
            refs: KSpinLock::new([1; NFRAMES]),
        };
        assert!(this.start <= this.end(), "kinit: kernel ends past the managed region");

        let mut page = this.start;
        while page < this.end() {
            this.free(page);
            page = page + PAGE_SIZE;
        }
        log::info!(
            "kinit: {} pages free in {}..{}",
            this.free_pages(),
            this.start,
            this.end(),
        );
        this
    }

    /// Allocate one page of physical memory.
    ///
    /// The page comes back filled with [`ALLOC_JUNK`] and a reference count of 1.
    pub fn alloc(&self) -> Result<PhysAddr, OutOfMemory> {
        let popped = self.pop(&mut self.free.lock());
        let Some(page) = popped else {
            log::warn!("kalloc: out of memory");
            return Err(OutOfMemory);
        };
        // SAFETY:
        // The page just came off the free list, so nothing else refers to it.
        unsafe { self.frame_ptr(page).write_bytes(ALLOC_JUNK, 1) };

        let mut refs = self.refs.lock();
        let count = &mut refs[self.index(page)];
        debug_assert_eq!(*count, 0, "kalloc: free page {page} was referenced");
        *count = 1;
        Ok(page)
    }

    /// Allocate one page and erase it.
    pub fn alloc_zeroed(&self) -> Result<PhysAddr, OutOfMemory> {
        let page = self.alloc()?;
        // SAFETY:
        // We just allocated the page, so we're its only owner.
        unsafe { self.frame_ptr(page).write_bytes(0, 1) };
        Ok(page)
    }

    /// Drop one reference to the page, returning it to the free list if that was the last one.
    ///
    /// # Panics
    /// Panics if `page` isn't a page-aligned address in the managed range, or isn't referenced.
    pub fn free(&self, page: PhysAddr) {
        let idx = self.check(page, "kfree");
        {
            let mut refs = self.refs.lock();
            let count = &mut refs[idx];
            assert_allocated(*count, page, "kfree");
            *count -= 1;
            if *count > 0 {
                return;
            }
        }

        // Fill with junk to catch dangling refs.
        // SAFETY:
        // The count reached zero, so no one else owns the page and it isn't on the free list yet.
        unsafe { self.frame_ptr(page).write_bytes(FREE_JUNK, 1) };
        let mut list = self.free.lock();
        self.push(&mut list, page);
    }

    /// Add a reference to an allocated page, for a second owner mapping it.
    ///
    /// # Panics
    /// Panics if `page` isn't a page-aligned address in the managed range, or isn't allocated.
    pub fn share(&self, page: PhysAddr) {
        let idx = self.check(page, "kshare");
        let mut refs = self.refs.lock();
        assert_allocated(refs[idx], page, "kshare");
        refs[idx] += 1;
    }

    /// Get a page the caller may write to in place of `page`.
    ///
    /// If the caller is the only owner, that's `page` itself. Otherwise the caller's reference
    /// moves to a fresh copy, which is returned; the caller must remap to it.
    ///
    /// # Panics
    /// Panics if `page` isn't a page-aligned address in the managed range, or isn't allocated.
    pub fn resolve_write(&self, page: PhysAddr) -> Result<PhysAddr, OutOfMemory> {
        let idx = self.check(page, "kcopy");
        let mut refs = self.refs.lock();
        assert_allocated(refs[idx], page, "kcopy");
        if refs[idx] == 1 {
            return Ok(page);
        }

        let popped = self.pop(&mut self.free.lock());
        let Some(copy) = popped else {
            drop(refs);
            log::warn!("kcopy: out of memory copying {page}");
            return Err(OutOfMemory);
        };
        // SAFETY:
        // `copy` just came off the free list, so it's ours and distinct from `page`. The sharers
        // of `page` only read it until it's resolved.
        unsafe { core::ptr::copy_nonoverlapping(self.frame_ptr(page), self.frame_ptr(copy), 1) };
        refs[self.index(copy)] = 1;
        refs[idx] -= 1;
        let sharers = refs[idx];
        drop(refs);
        log::debug!("kcopy: {page} -> {copy}, {sharers} sharers left");
        Ok(copy)
    }

    /// The number of references to `page`.
    ///
    /// # Panics
    /// Panics if `page` isn't a page-aligned address in the managed range.
    #[must_use]
    pub fn refcount(&self, page: PhysAddr) -> u32 {
        let idx = self.check(page, "krefcount");
        self.refs.lock()[idx]
    }

    /// The number of pages on the free list.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.free.lock().len
    }

    /// The first managed page.
    #[must_use]
    pub fn start(&self) -> PhysAddr {
        self.start
    }

    /// The end of the managed range (exclusive).
    #[must_use]
    pub fn end(&self) -> PhysAddr {
        PhysAddr::new(self.base.addr().get()) + NFRAMES * PAGE_SIZE
    }

    /// Get a pointer through which the kernel can access `page`.
    ///
    /// Dereferencing it is only sound while the caller owns a reference to the page.
    ///
    /// # Panics
    /// Panics if `page` isn't a page-aligned address in the managed range.
    #[must_use]
    pub fn as_ptr(&self, page: PhysAddr) -> *mut u8 {
        self.check(page, "kptr");
        self.frame_ptr(page).cast()
    }

    /// Validate a page address handed in by a caller, returning its table index.
    fn check(&self, page: PhysAddr, op: &str) -> usize {
        assert!(
            page.is_page_aligned() && page >= self.start && page < self.end(),
            "{op}: bad page {page}, managing {}..{}",
            self.start,
            self.end(),
        );
        self.index(page)
    }

    fn index(&self, page: PhysAddr) -> usize {
        (page.addr() - self.base.addr().get()) / PAGE_SIZE
    }

    fn frame_ptr(&self, page: PhysAddr) -> *mut [u8; PAGE_SIZE] {
        self.base
            .as_ptr()
            .wrapping_byte_add(page.addr() - self.base.addr().get())
            .cast()
    }

    /// Push an unreferenced page onto the (locked) free list.
    fn push(&self, list: &mut FreeList, page: PhysAddr) {
        let run = FreeRun {
            next: list.head.map_or(0, PhysAddr::addr),
        };
        // SAFETY:
        // The page is unreferenced, so the allocator owns it.
        let frame = unsafe { &mut *self.frame_ptr(page) };
        *bytemuck::from_bytes_mut(&mut frame[..size_of::<FreeRun>()]) = run;
        list.head = Some(page);
        list.len += 1;
    }

    /// Pop a page off the (locked) free list.
    fn pop(&self, list: &mut FreeList) -> Option<PhysAddr> {
        let page = list.head?;
        // SAFETY:
        // Pages on the free list are owned by the allocator, and the list is locked.
        let frame = unsafe { &*self.frame_ptr(page) };
        let run: FreeRun = *bytemuck::from_bytes(&frame[..size_of::<FreeRun>()]);
        list.head = (run.next != 0).then_some(PhysAddr::new(run.next));
        list.len -= 1;
        Some(page)
    }
}

// SAFETY:
// The allocator owns the memory behind `base`; all access to it is coordinated by the locks and
// the reference counts.
unsafe impl<const NFRAMES: usize> Send for PageAllocator<NFRAMES> {}
// SAFETY:
// As above.
unsafe impl<const NFRAMES: usize> Sync for PageAllocator<NFRAMES> {}

/// Reference counts only reach zero through `free`, and a page at zero belongs to the free list.
fn assert_allocated(count: u32, page: PhysAddr, op: &str) {
    assert!(count > 0, "{op}: page {page} is not allocated");
}

/// The free pages, as a stack threaded through the pages themselves.
struct FreeList {
    head: Option<PhysAddr>,
    len: usize,
}

/// The link stored at the start of each free page.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
struct FreeRun {
    /// Address of the next free page, or 0 at the end of the list.
    next: usize,
}

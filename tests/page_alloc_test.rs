//! Testing of the physical page allocator.

mod common;

use std::{collections::HashSet, thread};

use kernel_core::{
    alloc::{ALLOC_JUNK, FREE_JUNK, PAGE_SIZE, PageAllocator, PhysAddr},
    error::{Error, ErrorKind, OutOfMemory},
};

const FRAMES: usize = 16;
const RESERVED: usize = 2;
const MANAGED: usize = FRAMES - RESERVED;

fn allocator() -> PageAllocator<FRAMES> {
    common::init_logging();
    common::page_allocator(RESERVED)
}

fn fill(alloc: &PageAllocator<FRAMES>, page: PhysAddr, byte: u8) {
    // SAFETY:
    // The tests own every page they fill.
    unsafe { alloc.as_ptr(page).write_bytes(byte, PAGE_SIZE) };
}

#[test]
fn test_init() {
    let alloc = allocator();
    assert_eq!(alloc.free_pages(), MANAGED);
    assert!(alloc.start().is_page_aligned());
    assert_eq!(alloc.end().addr() - alloc.start().addr(), MANAGED * PAGE_SIZE);
}

#[test]
fn test_alloc_fills_with_junk() {
    let alloc = allocator();
    let page = alloc.alloc().expect("should have free pages");
    assert!(page.is_page_aligned());
    assert!(page >= alloc.start() && page < alloc.end());
    assert_eq!(alloc.refcount(page), 1);
    assert_eq!(alloc.free_pages(), MANAGED - 1);
    assert!(
        common::page_contents(&alloc, page)
            .iter()
            .all(|&b| b == ALLOC_JUNK)
    );

    let zeroed = alloc.alloc_zeroed().expect("should have free pages");
    assert_ne!(zeroed, page);
    assert!(common::page_contents(&alloc, zeroed).iter().all(|&b| b == 0));
}

#[test]
fn test_free_fills_with_junk() {
    let alloc = allocator();
    let page = alloc.alloc().expect("should have free pages");
    fill(&alloc, page, 0x42);
    alloc.free(page);
    assert_eq!(alloc.free_pages(), MANAGED);

    // The first word holds the free list link.
    let contents = common::page_contents(&alloc, page);
    assert!(contents[size_of::<usize>()..].iter().all(|&b| b == FREE_JUNK));
}

#[test]
fn test_exhaustion_is_recoverable() {
    let alloc = allocator();
    let pages: Vec<_> = (0..MANAGED)
        .map(|_| alloc.alloc().expect("should have free pages"))
        .collect();
    let unique: HashSet<_> = pages.iter().copied().collect();
    assert_eq!(unique.len(), MANAGED, "page handed out twice");

    assert_eq!(alloc.alloc(), Err(OutOfMemory));
    assert_eq!(alloc.alloc_zeroed(), Err(OutOfMemory));
    assert_eq!(Error::from(OutOfMemory).kind, ErrorKind::OutOfMemory);

    alloc.free(pages[3]);
    assert_eq!(alloc.alloc(), Ok(pages[3]));
}

#[test]
fn test_shared_page_freed_by_last_owner() {
    let alloc = allocator();
    let page = alloc.alloc().expect("should have free pages");
    alloc.share(page);
    alloc.share(page);
    assert_eq!(alloc.refcount(page), 3);

    alloc.free(page);
    alloc.free(page);
    assert_eq!(alloc.refcount(page), 1);
    assert_eq!(alloc.free_pages(), MANAGED - 1, "page freed while still shared");

    alloc.free(page);
    assert_eq!(alloc.refcount(page), 0);
    assert_eq!(alloc.free_pages(), MANAGED);
}

#[test]
fn test_resolve_write_copies_shared_page() {
    let alloc = allocator();
    let page = alloc.alloc().expect("should have free pages");
    fill(&alloc, page, 0x37);
    alloc.share(page);

    let copy = alloc.resolve_write(page).expect("should have free pages");
    assert_ne!(copy, page);
    assert_eq!(alloc.refcount(page), 1);
    assert_eq!(alloc.refcount(copy), 1);
    assert_eq!(alloc.free_pages(), MANAGED - 2);
    assert_eq!(
        common::page_contents(&alloc, copy),
        common::page_contents(&alloc, page)
    );

    // The other owner is now alone and gets to keep the original.
    assert_eq!(alloc.resolve_write(page), Ok(page));
    assert_eq!(alloc.free_pages(), MANAGED - 2);
}

#[test]
fn test_resolve_write_keeps_unique_page() {
    let alloc = allocator();
    let page = alloc.alloc().expect("should have free pages");
    fill(&alloc, page, 0x11);

    assert_eq!(alloc.resolve_write(page), Ok(page));
    assert_eq!(alloc.refcount(page), 1);
    assert_eq!(alloc.free_pages(), MANAGED - 1);
    assert!(common::page_contents(&alloc, page).iter().all(|&b| b == 0x11));
}

#[test]
fn test_resolve_write_out_of_memory() {
    let alloc = allocator();
    let pages: Vec<_> = (0..MANAGED)
        .map(|_| alloc.alloc().expect("should have free pages"))
        .collect();
    alloc.share(pages[0]);

    assert_eq!(alloc.resolve_write(pages[0]), Err(OutOfMemory));
    assert_eq!(alloc.refcount(pages[0]), 2);
}

#[test]
#[should_panic(expected = "kfree: bad page")]
fn test_free_misaligned_panics() {
    let alloc = allocator();
    let page = alloc.alloc().expect("should have free pages");
    alloc.free(page + 8);
}

#[test]
#[should_panic(expected = "kfree: bad page")]
fn test_free_kernel_page_panics() {
    let alloc = allocator();
    alloc.free(PhysAddr::new(alloc.start().addr() - PAGE_SIZE));
}

#[test]
#[should_panic(expected = "kfree: bad page")]
fn test_free_past_end_panics() {
    let alloc = allocator();
    alloc.free(alloc.end());
}

#[test]
#[should_panic(expected = "is not allocated")]
fn test_double_free_panics() {
    let alloc = allocator();
    let page = alloc.alloc().expect("should have free pages");
    alloc.free(page);
    alloc.free(page);
}

#[test]
#[should_panic(expected = "kshare: page")]
fn test_share_free_page_panics() {
    let alloc = allocator();
    let page = alloc.alloc().expect("should have free pages");
    alloc.free(page);
    alloc.share(page);
}

#[test]
#[should_panic(expected = "kcopy: page")]
fn test_resolve_write_free_page_panics() {
    let alloc = allocator();
    let page = alloc.alloc().expect("should have free pages");
    alloc.free(page);
    let _ = alloc.resolve_write(page);
}

#[test]
#[should_panic(expected = "kptr: bad page")]
fn test_as_ptr_outside_region_panics() {
    let alloc = allocator();
    let below_base = alloc.start().addr() - (RESERVED + 1) * PAGE_SIZE;
    let _ = alloc.as_ptr(PhysAddr::new(below_base));
}

#[test]
fn test_concurrent_sharing() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 500;

    let alloc = allocator();
    thread::scope(|s| {
        for id in 0..THREADS {
            let alloc = &alloc;
            s.spawn(move || {
                for round in 0..ROUNDS {
                    let Ok(page) = alloc.alloc() else {
                        continue;
                    };
                    let byte = (id * ROUNDS + round) as u8;
                    fill(alloc, page, byte);
                    alloc.share(page);
                    match alloc.resolve_write(page) {
                        Ok(copy) => {
                            assert_ne!(copy, page);
                            assert!(
                                common::page_contents(alloc, copy)
                                    .iter()
                                    .all(|&b| b == byte)
                            );
                            alloc.free(copy);
                        }
                        // Someone else holds the remaining pages; give up our second share.
                        Err(OutOfMemory) => alloc.free(page),
                    }
                    alloc.free(page);
                }
            });
        }
    });

    assert_eq!(alloc.free_pages(), MANAGED);
}

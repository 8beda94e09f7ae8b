use core::alloc::Layout;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::vec::Vec;

use proptest::prelude::*;

use crate::allocator::{ALLOC_FILL, FREE_FILL, PageAllocator};
use crate::{PAGE_SIZE, is_page_aligned};

/// Hands back a page-aligned `[start, end)` range of `pages` pages.
///
/// The memory is leaked on purpose: the allocator under test holds
/// references into it for the rest of the process, as a kernel would.
fn arena(pages: usize) -> (usize, usize) {
    let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
    let start = unsafe { std::alloc::alloc(layout) } as usize;
    assert_ne!(start, 0, "arena allocation failed");
    (start, start + pages * PAGE_SIZE)
}

/// Builds an allocator with exactly `frames` allocatable pages.
///
/// One extra arena page carries the owner-count table, so `frames` must stay
/// below `PAGE_SIZE / 4`.
fn allocator_with(frames: usize) -> PageAllocator {
    assert!(frames + 1 < PAGE_SIZE / 4);
    let (start, end) = arena(frames + 1);
    let allocator = unsafe { PageAllocator::init(start, end) };
    assert_eq!(allocator.free_pages(), frames);
    allocator
}

fn alloc_addr(allocator: &PageAllocator) -> usize {
    allocator.allocate().expect("allocation failed").as_ptr() as usize
}

#[test]
fn boot_seeds_exactly_k_frames() {
    let k = 8;
    let allocator = allocator_with(k);

    let pages: Vec<usize> = (0..k).map(|_| alloc_addr(&allocator)).collect();
    assert_eq!(allocator.allocate(), None, "{k}+1-th allocation succeeded");

    // Freeing any one page re-enables exactly one further allocation.
    unsafe { allocator.free(pages[3]) };
    assert_eq!(alloc_addr(&allocator), pages[3]);
    assert_eq!(allocator.allocate(), None);
}

#[test]
fn live_allocations_never_alias() {
    let allocator = allocator_with(16);
    let mut live: Vec<usize> = Vec::new();

    while let Some(page) = allocator.allocate() {
        let addr = page.as_ptr() as usize;
        assert!(is_page_aligned(addr));
        assert!(allocator.managed_range().contains(&addr));
        assert!(!live.contains(&addr), "page {addr:#x} handed out twice");
        live.push(addr);
    }
    assert_eq!(live.len(), 16);
}

#[test]
fn round_trip_leaves_no_residue() {
    let allocator = allocator_with(2);

    let first = alloc_addr(&allocator);
    unsafe { core::ptr::write_bytes(first as *mut u8, 0xAB, PAGE_SIZE) };
    unsafe { allocator.free(first) };

    // Last freed, first reused.
    let second = alloc_addr(&allocator);
    assert_eq!(second, first);

    let content = unsafe { core::slice::from_raw_parts(second as *const u8, PAGE_SIZE) };
    assert!(
        content.iter().all(|byte| *byte == ALLOC_FILL),
        "stale bytes survived reallocation"
    );
}

#[test]
fn freed_page_is_junk_filled() {
    let allocator = allocator_with(2);

    let addr = alloc_addr(&allocator);
    unsafe { core::ptr::write_bytes(addr as *mut u8, 0xAB, PAGE_SIZE) };
    unsafe { allocator.free(addr) };

    // The free-list node occupies the first bytes of the page; everything
    // past it must carry the free-time fill pattern.
    let content = unsafe { core::slice::from_raw_parts(addr as *const u8, PAGE_SIZE) };
    assert!(content[16..].iter().all(|byte| *byte == FREE_FILL));
}

#[test]
fn shared_page_relists_on_last_owner_only() {
    let k = 4;
    let allocator = allocator_with(k);

    let addr = alloc_addr(&allocator);
    assert_eq!(allocator.ref_count(addr), 1);
    assert_eq!(allocator.increment_ref(addr), 2);
    assert_eq!(allocator.increment_ref(addr), 3);

    // Three owners: two frees and one plain decrement before the page may
    // rejoin the free list.
    unsafe { allocator.free(addr) };
    assert_eq!(allocator.free_pages(), k - 1);
    assert_eq!(allocator.decrement_ref(addr), 1);
    assert_eq!(allocator.free_pages(), k - 1);

    unsafe { allocator.free(addr) };
    assert_eq!(allocator.free_pages(), k);
    assert_eq!(allocator.ref_count(addr), 0);
}

#[test]
#[should_panic(expected = "invalid page address")]
fn misaligned_free_panics() {
    let allocator = allocator_with(2);
    let addr = alloc_addr(&allocator);
    unsafe { allocator.free(addr + 1) };
}

#[test]
#[should_panic(expected = "invalid page address")]
fn free_below_managed_range_panics() {
    let allocator = allocator_with(2);
    let below = allocator.managed_range().start - PAGE_SIZE;
    unsafe { allocator.free(below) };
}

#[test]
#[should_panic(expected = "invalid page address")]
fn free_at_ceiling_panics() {
    let allocator = allocator_with(2);
    let ceiling = allocator.managed_range().end;
    unsafe { allocator.free(ceiling) };
}

#[test]
#[should_panic(expected = "underflow")]
fn decrement_of_free_page_panics() {
    let allocator = allocator_with(2);
    let addr = alloc_addr(&allocator);
    unsafe { allocator.free(addr) };
    allocator.decrement_ref(addr);
}

#[test]
#[should_panic(expected = "underflow")]
fn double_free_panics() {
    let allocator = allocator_with(2);
    let addr = alloc_addr(&allocator);
    unsafe {
        allocator.free(addr);
        allocator.free(addr);
    }
}

#[test]
fn racing_allocations_get_one_winner() {
    let allocator = allocator_with(1);

    let winners = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| scope.spawn(|| allocator.allocate().map(|page| page.as_ptr() as usize)))
            .collect();
        handles
            .into_iter()
            .filter_map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(winners.len(), 1, "one page satisfied two allocations");
    assert_eq!(allocator.free_pages(), 0);
}

#[test]
fn concurrent_churn_loses_no_pages() {
    let k = 4;
    let allocator = allocator_with(k);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..500 {
                    if let Some(page) = allocator.allocate() {
                        unsafe { allocator.free(page.as_ptr() as usize) };
                    }
                }
            });
        }
    });

    assert_eq!(allocator.free_pages(), k);
}

/// The global surface is one-shot per process, so its whole lifecycle lives
/// in a single test: use-before-init is fatal, then init succeeds once, then
/// re-init is fatal.
#[test]
fn global_allocator_lifecycle() {
    assert!(
        catch_unwind(crate::allocate).is_err(),
        "allocate before init did not panic"
    );

    let (start, end) = arena(4);
    unsafe { crate::init_page_allocator(start, end) };

    let page = crate::allocate().expect("allocation failed");
    let addr = page.as_ptr() as usize;
    assert_eq!(crate::increment_ref(addr), 2);
    assert_eq!(crate::decrement_ref(addr), 1);
    assert_eq!(crate::ref_count(addr), 1);
    unsafe { crate::free(addr) };

    let reinit = catch_unwind(AssertUnwindSafe(|| unsafe {
        crate::init_page_allocator(start, end)
    }));
    assert!(reinit.is_err(), "double initialization did not panic");
}

proptest! {
    /// Random alloc/free interleavings: no live page is ever handed out
    /// twice, and every page is accounted for at every step.
    #[test]
    fn random_sequences_conserve_pages(ops in proptest::collection::vec(any::<u16>(), 1..200)) {
        let k = 8;
        let allocator = allocator_with(k);
        let mut live: Vec<usize> = Vec::new();

        for op in ops {
            if op % 2 == 0 {
                if let Some(page) = allocator.allocate() {
                    let addr = page.as_ptr() as usize;
                    prop_assert!(!live.contains(&addr));
                    live.push(addr);
                } else {
                    prop_assert_eq!(live.len(), k);
                }
            } else if !live.is_empty() {
                let addr = live.swap_remove(op as usize / 2 % live.len());
                unsafe { allocator.free(addr) };
            }
            prop_assert_eq!(live.len() + allocator.free_pages(), k);
        }

        for addr in live.drain(..) {
            unsafe { allocator.free(addr) };
        }
        prop_assert_eq!(allocator.free_pages(), k);
    }
}

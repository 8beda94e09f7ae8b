//! The page-frame allocator core and its global instance.
//!
//! Pages are handed out from an intrusive free list and tracked by a
//! per-page owner count, so address-space duplication can share a page
//! (copy-on-write) instead of copying it: the duplicating side calls
//! [`increment_ref`], and the page only returns to the free list on the
//! [`free`] that drops its count back to zero.
//!
//! Out-of-memory is the one recoverable condition and surfaces as `None`
//! from [`allocate`]. Everything else that can go wrong here (freeing a
//! misaligned or foreign address, decrementing a count that already reads
//! zero, re-initializing the allocator) signals kernel corruption and
//! panics immediately.

use core::ptr::NonNull;
use core::sync::atomic::AtomicU32;

use conquer_once::spin::OnceCell;
use log::{debug, info};
use spin::Mutex;

use crate::freelist::FreeList;
use crate::refcount::RefCountTable;
use crate::{PAGE_SIZE, is_page_aligned, page_round_up};

/// Byte pattern written over a page when it is allocated.
pub const ALLOC_FILL: u8 = 0x05;
/// Byte pattern written over a page when it returns to the free list.
///
/// Distinct from [`ALLOC_FILL`] so a stale read through a dangling mapping
/// shows which side of the lifecycle the page is on.
pub const FREE_FILL: u8 = 0x01;

/// A page-frame allocator over one contiguous physical range.
///
/// All operations take `&self`; the free list sits behind a spin mutex and
/// the owner counts are atomics, so one instance serves every core.
#[derive(Debug)]
pub struct PageAllocator {
    freelist: Mutex<FreeList>,
    refs: RefCountTable,
    /// First allocatable page.
    start: usize,
    /// One past the last allocatable page.
    limit: usize,
}

impl PageAllocator {
    /// Creates an allocator owning the physical range `[start, end)`.
    ///
    /// `start` is rounded up to a page boundary. The owner-count table is
    /// carved from the head of the range; every remaining full page is then
    /// seeded onto the free list through the same [`free`](Self::free) path
    /// used at steady state, so initialization runs under steady-state
    /// invariant checks.
    ///
    /// # Safety
    ///
    /// The caller must hand over exclusive ownership of `[start, end)`:
    /// the memory must be valid for reads and writes for the rest of the
    /// program and nothing outside this allocator may touch it except
    /// through pages returned by [`allocate`](Self::allocate).
    pub unsafe fn init(start: usize, end: usize) -> Self {
        let base = page_round_up(start);
        let total_pages = end.saturating_sub(base) / PAGE_SIZE;
        let table_pages = (total_pages * size_of::<AtomicU32>()).div_ceil(PAGE_SIZE);
        let alloc_start = base + table_pages * PAGE_SIZE;
        let alloc_pages = total_pages - table_pages;

        let allocator = PageAllocator {
            freelist: Mutex::new(FreeList::new()),
            refs: unsafe { RefCountTable::carve(base, alloc_start, alloc_pages) },
            start: alloc_start,
            limit: alloc_start + alloc_pages * PAGE_SIZE,
        };
        unsafe {
            allocator.populate_range(alloc_start, end);
        }

        debug!(
            "page allocator initialized with {} frames",
            allocator.free_pages()
        );

        allocator
    }

    /// Seeds every full page in `[start, end)` onto the free list.
    unsafe fn populate_range(&self, start: usize, end: usize) {
        let mut page = page_round_up(start);
        while page + PAGE_SIZE <= end {
            // Seed a single owner so the shared free path's decrement lands
            // exactly on zero.
            self.refs.set(page, 1);
            unsafe { self.free(page) };
            page += PAGE_SIZE;
        }
    }

    /// Allocates one page and returns its address, or `None` if no page is
    /// free. The page comes back with an owner count of exactly 1 and every
    /// byte set to [`ALLOC_FILL`].
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let page = {
            let mut freelist = self.freelist.lock();
            let page = freelist.pop()?;
            // Sole initial owner. The count must be in place before the page
            // becomes visible outside the allocator.
            self.refs.set(page.as_ptr() as usize, 1);
            page
        };

        // Fill outside the lock; nobody else can see this page yet.
        unsafe { core::ptr::write_bytes(page.as_ptr(), ALLOC_FILL, PAGE_SIZE) };
        Some(page)
    }

    /// Drops one owner of the page at `addr`.
    ///
    /// If other owners remain (a copy-on-write sibling, for instance) this
    /// returns immediately and the page stays allocated. On the last owner
    /// the page is filled with [`FREE_FILL`] and pushed back onto the free
    /// list.
    ///
    /// Panics if `addr` is misaligned or outside the managed range: a bad
    /// address here means some other part of the kernel is corrupt, and
    /// mutating the free list from it would spread the damage.
    ///
    /// # Safety
    ///
    /// `addr` must be a page previously returned by
    /// [`allocate`](Self::allocate) on this allocator, and the caller must
    /// actually hold the ownership it is giving up: no reads or writes
    /// through this caller's mapping may happen after the call.
    pub unsafe fn free(&self, addr: usize) {
        if !is_page_aligned(addr) || addr < self.start || addr >= self.limit {
            panic!("free: invalid page address {addr:#x}");
        }

        if self.refs.decrement(addr) > 0 {
            return;
        }

        // Explicit reset rather than trusting the decrement result alone.
        self.refs.set(addr, 0);

        // Fill with junk to catch dangling accesses.
        unsafe { core::ptr::write_bytes(addr as *mut u8, FREE_FILL, PAGE_SIZE) };

        let page = NonNull::new(addr as *mut u8).expect("failed to convert to NonNull");
        let mut freelist = self.freelist.lock();
        unsafe { freelist.push(page) };
    }

    /// Adds an owner to the page at `addr` and returns the new count.
    ///
    /// Called by address-space duplication when it shares a page instead of
    /// copying it.
    pub fn increment_ref(&self, addr: usize) -> u32 {
        self.refs.increment(addr)
    }

    /// Removes an owner from the page at `addr` and returns the new count.
    ///
    /// Unlike [`free`](Self::free) this never relists the page, so it is
    /// only for tearing down one of several mappings; the owner that drops
    /// the count to zero must go through `free` or the page leaks.
    pub fn decrement_ref(&self, addr: usize) -> u32 {
        self.refs.decrement(addr)
    }

    /// Returns a diagnostic snapshot of the owner count for `addr`.
    ///
    /// May be stale the instant it is read; never base a control decision
    /// on it (see [`RefCountTable::get`]).
    pub fn ref_count(&self, addr: usize) -> u32 {
        self.refs.get(addr)
    }

    /// Number of pages currently on the free list.
    pub fn free_pages(&self) -> usize {
        self.freelist.lock().len()
    }

    /// The range of addresses this allocator hands out pages from.
    pub fn managed_range(&self) -> core::ops::Range<usize> {
        self.start..self.limit
    }
}

/// The global page allocator, set once by [`init_page_allocator`].
pub static PAGE_ALLOCATOR: OnceCell<PageAllocator> = OnceCell::uninit();

/// Initializes the global page allocator over `[start, end)`.
///
/// # Safety
///
/// Same contract as [`PageAllocator::init`].
///
/// # Panics
///
/// Panics if the allocator was already initialized: re-initializing would
/// duplicate every seeded page.
pub unsafe fn init_page_allocator(start: usize, end: usize) {
    if PAGE_ALLOCATOR
        .try_init_once(|| unsafe { PageAllocator::init(start, end) })
        .is_err()
    {
        panic!("page allocator already initialized");
    }
    info!("page allocator initialized");
}

fn global() -> &'static PageAllocator {
    PAGE_ALLOCATOR
        .get()
        .expect("page allocator used before initialization")
}

/// Allocates one page from the global allocator. See
/// [`PageAllocator::allocate`].
pub fn allocate() -> Option<NonNull<u8>> {
    global().allocate()
}

/// Frees one owner of `addr` in the global allocator.
///
/// # Safety
///
/// Same contract as [`PageAllocator::free`].
pub unsafe fn free(addr: usize) {
    unsafe { global().free(addr) }
}

/// See [`PageAllocator::increment_ref`].
pub fn increment_ref(addr: usize) -> u32 {
    global().increment_ref(addr)
}

/// See [`PageAllocator::decrement_ref`].
pub fn decrement_ref(addr: usize) -> u32 {
    global().decrement_ref(addr)
}

/// See [`PageAllocator::ref_count`].
pub fn ref_count(addr: usize) -> u32 {
    global().ref_count(addr)
}

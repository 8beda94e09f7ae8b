//! Per-page owner counts.
//!
//! A dense table with one entry per managed page, indexed by
//! `(addr - base) / PAGE_SIZE`. Entries are plain atomics mutated through
//! compare-and-exchange retry loops, so no lock guards the table: concurrent
//! updates to one page serialize through the hardware, and updates to
//! different pages never contend.
//!
//! A count of zero means the page is on the free list (or not yet seeded);
//! a count of n ≥ 1 means n callers currently own the page. Decrementing an
//! entry that already reads zero is a corruption of that invariant and
//! panics rather than wrapping.

use core::slice;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{PAGE_SIZE, is_page_aligned};

/// Owner-count table covering one contiguous run of pages.
#[derive(Debug)]
pub struct RefCountTable {
    /// Address of the first page the table covers.
    base: usize,
    entries: &'static [AtomicU32],
}

impl RefCountTable {
    /// Builds a table over `pages` entries stored at `storage`.
    ///
    /// All entries are reset to zero.
    ///
    /// # Safety
    ///
    /// `storage` must point to at least `pages * size_of::<AtomicU32>()`
    /// bytes of suitably aligned memory that nothing else reads or writes
    /// for the rest of the program.
    pub(crate) unsafe fn carve(storage: usize, base: usize, pages: usize) -> Self {
        let entries = unsafe {
            core::ptr::write_bytes(storage as *mut u8, 0, pages * size_of::<AtomicU32>());
            slice::from_raw_parts(storage as *const AtomicU32, pages)
        };
        RefCountTable { base, entries }
    }

    /// Number of pages the table covers.
    pub fn pages(&self) -> usize {
        self.entries.len()
    }

    /// Resolves `addr` to its table entry, panicking on a misaligned or
    /// out-of-range address.
    fn entry(&self, addr: usize) -> &AtomicU32 {
        if !is_page_aligned(addr) {
            panic!("refcount: misaligned page address {addr:#x}");
        }
        let index = addr
            .checked_sub(self.base)
            .map(|offset| offset / PAGE_SIZE)
            .filter(|index| *index < self.entries.len());
        match index {
            Some(index) => &self.entries[index],
            None => panic!("refcount: page address {addr:#x} outside managed range"),
        }
    }

    /// Adds an owner to the page at `addr` and returns the new count.
    ///
    /// Panics if the count would overflow; a count anywhere near `u32::MAX`
    /// means the caller is leaking references.
    pub fn increment(&self, addr: usize) -> u32 {
        let entry = self.entry(addr);
        let mut current = entry.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(1) else {
                panic!("refcount: overflow on page {addr:#x}");
            };
            match entry.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Removes an owner from the page at `addr` and returns the new count.
    ///
    /// Panics if the count already reads zero; the check runs against the
    /// freshly observed value on every retry, so the count can never wrap
    /// below zero no matter how the loop interleaves with other cores.
    pub fn decrement(&self, addr: usize) -> u32 {
        let entry = self.entry(addr);
        let mut current = entry.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                panic!("refcount: underflow on page {addr:#x}");
            }
            let next = current - 1;
            match entry.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns a snapshot of the count for the page at `addr`.
    ///
    /// Under concurrent mutation the value may be stale the instant it is
    /// read. It is a diagnostic, never an input to a control decision; code
    /// that acts on the count must use [`increment`](Self::increment) or
    /// [`decrement`](Self::decrement) and look at their return value.
    pub fn get(&self, addr: usize) -> u32 {
        self.entry(addr).load(Ordering::Relaxed)
    }

    /// Overwrites the count for the page at `addr`.
    pub(crate) fn set(&self, addr: usize, count: u32) {
        self.entry(addr).store(count, Ordering::Release);
    }
}

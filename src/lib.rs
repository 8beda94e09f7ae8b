/*
Copyright © 2024–2025 Mako and JayAndJef

This file is part of palloc.

palloc is free software: you can redistribute it and/or modify it under the terms of the GNU General
Public License as published by the Free Software Foundation, either version 3 of the License, or (at
your option) any later version.

palloc is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the
implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public
License for more details.

You should have received a copy of the GNU General Public License along with palloc. If not, see
<https://www.gnu.org/licenses/>.
*/

//! Physical page-frame allocator with copy-on-write reference counting.
//!
//! This crate provides:
//! - A free-list pool of 4 KiB physical pages, last freed first reused
//! - A per-page owner count so duplicated address spaces can share pages
//! - Boot-time seeding of an arbitrary physical range
//!
//! The allocator is handed a raw physical range once at boot and is the sole
//! authority over it afterwards. A page leaves the free list with exactly one
//! owner, gains and loses owners through [`increment_ref`]/[`decrement_ref`],
//! and returns to the free list on the call that drops its count to zero.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod allocator;
pub mod freelist;
pub mod refcount;

#[cfg(test)]
mod tests;

pub use allocator::{
    ALLOC_FILL, FREE_FILL, PAGE_ALLOCATOR, PageAllocator, allocate, decrement_ref, free,
    increment_ref, init_page_allocator, ref_count,
};

use static_assertions::const_assert;

/// Size of one page frame in bytes, the sole granularity of allocation.
pub const PAGE_SIZE: usize = 4096;

const_assert!(PAGE_SIZE.is_power_of_two());

/// Rounds `addr` up to the next page boundary.
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Checks whether `addr` sits on a page boundary.
pub const fn is_page_aligned(addr: usize) -> bool {
    addr % PAGE_SIZE == 0
}

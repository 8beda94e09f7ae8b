//! Intrusive free list of page frames.
//!
//! Each free page stores the list node in its own first bytes, so the list
//! costs no memory beyond the pages it tracks. The head is the most recently
//! freed page, which is also the first one handed back out.

use core::ptr::NonNull;

use crate::PAGE_SIZE;
use static_assertions::const_assert;

// A node must fit inside the page it lives in.
const_assert!(size_of::<FrameNode>() <= PAGE_SIZE);

/// A linked list of free page frames.
#[derive(Clone, Copy, Debug)]
pub struct FreeList {
    head: Option<NonNull<FrameNode>>,
    len: usize,
}

unsafe impl Send for FreeList {}

impl Default for FreeList {
    fn default() -> Self {
        FreeList::new()
    }
}

impl FreeList {
    /// Creates a new empty free list.
    pub const fn new() -> Self {
        FreeList { head: None, len: 0 }
    }

    /// Pushes a page onto the free list.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive ownership of the page starting at
    /// `page`, and the page must stay untouched until it is popped again:
    /// the list writes its node over the first bytes of the page.
    pub unsafe fn push(&mut self, page: NonNull<u8>) {
        let node = page.cast::<FrameNode>();
        unsafe {
            node.write(FrameNode { next: self.head });
        }
        self.head = Some(node);
        self.len += 1;
    }

    /// Pops the most recently freed page from the list.
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        if let Some(node) = self.head {
            self.head = unsafe { node.as_ref().next };
            self.len -= 1;
            Some(node.cast())
        } else {
            None
        }
    }

    /// Checks whether a page is currently on the list.
    ///
    /// This walks the whole list and takes O(n) time; it exists for
    /// diagnostics and tests, not for the allocation path.
    pub fn contains(&self, page: NonNull<u8>) -> bool {
        let mut current = self.head;
        while let Some(node) = current {
            if node == page.cast::<FrameNode>() {
                return true;
            }

            current = unsafe { node.as_ref().next };
        }
        false
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A node in the linked list of free pages.
#[derive(Clone, Copy, Debug)]
struct FrameNode {
    next: Option<NonNull<FrameNode>>,
}

unsafe impl Send for FrameNode {}

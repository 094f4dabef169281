// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame allocation
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator (trait), FramePool, Page
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: Free frames form an intrusive singly linked list threaded through the
//!             frames themselves; handed-out frames are zero filled; freeing a frame
//!             outside the pool or off a page boundary is a kernel bug

use core::ptr::NonNull;
#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::{PhysAddr, PAGE_SIZE};

/// Source of zeroed physical frames.
pub trait FrameAllocator: Send + Sync {
    /// Returns a zero-filled frame, or `None` when memory is exhausted.
    fn alloc_zeroed(&self) -> Option<PhysAddr>;
    /// Returns a frame previously handed out by `alloc_zeroed`.
    fn free(&self, pa: PhysAddr);
    /// Number of frames currently available.
    fn free_frames(&self) -> usize;
}

/// One page of backing storage.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct Page(pub [u8; PAGE_SIZE]);

impl Page {
    pub const fn zeroed() -> Self {
        Self([0; PAGE_SIZE])
    }
}

static_assertions::const_assert_eq!(core::mem::size_of::<Page>(), PAGE_SIZE);
static_assertions::const_assert_eq!(core::mem::align_of::<Page>(), PAGE_SIZE);

struct Run {
    next: Option<NonNull<Run>>,
}

struct FreeList {
    head: Option<NonNull<Run>>,
    free: usize,
}

// SAFETY: the list is only reached through the pool mutex.
unsafe impl Send for FreeList {}

/// Frame pool over one contiguous, exclusively owned physical range.
pub struct FramePool {
    list: Mutex<FreeList>,
    start: PhysAddr,
    end: PhysAddr,
    #[cfg(feature = "failpoints")]
    fail_next_alloc: AtomicBool,
}

impl FramePool {
    /// Builds a pool over `[start, end)`, rounded inward to page boundaries.
    ///
    /// # Safety
    /// The range must be identity-mapped writable memory that nothing else uses for
    /// the lifetime of the pool.
    pub unsafe fn from_range(start: PhysAddr, end: PhysAddr) -> Self {
        let start = super::page_round_up(start);
        let end = super::page_round_down(end);
        let pool = Self {
            list: Mutex::new(FreeList { head: None, free: 0 }),
            start,
            end: end.max(start),
            #[cfg(feature = "failpoints")]
            fail_next_alloc: AtomicBool::new(false),
        };
        let mut pa = start;
        while pa < pool.end {
            pool.push(pa);
            pa += PAGE_SIZE;
        }
        log_debug!(target: "mm", "frame pool [{:#x}, {:#x}) frames={}", start, pool.end, pool.free_frames());
        pool
    }

    /// Builds a pool over statically owned pages.
    pub fn from_pages(pages: &'static mut [Page]) -> Self {
        let start = pages.as_mut_ptr() as usize;
        let end = start + pages.len() * PAGE_SIZE;
        // SAFETY: the exclusive 'static borrow hands the pages to the pool for good.
        unsafe { Self::from_range(start, end) }
    }

    /// Total frames managed by the pool.
    pub fn capacity(&self) -> usize {
        (self.end - self.start) / PAGE_SIZE
    }

    pub fn contains(&self, pa: PhysAddr) -> bool {
        pa >= self.start && pa < self.end
    }

    /// Makes the next `alloc_zeroed` call report exhaustion.
    #[cfg(feature = "failpoints")]
    pub fn fail_next_alloc(&self) {
        self.fail_next_alloc.store(true, Ordering::SeqCst);
    }

    fn push(&self, pa: PhysAddr) {
        let run = pa as *mut Run;
        let mut list = self.list.lock();
        // SAFETY: `pa` is a free, page-aligned frame inside the pool.
        unsafe { run.write(Run { next: list.head }) };
        list.head = NonNull::new(run);
        list.free += 1;
    }
}

impl FrameAllocator for FramePool {
    fn alloc_zeroed(&self) -> Option<PhysAddr> {
        #[cfg(feature = "failpoints")]
        if self.fail_next_alloc.swap(false, Ordering::SeqCst) {
            return None;
        }
        let run = {
            let mut list = self.list.lock();
            let run = list.head?;
            // SAFETY: list entries are free frames written by `push`.
            list.head = unsafe { run.as_ref().next };
            list.free -= 1;
            run
        };
        let pa = run.as_ptr() as usize;
        // SAFETY: the frame was just unlinked and is exclusively ours.
        unsafe { core::ptr::write_bytes(pa as *mut u8, 0, PAGE_SIZE) };
        Some(pa)
    }

    fn free(&self, pa: PhysAddr) {
        if pa % PAGE_SIZE != 0 || !self.contains(pa) {
            panic!("frame free: {:#x} outside pool", pa);
        }
        self.push(pa);
    }

    fn free_frames(&self) -> usize {
        self.list.lock().free
    }
}

static_assertions::assert_impl_all!(FramePool: Send, Sync);

/// Pool over freshly leaked host pages.
#[cfg(test)]
pub(crate) fn test_pool(frames: usize) -> FramePool {
    use alloc::vec;
    let pages = vec![Page::zeroed(); frames].leak();
    FramePool::from_pages(pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_zeroed_and_counted() {
        let pool = test_pool(3);
        assert_eq!(pool.capacity(), 3);
        let pa = pool.alloc_zeroed().unwrap();
        assert_eq!(pool.free_frames(), 2);
        // SAFETY: `pa` is an allocated host page owned by this test.
        unsafe {
            core::ptr::write_bytes(pa as *mut u8, 0xa5, PAGE_SIZE);
        }
        pool.free(pa);
        let again = pool.alloc_zeroed().unwrap();
        assert_eq!(again, pa);
        // SAFETY: as above.
        let bytes = unsafe { core::slice::from_raw_parts(again as *const u8, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = test_pool(1);
        assert!(pool.alloc_zeroed().is_some());
        assert_eq!(pool.alloc_zeroed(), None);
        assert_eq!(pool.free_frames(), 0);
    }

    #[test]
    #[should_panic(expected = "outside pool")]
    fn foreign_free_panics() {
        let pool = test_pool(1);
        pool.free(0x1000);
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn fail_next_alloc_is_one_shot() {
        let pool = test_pool(2);
        pool.fail_next_alloc();
        assert_eq!(pool.alloc_zeroed(), None);
        assert!(pool.alloc_zeroed().is_some());
    }
}

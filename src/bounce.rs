//! Bounce buffers: a fixed-count, page-aligned scratch pool used when the
//! logical source/target cannot be the caller's target memory directly
//! (spec §3, §4.5). Grounded on the host's `io::buffer_pool::BufferPool` /
//! `AlignedBuffer` pair, simplified to the free-list-of-indices shape this
//! crate's handle pool already uses elsewhere.

use parking_lot::{Condvar, Mutex};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::ptr::NonNull;

use crate::error::{AioError, Result};

const PAGE_SIZE: usize = 4096;

/// Identifies one bounce buffer slot, analogous to [`HandleRef`] but
/// without a generation: a bounce buffer is only ever referenced while
/// associated with a live handle, which already carries its own generation
/// check (spec §4.5 "All buffers attached to a handle are released on
/// reclaim").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BounceBufferId(pub(crate) u32);

struct Slot {
    ptr: NonNull<u8>,
}

unsafe impl Send for Slot {}

/// Global pool of page-aligned scratch buffers, handed out through a
/// process-wide free list (spec §9 Open Question: "treat the pool as
/// global, handed out through per-backend caches" — this crate keeps the
/// free list itself global and lets [`crate::backend::Backend`] cache at
/// most one handed-out buffer per the ≤1 invariant, spec §3 invariant 2).
pub struct BouncePool {
    slots: Vec<Slot>,
    free: Mutex<VecDeque<u32>>,
    wait_cv: Condvar,
}

impl BouncePool {
    pub fn new(count: usize) -> Result<Self> {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE)
            .map_err(|e| AioError::internal(format!("invalid bounce buffer layout: {e}")))?;
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let ptr = unsafe { alloc_zeroed(layout) };
            let ptr = NonNull::new(ptr)
                .ok_or_else(|| AioError::internal("bounce buffer allocation failed"))?;
            slots.push(Slot { ptr });
        }
        let free = (0..count as u32).collect();
        Ok(Self { slots, free: Mutex::new(free), wait_cv: Condvar::new() })
    }

    /// Non-blocking acquire. Returns `None` if the pool is exhausted.
    pub fn try_acquire(&self) -> Option<BounceBufferId> {
        self.free.lock().pop_front().map(BounceBufferId)
    }

    /// Blocking acquire (spec §4.5 "`acquire()` is blocking"). `flush` is
    /// called once, with the free-list lock released, if the pool is empty
    /// on the first attempt — giving the caller a chance to force local
    /// submission of staged I/O that might free a buffer, mirroring the
    /// handle pool's "staged-flush before blocking" discipline (spec §4.3).
    pub fn acquire(&self, mut flush: impl FnMut()) -> BounceBufferId {
        if let Some(id) = self.try_acquire() {
            return id;
        }
        flush();
        let mut guard = self.free.lock();
        loop {
            if let Some(index) = guard.pop_front() {
                return BounceBufferId(index);
            }
            self.wait_cv.wait(&mut guard);
        }
    }

    pub fn release(&self, id: BounceBufferId) {
        let mut guard = self.free.lock();
        guard.push_back(id.0);
        drop(guard);
        self.wait_cv.notify_one();
    }

    pub fn as_mut_slice(&self, id: BounceBufferId) -> &mut [u8] {
        // Safety: callers only hold a `BounceBufferId` while it is
        // associated with exactly one handle (enforced by `BouncePool`
        // hand-out discipline and the ≤1-handed-out-per-backend invariant),
        // so no two callers observe the same slot concurrently.
        unsafe {
            std::slice::from_raw_parts_mut(self.slots[id.0 as usize].ptr.as_ptr(), PAGE_SIZE)
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for BouncePool {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        for slot in &self.slots {
            unsafe {
                dealloc(slot.ptr.as_ptr(), layout);
            }
        }
    }
}

// Safety: buffers are handed out exclusively and released explicitly; the
// pool's internal bookkeeping is behind `Mutex`/`Condvar`.
unsafe impl Sync for BouncePool {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_round_trip() {
        let pool = BouncePool::new(2).unwrap();
        assert_eq!(pool.available(), 2);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        pool.release(a);
        assert_eq!(pool.available(), 1);
        pool.release(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn acquire_blocks_until_release_calls_flush_once() {
        let pool = std::sync::Arc::new(BouncePool::new(1).unwrap());
        let a = pool.try_acquire().unwrap();
        let pool2 = pool.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            pool2.release(a);
        });
        let flushed = std::sync::atomic::AtomicBool::new(false);
        let got = pool.acquire(|| flushed.store(true, std::sync::atomic::Ordering::SeqCst));
        assert!(flushed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(got.0, 0);
        handle.join().unwrap();
    }

    #[test]
    fn buffer_memory_is_page_sized_and_writable() {
        let pool = BouncePool::new(1).unwrap();
        let id = pool.try_acquire().unwrap();
        let slice = pool.as_mut_slice(id);
        assert_eq!(slice.len(), PAGE_SIZE);
        slice[0] = 0xAB;
        assert_eq!(pool.as_mut_slice(id)[0], 0xAB);
    }
}

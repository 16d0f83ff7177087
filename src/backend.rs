//! Per-backend state (spec §3 "Per-Backend State"): the idle handle free
//! list, the idle bounce-buffer cache, the "currently handed out" slots
//! enforcing invariants 1 and 2, and the staged-submission array.
//!
//! "Backend" here is an OS thread registered with the engine, substituting
//! for spec's OS process per the explicit license in spec §9.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

use crate::bounce::BounceBufferId;
use crate::error::{AioError, Result};

pub type BackendId = u32;

/// A backend's private slice of the global handle array plus its staging
/// state. Idle/bounce free lists here are per-backend and need no locking
/// contention across backends (spec §5 "Idle/bounce free lists are
/// per-backend and require no locking" — realized here as a lock private to
/// this struct, uncontended by any other backend).
pub(crate) struct Backend {
    pub(crate) id: BackendId,
    pub(crate) base: u32,
    pub(crate) count: u32,
    free: Mutex<VecDeque<u32>>,
    handed_out: Mutex<Option<u32>>,
    handed_out_bounce: Mutex<Option<BounceBufferId>>,
    staged: Mutex<Vec<u32>>,
    submit_batch_size: usize,
    free_cv: Condvar,
}

impl Backend {
    pub(crate) fn new(id: BackendId, base: u32, count: u32, submit_batch_size: usize) -> Self {
        let free: VecDeque<u32> = (base..base + count).collect();
        Self {
            id,
            base,
            count,
            free: Mutex::new(free),
            handed_out: Mutex::new(None),
            handed_out_bounce: Mutex::new(None),
            staged: Mutex::new(Vec::with_capacity(submit_batch_size)),
            submit_batch_size,
            free_cv: Condvar::new(),
        }
    }

    pub(crate) fn try_take_free(&self) -> Option<u32> {
        self.free.lock().pop_front()
    }

    pub(crate) fn return_free(&self, global_index: u32) {
        debug_assert!(global_index >= self.base && global_index < self.base + self.count);
        self.free.lock().push_back(global_index);
        self.free_cv.notify_one();
    }

    pub(crate) fn wait_for_free(&self, timeout: std::time::Duration) {
        let mut guard = self.free.lock();
        if !guard.is_empty() {
            return;
        }
        self.free_cv.wait_for(&mut guard, timeout);
    }

    /// Enforces invariant 1 (spec §3): at most one handle HANDED_OUT per
    /// backend at any instant.
    pub(crate) fn claim_handed_out(&self, global_index: u32) -> Result<()> {
        let mut slot = self.handed_out.lock();
        if slot.is_some() {
            return Err(AioError::api_violation(
                "backend already holds a handed-out handle",
            ));
        }
        *slot = Some(global_index);
        Ok(())
    }

    pub(crate) fn release_handed_out(&self) {
        *self.handed_out.lock() = None;
    }

    pub(crate) fn handed_out(&self) -> Option<u32> {
        *self.handed_out.lock()
    }

    /// Enforces invariant 2: at most one bounce buffer handed out per
    /// backend.
    pub(crate) fn claim_handed_out_bounce(&self, id: BounceBufferId) -> Result<()> {
        let mut slot = self.handed_out_bounce.lock();
        if slot.is_some() {
            return Err(AioError::api_violation(
                "backend already holds a handed-out bounce buffer",
            ));
        }
        *slot = Some(id);
        Ok(())
    }

    pub(crate) fn release_handed_out_bounce(&self) {
        *self.handed_out_bounce.lock() = None;
    }

    /// Appends to the staged array. Never reallocates: the array was
    /// preallocated to `submit_batch_size` capacity, and callers are
    /// expected to flush before it would overflow (spec §4.3 "Staging and
    /// submission never allocate").
    pub(crate) fn stage(&self, global_index: u32) -> Result<()> {
        let mut staged = self.staged.lock();
        if staged.len() >= self.submit_batch_size {
            return Err(AioError::internal("staged submission array is full"));
        }
        staged.push(global_index);
        Ok(())
    }

    pub(crate) fn take_staged(&self) -> Vec<u32> {
        std::mem::take(&mut *self.staged.lock())
    }

    pub(crate) fn staged_len(&self) -> usize {
        self.staged.lock().len()
    }

    pub(crate) fn contains(&self, global_index: u32) -> bool {
        global_index >= self.base && global_index < self.base + self.count
    }
}

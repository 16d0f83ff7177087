//! The handle pool: fixed-size I/O handles with a strict state machine,
//! per-backend sub-slices, and the reference/wait protocol (spec §3, §4.1).
//!
//! A real PostgreSQL-style deployment keeps this array in memory shared
//! across forked backend processes. This crate targets a single process
//! with registered backend *threads* instead (the explicit substitution
//! licensed by spec §9: "replace backend with thread, partition the handle
//! pool per thread; all other invariants still hold"). Callers never hold a
//! `&HandleSlot` across a potential reclaim point — only a [`HandleRef`]
//! (index, generation), revalidated at every dereference.

mod reference;
mod state;

pub use reference::HandleRef;
pub use state::HandleState;

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::bounce::BounceBufferId;
use crate::error::{AioError, Result};
use crate::resource_owner::ResourceOwnerId;
use crate::subject::{CallbackId, SubjectId};

/// Sentinel meaning "no backend owns this slot right now".
pub const NO_OWNER: u32 = u32::MAX;

/// Upper bound on callbacks chained onto one handle (spec §3 "small ordered
/// list (≤N)"). Kept tiny and fixed so `add_callback` never allocates.
pub const MAX_CALLBACKS: usize = 4;

/// Operation tag for a handle (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    Read,
    Write,
    Fsync,
    FlushRange,
    Nop,
    Invalid,
}

/// Outcome classification carried by a [`DistilledResult`] (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoStatus {
    /// Full success.
    Ok,
    /// Success but with fewer bytes/blocks than requested (spec §4.2
    /// "partial vectored I/O is represented as a success with reduced byte
    /// count").
    ShortTransfer,
    /// Negative raw result or callback-chain rejection.
    Error,
}

/// A compact, heap-free completion tuple (spec §7: "shared memory cannot
/// hold composed error objects"). `message_id` indexes the originating
/// [`SharedCallback`](crate::subject::SharedCallback)'s `error` hook;
/// `detail` is the raw errno or short-count, as appropriate to `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistilledResult {
    pub status: IoStatus,
    pub message_id: u16,
    pub detail: i32,
    pub raw_result: i64,
}

impl DistilledResult {
    pub const fn ok(raw_result: i64) -> Self {
        Self { status: IoStatus::Ok, message_id: 0, detail: 0, raw_result }
    }

    pub const fn short(raw_result: i64, requested: i32, actual: i32) -> Self {
        Self {
            status: IoStatus::ShortTransfer,
            message_id: 0,
            detail: (requested << 16) | (actual & 0xFFFF),
            raw_result,
        }
    }

    pub const fn error(message_id: u16, errno: i32, raw_result: i64) -> Self {
        Self { status: IoStatus::Error, message_id, detail: errno, raw_result }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, IoStatus::Ok | IoStatus::ShortTransfer)
    }
}

/// Describes an entry in the handle's iovec slice (spec §3: "offset into a
/// shared iovec pool and length"). This crate keeps each handle's iovecs
/// inline rather than behind a second shared pool indirection, storing a raw
/// pointer into the caller's pinned buffer directly instead of an offset
/// into a second pool (see DESIGN.md, Open Question: bounce buffer / iovec
/// placement). The pointed-to memory must stay pinned until the handle
/// reaches a terminal state and is reclaimed, the same contract the real
/// engine places on a pinned buffer pool page.
#[derive(Debug, Clone, Copy)]
pub struct IovecSpan {
    pub(crate) ptr: *mut u8,
    pub len: u32,
}

unsafe impl Send for IovecSpan {}

/// A sink the owner may register to receive the distilled result at
/// reclaim, even if the owner itself is not the one observing completion
/// (spec §4.3 "If a result sink was registered ... copy the distilled
/// result into it first"). A safe stand-in for spec's "pointer into
/// caller-owned memory".
pub type ResultSink = std::sync::Arc<Mutex<Option<DistilledResult>>>;

/// Operation-specific payload set by `prepare_read`/`prepare_write`/etc.
#[derive(Debug, Clone, Copy)]
pub struct OpPayload {
    pub fd: i32,
    pub offset: u64,
    pub iov_count: u32,
}

impl OpPayload {
    pub const EMPTY: OpPayload = OpPayload { fd: -1, offset: 0, iov_count: 0 };
}

/// The mutable, owner/reaper-exclusive part of a handle (spec §5: "Handle
/// state is modified only by: its owner ... the method backend ... the
/// reaper ... and the owner again"). Guarded by a per-slot mutex; the
/// invariants above mean this lock is never contended in practice, matching
/// the "lock-free-ish" intent without unsafe cross-process cells.
pub(crate) struct HandleInner {
    pub op: OpType,
    pub payload: OpPayload,
    pub subject: Option<SubjectId>,
    pub subject_data: u64,
    pub callbacks: Vec<CallbackId>,
    pub iov: Vec<IovecSpan>,
    pub bounce_buffers: Vec<BounceBufferId>,
    pub resource_owner: Option<ResourceOwnerId>,
    pub result_sink: Option<ResultSink>,
    pub distilled: DistilledResult,
}

impl HandleInner {
    fn new() -> Self {
        Self {
            op: OpType::Invalid,
            payload: OpPayload::EMPTY,
            subject: None,
            subject_data: 0,
            callbacks: Vec::with_capacity(MAX_CALLBACKS),
            iov: Vec::new(),
            bounce_buffers: Vec::new(),
            resource_owner: None,
            result_sink: None,
            distilled: DistilledResult::ok(0),
        }
    }

    fn reset(&mut self) {
        self.op = OpType::Invalid;
        self.payload = OpPayload::EMPTY;
        self.subject = None;
        self.subject_data = 0;
        self.callbacks.clear();
        self.iov.clear();
        self.bounce_buffers.clear();
        self.resource_owner = None;
        self.result_sink = None;
        self.distilled = DistilledResult::ok(0);
    }
}

/// One slot in the global handle array.
pub(crate) struct HandleSlot {
    state: AtomicU8,
    generation: AtomicU64,
    owner: AtomicU32,
    pub(crate) inner: Mutex<HandleInner>,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

impl HandleSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(HandleState::Idle as u8),
            generation: AtomicU64::new(0),
            owner: AtomicU32::new(NO_OWNER),
            inner: Mutex::new(HandleInner::new()),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn owner(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    /// Enforces invariant 4 (§3): transitions occur only in directions
    /// listed in the state diagram; back-edges are rejected.
    pub(crate) fn transition(&self, to: HandleState) -> Result<()> {
        let from = self.state();
        if !from.can_transition_to(to) {
            return Err(AioError::api_violation(format!(
                "illegal handle transition {from:?} -> {to:?}"
            )));
        }
        self.state.store(to as u8, Ordering::Release);
        tracing::debug!(?from, ?to, "handle state transition");
        Ok(())
    }

    pub(crate) fn set_owner(&self, backend: u32) {
        self.owner.store(backend, Ordering::Release);
    }

    /// Publishes the distilled result and advances to a terminal state with
    /// a release barrier, satisfying invariant 6 (§3: "Completion processing
    /// publishes the distilled result before advancing state ... using a
    /// release barrier").
    pub(crate) fn publish_terminal(&self, result: DistilledResult, shared: bool) {
        {
            let mut inner = self.inner.lock();
            inner.distilled = result;
        }
        let to = if shared { HandleState::CompletedShared } else { HandleState::CompletedLocal };
        // `transition` already issues the release store; errors here would
        // indicate a prior programming error and are deliberately ignored
        // by the reaper, which has no caller to propagate them to.
        let _ = self.transition(to);
        let _guard = self.wait_lock.lock();
        self.wait_cv.notify_all();
    }

    /// Blocks until the slot's generation has moved past `since`, or the
    /// slot is at/after REAPED (spec §4.6 `wait_one` contract; §4.2 `wait`).
    pub(crate) fn wait_until_terminal_or_regenerated(&self, since: u64) {
        loop {
            if self.generation() != since {
                return;
            }
            if matches!(
                self.state(),
                HandleState::Reaped | HandleState::CompletedShared | HandleState::CompletedLocal
            ) {
                return;
            }
            let mut guard = self.wait_lock.lock();
            // Re-check under the wait lock to close the wake-before-wait race.
            if self.generation() != since
                || matches!(
                    self.state(),
                    HandleState::Reaped | HandleState::CompletedShared | HandleState::CompletedLocal
                )
            {
                return;
            }
            self.wait_cv.wait(&mut guard);
        }
    }

    /// Reclamation (spec §4.3): release bounce buffers, clear callbacks and
    /// iovecs, bump generation, publish IDLE with a release barrier, copy
    /// the distilled result into the registered sink first.
    pub(crate) fn reclaim<F: FnOnce(&[BounceBufferId])>(&self, release_bounce: F) {
        let mut inner = self.inner.lock();
        release_bounce(&inner.bounce_buffers);
        if let Some(sink) = inner.result_sink.take() {
            *sink.lock() = Some(inner.distilled);
        }
        inner.reset();
        drop(inner);
        self.owner.store(NO_OWNER, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        let _ = self.transition(HandleState::Idle);
    }
}

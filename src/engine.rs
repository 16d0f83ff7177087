//! The AIO engine's public contract (spec §4.2): acquire/release handles,
//! define and stage operations, wait on references, and force submission.
//! This is the seam every higher-level access method (sequential scan,
//! index scan, VACUUM, the [`crate::read_stream::ReadStream`]) goes
//! through.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Backend, BackendId};
use crate::bounce::{BounceBufferId, BouncePool};
use crate::config::AioConfig;
use crate::error::{AioError, Result};
use crate::handle::{
    DistilledResult, HandleRef, HandleSlot, HandleState, IovecSpan, OpPayload, OpType,
};
use crate::method::{build_method, IoMethod};
use crate::metrics::EngineMetrics;
use crate::resource_owner::ResourceOwnerId;
use crate::subject::{self, CallbackId, SubjectId};

/// The shared, process-wide AIO engine: the handle pool, the backend
/// registry, the bounce buffer pool, and the bound method vtable (spec §3
/// "Global State").
pub struct AioEngine {
    config: AioConfig,
    handles: Vec<HandleSlot>,
    backends: Vec<Backend>,
    next_backend: AtomicU32,
    bounce: BouncePool,
    method: Box<dyn IoMethod>,
    metrics: EngineMetrics,
}

impl AioEngine {
    /// Builds the engine and wraps it in an `Arc`, since method backends
    /// that reap completions on their own threads (worker, io_uring) need a
    /// handle back to it that outlives any single call (see
    /// [`crate::method::IoMethod::bind`]).
    pub fn new(config: AioConfig) -> Result<Arc<Self>> {
        let method = build_method(&config)?;
        Self::with_method(config, method)
    }

    /// Builds an engine with an explicit method backend, bypassing the
    /// `io_method` config lookup. Used by tests (a [`crate::method::SyncMethod`]
    /// double, or a fake that records what it was asked to do).
    pub fn with_method(config: AioConfig, method: Box<dyn IoMethod>) -> Result<Arc<Self>> {
        let total_handles = config.io_max_concurrency * config.max_backends;
        let mut handles = Vec::with_capacity(total_handles);
        handles.resize_with(total_handles, HandleSlot::new);

        let mut backends = Vec::with_capacity(config.max_backends);
        for id in 0..config.max_backends as u32 {
            let base = id * config.io_max_concurrency as u32;
            backends.push(Backend::new(id, base, config.io_max_concurrency as u32, config.submit_batch_size));
        }

        let bounce = BouncePool::new(config.io_bounce_buffers)?;

        let engine = Arc::new(Self {
            config,
            handles,
            backends,
            next_backend: AtomicU32::new(0),
            bounce,
            method,
            metrics: EngineMetrics::new(),
        });
        engine.method.bind(&engine);
        Ok(engine)
    }

    pub fn config(&self) -> &AioConfig {
        &self.config
    }

    pub fn bounce_pool(&self) -> &BouncePool {
        &self.bounce
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Claims the next unused backend slot. Stands in for spec's
    /// per-process static backend-id assignment; callers are expected to
    /// keep the returned id in thread-local storage.
    pub fn register_backend(&self) -> Result<BackendId> {
        let id = self.next_backend.fetch_add(1, Ordering::Relaxed);
        if id as usize >= self.backends.len() {
            return Err(AioError::internal("no free backend slots"));
        }
        Ok(id)
    }

    fn backend(&self, backend_id: BackendId) -> &Backend {
        &self.backends[backend_id as usize]
    }

    fn slot(&self, handle_ref: HandleRef) -> Option<&HandleSlot> {
        let slot = self.handles.get(handle_ref.index() as usize)?;
        if slot.generation() == handle_ref.generation() {
            Some(slot)
        } else {
            None
        }
    }

    fn slot_unchecked(&self, index: u32) -> &HandleSlot {
        &self.handles[index as usize]
    }

    // ------------------------------------------------------------------
    // acquire / release (spec §4.2)
    // ------------------------------------------------------------------

    /// Non-blocking acquire: returns `None` rather than waiting if this
    /// backend has no free handle.
    pub fn acquire_nb(&self, backend_id: BackendId) -> Result<Option<HandleRef>> {
        let backend = self.backend(backend_id);
        if backend.handed_out().is_some() {
            return Err(AioError::api_violation(
                "backend already holds a handed-out handle",
            ));
        }
        let Some(index) = backend.try_take_free() else {
            return Ok(None);
        };
        self.claim(backend, index)?;
        Ok(Some(HandleRef::new(index, self.slot_unchecked(index).generation())))
    }

    /// Blocking acquire (spec §4.2). Flushes any staged work before
    /// waiting, since a handle this backend staged earlier may be exactly
    /// what is keeping the pool exhausted.
    pub fn acquire(&self, backend_id: BackendId) -> Result<HandleRef> {
        if let Some(handle_ref) = self.acquire_nb(backend_id)? {
            return Ok(handle_ref);
        }
        self.submit_staged(backend_id)?;
        loop {
            self.reclaim_completed_in_backend(backend_id);
            if let Some(handle_ref) = self.acquire_nb(backend_id)? {
                return Ok(handle_ref);
            }
            self.backend(backend_id).wait_for_free(Duration::from_millis(5));
        }
    }

    fn claim(&self, backend: &Backend, index: u32) -> Result<()> {
        if let Err(e) = backend.claim_handed_out(index) {
            backend.return_free(index);
            return Err(e);
        }
        let slot = self.slot_unchecked(index);
        slot.transition(HandleState::HandedOut)?;
        slot.set_owner(backend.id);
        Ok(())
    }

    /// Scans this backend's slice for `COMPLETED_SHARED`/`COMPLETED_LOCAL`
    /// handles the owner has not yet reclaimed and reclaims them in place
    /// (spec §4.3 "Waiting for free handles").
    fn reclaim_completed_in_backend(&self, backend_id: BackendId) {
        let backend = self.backend(backend_id);
        for index in backend.base..backend.base + backend.count {
            let slot = self.slot_unchecked(index);
            if matches!(slot.state(), HandleState::CompletedShared | HandleState::CompletedLocal) {
                slot.reclaim(|bbs| {
                    for bb in bbs {
                        self.bounce.release(*bb);
                    }
                });
                // Ordinarily already cleared in `prepare` once the handle
                // left HANDED_OUT; cleared again here too so a handle that
                // somehow reaches a terminal state without going through
                // `prepare` doesn't wedge this backend's next acquire.
                backend.release_handed_out();
                backend.return_free(index);
            }
        }
    }

    /// Valid only in HANDED_OUT; moves directly back to IDLE (spec §4.2).
    /// Reserved for abandoning a handle that was never submitted; once a
    /// handle is terminal, use [`AioEngine::reclaim`] instead.
    pub fn release(&self, backend_id: BackendId, handle_ref: HandleRef) -> Result<()> {
        let slot = self
            .slot(handle_ref)
            .ok_or_else(|| AioError::api_violation("release on stale handle reference"))?;
        if slot.state() != HandleState::HandedOut {
            return Err(AioError::api_violation("release is only valid in HANDED_OUT"));
        }
        slot.reclaim(|bbs| {
            for bb in bbs {
                self.bounce.release(*bb);
            }
        });
        let backend = self.backend(backend_id);
        backend.release_handed_out();
        backend.return_free(handle_ref.index());
        Ok(())
    }

    /// Valid only once terminal (REAPED/COMPLETED_*); returns the slot to
    /// the owning backend's free list (spec §4.3). This is the ordinary way
    /// a caller disposes of a handle after consuming its distilled result.
    pub fn reclaim(&self, backend_id: BackendId, handle_ref: HandleRef) -> Result<()> {
        let slot = self
            .slot(handle_ref)
            .ok_or_else(|| AioError::api_violation("reclaim on stale handle reference"))?;
        if !slot.state().is_terminal() {
            return Err(AioError::api_violation("reclaim is only valid once terminal"));
        }
        slot.reclaim(|bbs| {
            for bb in bbs {
                self.bounce.release(*bb);
            }
        });
        let backend = self.backend(backend_id);
        backend.release_handed_out();
        backend.return_free(handle_ref.index());
        Ok(())
    }

    // ------------------------------------------------------------------
    // definition (spec §4.2)
    // ------------------------------------------------------------------

    pub fn set_subject(&self, handle_ref: HandleRef, subject: SubjectId, subject_data: u64) -> Result<()> {
        let slot = self.live_slot(handle_ref)?;
        let mut inner = slot.inner.lock();
        inner.subject = Some(subject);
        inner.subject_data = subject_data;
        Ok(())
    }

    pub fn add_callback(&self, handle_ref: HandleRef, callback: CallbackId) -> Result<()> {
        let slot = self.live_slot(handle_ref)?;
        let mut inner = slot.inner.lock();
        if inner.callbacks.len() >= crate::handle::MAX_CALLBACKS {
            return Err(AioError::internal("callback chain is full"));
        }
        if let Some(prepare) = callback.descriptor().prepare {
            prepare(inner.op);
        }
        inner.callbacks.push(callback);
        Ok(())
    }

    /// Acquires a bounce buffer for this backend, enforcing invariant 2
    /// (spec §3, §4.5): at most one buffer handed out, and not yet
    /// associated with a handle, per backend at a time. Pairs with
    /// [`AioEngine::associate_bounce_buffer`], which clears the marker once
    /// the buffer is attached to a handle and becomes that handle's
    /// responsibility (released on the handle's own reclaim) instead.
    pub fn acquire_bounce_buffer(&self, backend_id: BackendId) -> Result<BounceBufferId> {
        let backend = self.backend(backend_id);
        let id = self.bounce.acquire(|| {
            let _ = self.submit_staged(backend_id);
        });
        if let Err(e) = backend.claim_handed_out_bounce(id) {
            self.bounce.release(id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn associate_bounce_buffer(&self, backend_id: BackendId, handle_ref: HandleRef, bb: BounceBufferId) -> Result<()> {
        let slot = self.live_slot(handle_ref)?;
        slot.inner.lock().bounce_buffers.push(bb);
        self.backend(backend_id).release_handed_out_bounce();
        Ok(())
    }

    pub fn set_result_sink(&self, handle_ref: HandleRef, sink: crate::handle::ResultSink) -> Result<()> {
        let slot = self.live_slot(handle_ref)?;
        slot.inner.lock().result_sink = Some(sink);
        Ok(())
    }

    pub fn bind_resource_owner(&self, handle_ref: HandleRef, owner: ResourceOwnerId) -> Result<()> {
        let slot = self.live_slot(handle_ref)?;
        slot.inner.lock().resource_owner = Some(owner);
        Ok(())
    }

    fn prepare(&self, backend_id: BackendId, handle_ref: HandleRef, op: OpType, fd: i32, offset: u64, buffers: &mut [&mut [u8]]) -> Result<()> {
        let slot = self.live_slot(handle_ref)?;
        if slot.state() != HandleState::HandedOut {
            return Err(AioError::api_violation("prepare is only valid in HANDED_OUT"));
        }
        slot.transition(HandleState::Defined)?;
        // The handle has left HANDED_OUT: this backend may build another
        // one while this one is staged/executed (spec §8 "handed_out_io" is
        // only held while a handle is being built).
        self.backend(backend_id).release_handed_out();
        {
            let mut inner = slot.inner.lock();
            inner.op = op;
            inner.payload = OpPayload { fd, offset, iov_count: buffers.len() as u32 };
            inner.iov.clear();
            for buffer in buffers.iter_mut() {
                inner.iov.push(IovecSpan { ptr: buffer.as_mut_ptr(), len: buffer.len() as u32 });
            }
        }
        slot.transition(HandleState::Prepared)?;
        Ok(())
    }

    /// Encodes a read operation; transitions DEFINED→PREPARED; stages
    /// unless the bound method requires synchronous execution (spec §4.2).
    pub fn prepare_read(&self, backend_id: BackendId, handle_ref: HandleRef, fd: i32, offset: u64, buffers: &mut [&mut [u8]]) -> Result<()> {
        self.prepare(backend_id, handle_ref, OpType::Read, fd, offset, buffers)?;
        self.after_prepare(backend_id, handle_ref, OpType::Read)
    }

    pub fn prepare_write(&self, backend_id: BackendId, handle_ref: HandleRef, fd: i32, offset: u64, buffers: &mut [&mut [u8]]) -> Result<()> {
        self.prepare(backend_id, handle_ref, OpType::Write, fd, offset, buffers)?;
        self.after_prepare(backend_id, handle_ref, OpType::Write)
    }

    /// Either stages the handle, or — if the method cannot execute this op
    /// asynchronously — submits and runs it inline without going through
    /// the reaper (spec §4.3 fallback path).
    fn after_prepare(&self, backend_id: BackendId, handle_ref: HandleRef, op: OpType) -> Result<()> {
        if self.method.needs_synchronous_execution(op) {
            self.submit_one_inline(handle_ref)
        } else {
            self.backend(backend_id).stage(handle_ref.index())
        }
    }

    fn submit_one_inline(&self, handle_ref: HandleRef) -> Result<()> {
        let accepted = self.method.submit(self, std::slice::from_ref(&handle_ref))?;
        if accepted != 1 {
            return Err(AioError::internal("synchronous submit did not accept the handle"));
        }
        self.method.wait_one(self, handle_ref);
        Ok(())
    }

    /// Force-submission of everything queued locally (spec §4.2, §4.3).
    /// Safe in a critical/non-allocating context: the method's `submit`
    /// contract forbids long blocking.
    pub fn submit_staged(&self, backend_id: BackendId) -> Result<usize> {
        let backend = self.backend(backend_id);
        let staged = backend.take_staged();
        if staged.is_empty() {
            return Ok(0);
        }
        let refs: Vec<HandleRef> = staged
            .iter()
            .map(|&index| HandleRef::new(index, self.slot_unchecked(index).generation()))
            .collect();
        self.method.submit(self, &refs)
    }

    // ------------------------------------------------------------------
    // wait / check_done (spec §4.2)
    // ------------------------------------------------------------------

    pub fn get_ref(&self, handle_ref: HandleRef) -> HandleRef {
        handle_ref
    }

    /// Blocks until terminal or the generation has advanced (spec §4.2,
    /// §5). Safe from any backend.
    pub fn wait(&self, handle_ref: HandleRef) -> DistilledResult {
        if let Some(slot) = self.slot(handle_ref) {
            self.method.wait_one(self, handle_ref);
            // Re-check after the method-specific wait in case a reclaim
            // raced us; either way the generation no longer matches what
            // the caller held, or the slot is terminal and safe to read.
            if self.slot(handle_ref).is_some() && slot.state().is_terminal() {
                return slot.inner.lock().distilled;
            }
        }
        // Stale reference: already reclaimed. The caller asked for a
        // result it can no longer observe; report a neutral success since
        // reporting an error here would be indistinguishable from a real
        // I/O failure to a caller that, by definition, stopped caring.
        DistilledResult::ok(0)
    }

    /// Non-blocking form of [`AioEngine::wait`].
    pub fn check_done(&self, handle_ref: HandleRef) -> bool {
        match self.slot(handle_ref) {
            Some(slot) => slot.state().is_terminal(),
            None => true,
        }
    }

    pub(crate) fn live_slot(&self, handle_ref: HandleRef) -> Result<&HandleSlot> {
        self.slot(handle_ref)
            .ok_or_else(|| AioError::api_violation("operation on a stale handle reference"))
    }

    /// Non-generation-checked peek used by resource-owner teardown, which
    /// already knows the reference might be stale (spec §5 scenario 6).
    pub(crate) fn peek_state(&self, handle_ref: HandleRef) -> Option<HandleState> {
        self.slot(handle_ref).map(|slot| slot.state())
    }

    /// Forces a DEFINED/PREPARED handle through submission without waiting
    /// for a staged-batch flush (spec §5 resource-owner teardown: "force
    /// submitted so the I/O is not lost").
    pub(crate) fn force_submit(&self, handle_ref: HandleRef) -> Result<()> {
        let slot = self.live_slot(handle_ref)?;
        if slot.state() == HandleState::Defined {
            slot.transition(HandleState::Prepared)?;
        }
        let accepted = self.method.submit(self, std::slice::from_ref(&handle_ref))?;
        if accepted != 1 {
            return Err(AioError::internal("forced submit did not accept the handle"));
        }
        Ok(())
    }

    pub(crate) fn force_reclaim(&self, handle_ref: HandleRef) -> Result<()> {
        let slot = self.live_slot(handle_ref)?;
        let backend_id = slot.owner();
        slot.reclaim(|bbs| {
            for bb in bbs {
                self.bounce.release(*bb);
            }
        });
        if backend_id != crate::handle::NO_OWNER {
            let backend = self.backend(backend_id);
            backend.release_handed_out();
            backend.return_free(handle_ref.index());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // method-backend-facing internals (spec §4.6)
    // ------------------------------------------------------------------

    /// Generic wait primitive every method's `wait_one` delegates to: block
    /// until the slot is at/past REAPED, or its generation has moved on
    /// (spec §4.6 `wait_one` contract). Method-agnostic, since the handle's
    /// own condvar is signalled by [`HandleSlot::publish_terminal`]
    /// regardless of which method backend drove completion.
    pub(crate) fn block_until_reaped_or_regenerated(&self, handle_ref: HandleRef) {
        if let Some(slot) = self.slot(handle_ref) {
            slot.wait_until_terminal_or_regenerated(handle_ref.generation());
        }
    }

    /// Raw payload a method backend needs to actually perform I/O. Copied
    /// out rather than returned under lock, since the method may block for
    /// a real syscall.
    pub(crate) fn raw_payload(&self, handle_ref: HandleRef) -> Result<(OpType, OpPayload, Vec<IovecSpan>, Vec<CallbackId>)> {
        let slot = self.live_slot(handle_ref)?;
        let inner = slot.inner.lock();
        Ok((inner.op, inner.payload, inner.iov.clone(), inner.callbacks.clone()))
    }

    /// Advances PREPARED/DEFINED→IN_FLIGHT for a batch about to be handed
    /// to the kernel/worker pool (spec §4.6 `submit` contract: "release
    /// barrier").
    pub(crate) fn mark_in_flight(&self, handle_ref: HandleRef) -> Result<()> {
        self.live_slot(handle_ref)?.transition(HandleState::InFlight)
    }

    /// Runs the shared completion callback chain and publishes the
    /// terminal state (spec §4.4, §4.6 `process_completion`). `shared`
    /// distinguishes COMPLETED_SHARED (a worker or kernel reaped it; any
    /// process may now observe) from COMPLETED_LOCAL (the owner drove
    /// completion itself, inline).
    pub(crate) fn process_completion(&self, handle_ref: HandleRef, raw_result: i64, shared: bool) -> Result<()> {
        let slot = self.live_slot(handle_ref)?;
        slot.transition(HandleState::Reaped)?;
        let (op, callbacks) = {
            let inner = slot.inner.lock();
            (inner.op, inner.callbacks.clone())
        };
        let distilled = subject::distill(op, &callbacks, raw_result);
        self.metrics.record_completion(op, distilled.status, distilled.raw_result);
        slot.publish_terminal(distilled, shared);
        Ok(())
    }

    /// Point-in-time dump of every handle slot (spec §6 "Diagnostics",
    /// supplemented as a `pg_aios`-style view; see DESIGN.md). Racy by
    /// nature: a slot may transition or reclaim between the read of its
    /// state and of its inner fields, same as querying `pg_aios` live.
    pub fn snapshot_handles(&self) -> Vec<crate::diagnostics::HandleSnapshot> {
        self.handles
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                let owner = slot.owner();
                let inner = slot.inner.lock();
                crate::diagnostics::HandleSnapshot {
                    index: index as u32,
                    generation: slot.generation(),
                    state: slot.state(),
                    owner_backend: if owner == crate::handle::NO_OWNER { None } else { Some(owner) },
                    op: inner.op,
                    subject_description: crate::diagnostics::HandleSnapshot::describe_subject(
                        inner.subject,
                        inner.subject_data,
                    ),
                    last_result: if slot.state().is_terminal() { Some(inner.distilled) } else { None },
                }
            })
            .collect()
    }
}

//! Hands submitted handles to a fixed worker thread pool (spec §4.6
//! "worker" method). Grounded on the host's `AsyncIoEngine::worker_loop`
//! (`src/io/async_io.rs`): a shared channel feeds a fixed set of OS
//! threads, each performing the blocking syscall itself and reporting
//! completion back through [`AioEngine::process_completion`].
//!
//! A method backend is constructed before the engine that will own it, so
//! it cannot simply store an `&AioEngine`. [`AioEngine::with_method`] calls
//! [`IoMethod::bind`] once the engine is wrapped in its `Arc`; this backend
//! stashes a [`Weak`] reference for its worker threads to upgrade.

use crossbeam::channel::{self, Receiver, Sender};
use once_cell::sync::OnceCell;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crate::engine::AioEngine;
use crate::error::{AioError, Result};
use crate::handle::{HandleRef, OpType};
use crate::method::{raw_io, IoMethod};

pub struct WorkerMethod {
    sender: Sender<HandleRef>,
    engine: Arc<OnceCell<Weak<AioEngine>>>,
    _workers: Vec<JoinHandle<()>>,
}

impl WorkerMethod {
    pub fn new(worker_threads: usize) -> Self {
        let (sender, receiver) = channel::unbounded::<HandleRef>();
        let engine_cell: Arc<OnceCell<Weak<AioEngine>>> = Arc::new(OnceCell::new());
        let count = worker_threads.max(1);
        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let receiver = receiver.clone();
            let engine_cell = engine_cell.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("aio-worker-{id}"))
                .spawn(move || worker_loop(receiver, engine_cell));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => tracing::warn!(error = %e, id, "failed to spawn aio worker thread"),
            }
        }
        Self { sender, engine: engine_cell, _workers: workers }
    }
}

fn worker_loop(receiver: Receiver<HandleRef>, engine_cell: Arc<OnceCell<Weak<AioEngine>>>) {
    for handle_ref in receiver {
        let Some(weak) = engine_cell.get() else {
            tracing::warn!(?handle_ref, "worker received a job before the engine finished binding");
            continue;
        };
        let Some(engine) = weak.upgrade() else {
            return;
        };
        let outcome = engine
            .raw_payload(handle_ref)
            .map(|(op, payload, iov, _callbacks)| raw_io::perform(op, &payload, &iov));
        let raw = match outcome {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(?handle_ref, error = %e, "worker could not read handle payload");
                continue;
            }
        };
        if let Err(e) = engine.process_completion(handle_ref, raw, true) {
            tracing::warn!(?handle_ref, error = %e, "worker failed to publish completion");
        }
    }
}

impl IoMethod for WorkerMethod {
    fn submit(&self, engine: &AioEngine, handles: &[HandleRef]) -> Result<usize> {
        for &handle_ref in handles {
            engine.mark_in_flight(handle_ref)?;
            self.sender
                .send(handle_ref)
                .map_err(|_| AioError::internal("worker pool channel is closed"))?;
        }
        Ok(handles.len())
    }

    fn wait_one(&self, engine: &AioEngine, handle_ref: HandleRef) {
        engine.block_until_reaped_or_regenerated(handle_ref);
    }

    fn needs_synchronous_execution(&self, _op: OpType) -> bool {
        false
    }

    fn bind(&self, engine: &Arc<AioEngine>) {
        let _ = self.engine.set(Arc::downgrade(engine));
    }
}

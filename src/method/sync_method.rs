//! Executes every operation inline on the issuing backend via blocking
//! syscalls (spec §4.6): the always-available fallback, and the default
//! `io_method`.

use crate::engine::AioEngine;
use crate::error::Result;
use crate::handle::{HandleRef, OpType};
use crate::method::{raw_io, IoMethod};

#[derive(Debug, Default)]
pub struct SyncMethod;

impl SyncMethod {
    pub fn new() -> Self {
        SyncMethod
    }
}

impl IoMethod for SyncMethod {
    fn submit(&self, engine: &AioEngine, handles: &[HandleRef]) -> Result<usize> {
        for &handle_ref in handles {
            engine.mark_in_flight(handle_ref)?;
            let (op, payload, iov, _callbacks) = engine.raw_payload(handle_ref)?;
            let raw = raw_io::perform(op, &payload, &iov);
            engine.process_completion(handle_ref, raw, false)?;
        }
        Ok(handles.len())
    }

    fn wait_one(&self, engine: &AioEngine, handle_ref: HandleRef) {
        // Submission already ran the operation to completion inline; this
        // returns immediately unless a race with reclaim is in progress.
        engine.block_until_reaped_or_regenerated(handle_ref);
    }

    fn needs_synchronous_execution(&self, _op: OpType) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_method_always_wants_synchronous_execution() {
        let method = SyncMethod::new();
        assert!(method.needs_synchronous_execution(OpType::Read));
        assert!(method.needs_synchronous_execution(OpType::Write));
        assert!(method.needs_synchronous_execution(OpType::Fsync));
    }
}

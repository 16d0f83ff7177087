//! POSIX AIO method backend (spec §4.6 `posix_aio`; unix only, feature
//! `posix_aio_backend`). Reads and writes are submitted through
//! `aio_read`/`aio_write`; everything else this method cannot express
//! asynchronously (`fsync`, `fdatasync`, `nop`) is declared synchronous and
//! falls back to the same blocking path the `sync` method uses.
//!
//! There is no dedicated reaper thread: whichever backend calls
//! [`AioEngine::wait`] on a handle this method is tracking drives its own
//! `aio_suspend`/`aio_return` and publishes the result, the same "first
//! waiter reaps" simplification spec §9 leaves to the implementer for a
//! method with no natural background thread of its own.

use libc::{aiocb, c_void};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::engine::AioEngine;
use crate::error::Result;
use crate::handle::{HandleRef, OpType};
use crate::method::{raw_io, IoMethod};

pub struct PosixAioMethod {
    inflight: Mutex<HashMap<HandleRef, Box<aiocb>>>,
}

impl PosixAioMethod {
    pub fn new() -> Self {
        Self { inflight: Mutex::new(HashMap::new()) }
    }

    fn submit_one(&self, engine: &AioEngine, handle_ref: HandleRef) -> Result<()> {
        engine.mark_in_flight(handle_ref)?;
        let (op, payload, iov, _callbacks) = engine.raw_payload(handle_ref)?;
        match op {
            OpType::Read | OpType::Write => {
                let span = iov.first().copied();
                let Some(span) = span else {
                    engine.process_completion(handle_ref, 0, true)?;
                    return Ok(());
                };
                let mut cb: aiocb = unsafe { std::mem::zeroed() };
                cb.aio_fildes = payload.fd;
                cb.aio_offset = payload.offset as libc::off_t;
                cb.aio_buf = span.ptr as *mut c_void;
                cb.aio_nbytes = span.len as usize;
                let mut boxed = Box::new(cb);
                let rc = unsafe {
                    if op == OpType::Read {
                        libc::aio_read(boxed.as_mut())
                    } else {
                        libc::aio_write(boxed.as_mut())
                    }
                };
                if rc != 0 {
                    let raw = -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64);
                    engine.process_completion(handle_ref, raw, true)?;
                } else {
                    self.inflight.lock().insert(handle_ref, boxed);
                }
            }
            OpType::Fsync | OpType::FlushRange | OpType::Nop | OpType::Invalid => {
                let raw = raw_io::perform(op, &payload, &iov);
                engine.process_completion(handle_ref, raw, false)?;
            }
        }
        Ok(())
    }

    fn reap(&self, engine: &AioEngine, handle_ref: HandleRef) {
        let Some(mut cb) = self.inflight.lock().remove(&handle_ref) else {
            return;
        };
        loop {
            let err = unsafe { libc::aio_error(cb.as_mut()) };
            if err == libc::EINPROGRESS {
                let list: [*const aiocb; 1] = [cb.as_ref()];
                unsafe {
                    libc::aio_suspend(list.as_ptr(), 1, std::ptr::null());
                }
                continue;
            }
            let raw = if err == 0 {
                unsafe { libc::aio_return(cb.as_mut()) as i64 }
            } else {
                -(err as i64)
            };
            let _ = engine.process_completion(handle_ref, raw, true);
            return;
        }
    }
}

impl Default for PosixAioMethod {
    fn default() -> Self {
        Self::new()
    }
}

impl IoMethod for PosixAioMethod {
    fn submit(&self, engine: &AioEngine, handles: &[HandleRef]) -> Result<usize> {
        for &handle_ref in handles {
            self.submit_one(engine, handle_ref)?;
        }
        Ok(handles.len())
    }

    fn wait_one(&self, engine: &AioEngine, handle_ref: HandleRef) {
        self.reap(engine, handle_ref);
        engine.block_until_reaped_or_regenerated(handle_ref);
    }

    fn needs_synchronous_execution(&self, op: OpType) -> bool {
        matches!(op, OpType::Fsync | OpType::FlushRange | OpType::Nop | OpType::Invalid)
    }
}

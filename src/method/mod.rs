//! The I/O method interface (spec §4.6): the pluggable backend that
//! actually submits handles and waits for completion. Four concrete
//! backends are provided; see spec §6 `io_method`.

mod raw_io;
mod sync_method;
mod worker;

#[cfg(unix)]
mod posix_aio;

#[cfg(all(target_os = "linux", feature = "io_uring_backend"))]
mod io_uring_method;

pub use sync_method::SyncMethod;
pub use worker::WorkerMethod;

#[cfg(all(target_os = "linux", feature = "io_uring_backend"))]
pub use io_uring_method::IoUringMethod;

#[cfg(all(unix, feature = "posix_aio_backend"))]
pub use posix_aio::PosixAioMethod;

use std::sync::Arc;

use crate::config::{AioConfig, IoMethodKind};
use crate::engine::AioEngine;
use crate::error::Result;
use crate::handle::{HandleRef, OpType};

/// Contract every method backend implements (spec §4.6).
pub trait IoMethod: Send + Sync {
    /// Transitions each DEFINED/PREPARED handle to IN_FLIGHT (release
    /// barrier) and returns the count accepted. Must not block long; all
    /// current methods accept everything they're given.
    fn submit(&self, engine: &AioEngine, handles: &[HandleRef]) -> Result<usize>;

    /// Blocks until `handle_ref` is at or past REAPED, or its generation has
    /// advanced past `handle_ref.generation()`. May be called from any
    /// backend, not just the owner.
    fn wait_one(&self, engine: &AioEngine, handle_ref: HandleRef);

    /// True for operations this method cannot perform asynchronously; such
    /// handles are prepared and executed inline rather than staged (spec
    /// §4.3 "fallback path").
    fn needs_synchronous_execution(&self, op: OpType) -> bool;

    /// Called once, immediately after the engine that owns this method is
    /// constructed. Backends that reap completions on their own threads
    /// (worker, io_uring) use this to retain a [`std::sync::Weak`] handle
    /// back to the engine. Default no-op for backends that only ever see
    /// the engine transiently, through `submit`/`wait_one`.
    fn bind(&self, _engine: &Arc<AioEngine>) {}
}

/// Builds the method backend selected by configuration (spec §6
/// `io_method`).
pub fn build_method(config: &AioConfig) -> Result<Box<dyn IoMethod>> {
    match config.io_method {
        IoMethodKind::Sync => Ok(Box::new(SyncMethod::new())),
        IoMethodKind::Worker => Ok(Box::new(WorkerMethod::new(config.worker_threads))),
        IoMethodKind::IoUring => {
            #[cfg(all(target_os = "linux", feature = "io_uring_backend"))]
            {
                Ok(Box::new(IoUringMethod::new(config)?))
            }
            #[cfg(not(all(target_os = "linux", feature = "io_uring_backend")))]
            {
                Err(crate::error::AioError::Config(
                    "io_method = io_uring requires Linux and the io_uring_backend feature".to_string(),
                ))
            }
        }
        IoMethodKind::PosixAio => {
            #[cfg(all(unix, feature = "posix_aio_backend"))]
            {
                Ok(Box::new(PosixAioMethod::new()))
            }
            #[cfg(not(all(unix, feature = "posix_aio_backend")))]
            {
                Err(crate::error::AioError::Config(
                    "io_method = posix_aio requires unix and the posix_aio_backend feature".to_string(),
                ))
            }
        }
    }
}

//! Asynchronous I/O engine and adaptive read stream.
//!
//! A PostgreSQL-AIO-style handle pool (fixed-size, per-backend sub-slices,
//! a strict state machine) sitting under a pluggable method backend
//! (`sync`, `worker`, and optionally `io_uring`/`posix_aio`), topped by a
//! look-ahead [`read_stream::ReadStream`] that coalesces sequential reads
//! and issues prefetch advice when access looks random.

pub mod backend;
pub mod bounce;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod handle;
pub mod method;
pub mod metrics;
pub mod read_stream;
pub mod resource_owner;
pub mod subject;

pub use backend::BackendId;
pub use bounce::BounceBufferId;
pub use config::{AioConfig, DirectIoFlags, IoMethodKind};
pub use engine::AioEngine;
pub use error::{AioError, Result};
pub use handle::{DistilledResult, HandleRef, HandleState, IoStatus, OpType};
pub use read_stream::{BlockNumber, BlockSource, ReadBuffer, ReadStream, ReadStreamFlags};
pub use resource_owner::{ResourceOwner, ResourceOwnerId};
pub use subject::{format_error, CallbackId, SubjectId, NO_CALLBACK};

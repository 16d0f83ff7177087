//! Error types for the AIO engine and read stream.
//!
//! Mirrors the host database's error-reporting conventions (a flat
//! `thiserror` enum plus a crate-wide `Result` alias) but scoped to the
//! failure modes this crate actually raises, per spec §7.

use thiserror::Error;

/// Errors raised by the AIO engine, the read stream, or their configuration
/// and diagnostics layers.
#[derive(Error, Debug, Clone)]
pub enum AioError {
    /// The method backend reported a negative raw result (errno-style).
    #[error("io error on {op} against {subject}: {errno}")]
    Io {
        op: &'static str,
        subject: &'static str,
        errno: i32,
    },

    /// A vectored transfer completed with fewer bytes/blocks than requested.
    /// Carried as a distilled result, not necessarily fatal to the caller.
    #[error("short transfer: requested {requested}, got {actual}")]
    ShortTransfer { requested: u32, actual: u32 },

    /// A completion callback rejected the result (e.g. checksum mismatch).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The caller violated an engine invariant (double-acquire, foreign
    /// release, transition on an invalid reference). Fatal to the offending
    /// backend only.
    #[error("api violation: {0}")]
    ApiViolation(String),

    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for conditions that should not occur in correct use
    /// (resource exhaustion, pool corruption).
    #[error("internal error: {0}")]
    Internal(String),
}

impl AioError {
    pub(crate) fn api_violation(msg: impl Into<String>) -> Self {
        AioError::ApiViolation(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        AioError::Internal(msg.into())
    }
}

impl From<std::io::Error> for AioError {
    fn from(e: std::io::Error) -> Self {
        AioError::Io {
            op: "io",
            subject: "unknown",
            errno: e.raw_os_error().unwrap_or(-1),
        }
    }
}

pub type Result<T> = std::result::Result<T, AioError>;

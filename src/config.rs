//! Crate-wide configuration, enumerated in spec §6.
//!
//! Loaded the way the host database loads its own settings: a plain struct
//! with `Default`, optionally overlaid from a TOML file at startup.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AioError, Result};

/// Which method backend services submitted handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMethodKind {
    /// Execute every operation inline on the issuing backend. Always
    /// available, never requires the reaper.
    Sync,
    /// Hand operations to a fixed worker thread pool.
    Worker,
    /// Submit through the kernel io_uring (unix only, `io_uring_backend`
    /// feature).
    IoUring,
    /// Submit through POSIX AIO (unix only, `posix_aio_backend` feature).
    PosixAio,
}

impl Default for IoMethodKind {
    fn default() -> Self {
        IoMethodKind::Sync
    }
}

/// Bit set controlling which I/O paths use direct I/O (spec §6
/// `io_direct_flags`). Direct I/O on the data path forbids prefetch advice
/// and forbids the read stream's regime C (random, advice-driven
/// look-ahead). Hand-rolled rather than pulling in the `bitflags` crate for
/// a single three-bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectIoFlags(u8);

impl DirectIoFlags {
    pub const DATA: DirectIoFlags = DirectIoFlags(0b001);
    pub const WAL: DirectIoFlags = DirectIoFlags(0b010);
    pub const META: DirectIoFlags = DirectIoFlags(0b100);

    pub const fn empty() -> Self {
        DirectIoFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        DirectIoFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for DirectIoFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Top-level configuration for the engine and its read streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AioConfig {
    /// Selected method backend. Default `sync`.
    pub io_method: IoMethodKind,

    /// Handles available per backend (spec §6 `io_max_concurrency`).
    pub io_max_concurrency: usize,

    /// Maximum number of backends (processes in spec terms; OS threads
    /// registered with this engine, per spec §9's thread-substitution
    /// license) the handle pool is partitioned across.
    pub max_backends: usize,

    /// Bounce-buffer pool size (spec §6 `io_bounce_buffers`).
    pub io_bounce_buffers: usize,

    /// Per-tablespace concurrency ceiling consulted by the read stream for
    /// ordinary scans (spec §6 `effective_io_concurrency`).
    pub effective_io_concurrency: usize,

    /// Per-tablespace concurrency ceiling for maintenance work such as
    /// VACUUM (spec §6 `maintenance_io_concurrency`).
    pub maintenance_io_concurrency: usize,

    /// Maximum blocks coalesced into one physical read (spec §6
    /// `buffer_io_size`).
    pub buffer_io_size: u32,

    /// Direct I/O bit set (spec §6 `io_direct_flags`).
    pub io_direct_flags: DirectIoFlags,

    /// Handles staged locally before a forced `submit_staged` (spec §4.3
    /// `PGAIO_SUBMIT_BATCH_SIZE`).
    pub submit_batch_size: usize,

    /// Worker threads used by the `worker` method backend.
    pub worker_threads: usize,
}

impl Default for AioConfig {
    fn default() -> Self {
        Self {
            io_method: IoMethodKind::default(),
            io_max_concurrency: 64,
            max_backends: 64,
            io_bounce_buffers: 64,
            effective_io_concurrency: 1,
            maintenance_io_concurrency: 10,
            buffer_io_size: 128,
            io_direct_flags: DirectIoFlags::empty(),
            submit_batch_size: 64,
            worker_threads: num_cpus::get().max(1),
        }
    }
}

impl AioConfig {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// field the file omits. Mirrors the host's `rustydb.toml` convention.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AioError::Config(format!("reading {}: {e}", path.as_ref().display())))?;
        toml::from_str(&text).map_err(|e| AioError::Config(format!("parsing config: {e}")))
    }

    /// `effective_io_concurrency`, clamped so `max_ios = 0` behaves as
    /// `max_ios = 1` with advice disabled (spec §4.7 boundary behavior).
    pub fn effective_max_ios(&self, maintenance: bool) -> usize {
        let raw = if maintenance {
            self.maintenance_io_concurrency
        } else {
            self.effective_io_concurrency
        };
        raw.max(1)
    }

    /// Whether `effective_io_concurrency` was configured as zero, in which
    /// case advice must be disabled even though `effective_max_ios` reports 1.
    pub fn advice_disabled_by_config(&self, maintenance: bool) -> bool {
        let raw = if maintenance {
            self.maintenance_io_concurrency
        } else {
            self.effective_io_concurrency
        };
        raw == 0
    }

    /// Whether direct I/O on the data path forbids prefetch advice.
    pub fn direct_io_forbids_advice(&self) -> bool {
        self.io_direct_flags.contains(DirectIoFlags::DATA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sync_method() {
        let cfg = AioConfig::default();
        assert_eq!(cfg.io_method, IoMethodKind::Sync);
        assert!(cfg.io_max_concurrency > 0);
    }

    #[test]
    fn zero_effective_concurrency_clamps_to_one_with_advice_disabled() {
        let mut cfg = AioConfig::default();
        cfg.effective_io_concurrency = 0;
        assert_eq!(cfg.effective_max_ios(false), 1);
        assert!(cfg.advice_disabled_by_config(false));
    }

    #[test]
    fn direct_io_data_flag_forbids_advice() {
        let mut cfg = AioConfig::default();
        assert!(!cfg.direct_io_forbids_advice());
        cfg.io_direct_flags = DirectIoFlags::DATA;
        assert!(cfg.direct_io_forbids_advice());
    }

    #[test]
    fn direct_io_flags_union() {
        let flags = DirectIoFlags::DATA | DirectIoFlags::WAL;
        assert!(flags.contains(DirectIoFlags::DATA));
        assert!(flags.contains(DirectIoFlags::WAL));
        assert!(!flags.contains(DirectIoFlags::META));
    }
}

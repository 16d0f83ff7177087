//! I/O counters, grounded on the teacher's `io::metrics::IoCounters` (spec
//! §6 "Diagnostics" ambient scope: the engine's DEBUG traces plus a
//! queryable counter set rather than a dashboard or exporter).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::handle::{IoStatus, OpType};

/// Lock-free counters updated once per completed handle (spec §4.4, after
/// `process_completion` has distilled a result).
#[derive(Debug, Default)]
pub struct EngineMetrics {
    reads: AtomicU64,
    writes: AtomicU64,
    fsyncs: AtomicU64,
    other: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    errors: AtomicU64,
    short_transfers: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_completion(&self, op: OpType, status: IoStatus, raw_result: i64) {
        match op {
            OpType::Read => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                if raw_result > 0 {
                    self.bytes_read.fetch_add(raw_result as u64, Ordering::Relaxed);
                }
            }
            OpType::Write => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                if raw_result > 0 {
                    self.bytes_written.fetch_add(raw_result as u64, Ordering::Relaxed);
                }
            }
            OpType::Fsync | OpType::FlushRange => {
                self.fsyncs.fetch_add(1, Ordering::Relaxed);
            }
            OpType::Nop | OpType::Invalid => {
                self.other.fetch_add(1, Ordering::Relaxed);
            }
        }
        match status {
            IoStatus::Error => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
            IoStatus::ShortTransfer => {
                self.short_transfers.fetch_add(1, Ordering::Relaxed);
            }
            IoStatus::Ok => {}
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            fsyncs: self.fsyncs.load(Ordering::Relaxed),
            other: self.other.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            short_transfers: self.short_transfers.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time read of [`EngineMetrics`], safe to hand to a caller
/// without holding any lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub fsyncs: u64,
    pub other: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
    pub short_transfers: u64,
}

impl MetricsSnapshot {
    pub fn total_ops(&self) -> u64 {
        self.reads + self.writes + self.fsyncs + self.other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_read_bytes_and_errors() {
        let metrics = EngineMetrics::new();
        metrics.record_completion(OpType::Read, IoStatus::Ok, 8192);
        metrics.record_completion(OpType::Read, IoStatus::Error, -5);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.reads, 2);
        assert_eq!(snapshot.bytes_read, 8192);
        assert_eq!(snapshot.errors, 1);
    }

    #[test]
    fn short_transfer_is_counted_separately_from_error() {
        let metrics = EngineMetrics::new();
        metrics.record_completion(OpType::Write, IoStatus::ShortTransfer, 100);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.writes, 1);
        assert_eq!(snapshot.short_transfers, 1);
        assert_eq!(snapshot.errors, 0);
    }
}

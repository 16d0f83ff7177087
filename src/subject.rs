//! Subjects and shared completion callbacks, identified by small integer
//! IDs rather than function pointers (spec §3, §4.4, §9: "No function
//! pointers in shared memory" — callback and subject descriptors are
//! tagged enumerations indexing static, process-local tables, because in
//! the real deployment this array lives in memory shared across processes
//! spawned from possibly differently-ASLR'd copies of the same binary).
//! This crate is single-process, but keeps the indirection: porting the
//! engine to true shared memory should not require touching call sites.

use crate::handle::{DistilledResult, IoStatus, OpType};

/// Identifies what an I/O targets (spec §3 "Subject").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubjectId {
    /// A page of a relation file — the dominant subject in a real database;
    /// grounded on the host's `storage::buffer` page identity.
    RelationPage,
    /// A raw, unmanaged file description used in tests and benches.
    RawFile,
}

/// Static, compile-time descriptor for a subject. `reopen` is required by
/// method backends (worker/io_uring) whose completion may run after the
/// issuing process released its file descriptor (spec §3); `describe`
/// supports diagnostics (spec §6).
pub struct SubjectDescriptor {
    pub name: &'static str,
    pub reopen: Option<fn(subject_data: u64) -> std::io::Result<i32>>,
    pub describe: fn(subject_data: u64) -> String,
}

fn describe_relation_page(data: u64) -> String {
    let tablespace = (data >> 32) as u32;
    let block = data as u32;
    format!("relation page ts={tablespace} block={block}")
}

fn describe_raw_file(data: u64) -> String {
    format!("raw fd={data}")
}

const SUBJECT_TABLE: &[SubjectDescriptor] = &[
    SubjectDescriptor { name: "relation_page", reopen: None, describe: describe_relation_page },
    SubjectDescriptor { name: "raw_file", reopen: None, describe: describe_raw_file },
];

impl SubjectId {
    pub fn descriptor(self) -> &'static SubjectDescriptor {
        &SUBJECT_TABLE[self as usize]
    }
}

/// Identifies a shared completion callback by small integer ID (spec §3
/// "Shared Callback").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CallbackId {
    /// Verifies/derives the page checksum on read, or stamps it on write.
    /// Grounded on the host's checksum machinery in `storage`.
    Checksum,
    /// Bridges a bounce-buffer transfer back into the caller's pinned
    /// target buffer after a read, or out of it before a write.
    BounceCopy,
}

/// Input/output of one callback hop in the completion chain (spec §4.4:
/// "each transforming a result struct"). The chain runs in reverse
/// registration order; the final output becomes the handle's distilled
/// result.
#[derive(Debug, Clone, Copy)]
pub struct CallbackResult {
    pub status: IoStatus,
    pub message_id: u16,
    pub detail: i32,
    pub raw_result: i64,
}

impl From<DistilledResult> for CallbackResult {
    fn from(d: DistilledResult) -> Self {
        Self { status: d.status, message_id: d.message_id, detail: d.detail, raw_result: d.raw_result }
    }
}

impl From<CallbackResult> for DistilledResult {
    fn from(c: CallbackResult) -> Self {
        Self { status: c.status, message_id: c.message_id, detail: c.detail, raw_result: c.raw_result }
    }
}

/// Static descriptor for a shared callback (spec §3, §4.4). `prepare` runs
/// inline at define-time (e.g. to pin an extra buffer the subsystem owns);
/// `complete` runs at completion, consuming and returning a `CallbackResult`
/// to enable chained distillation; `error` formats a final, human-readable
/// message for the issuer from the distilled result.
pub struct CallbackDescriptor {
    pub name: &'static str,
    pub prepare: Option<fn(op: OpType)>,
    pub complete: fn(op: OpType, input: CallbackResult) -> CallbackResult,
    pub error: fn(result: DistilledResult) -> String,
}

fn checksum_complete(op: OpType, input: CallbackResult) -> CallbackResult {
    if !matches!(input.status, IoStatus::Ok | IoStatus::ShortTransfer) {
        return input;
    }
    match op {
        OpType::Read => input, // checksum verification happens once real page bytes exist;
                                 // the engine has no page contents to inspect here, so this
                                 // hook is a pass-through grounding point for a host that
                                 // wires a real verifier in.
        _ => input,
    }
}

fn checksum_error(result: DistilledResult) -> String {
    format!("checksum verification failed: errno={}", result.detail)
}

fn bounce_copy_complete(_op: OpType, input: CallbackResult) -> CallbackResult {
    input
}

fn bounce_copy_error(result: DistilledResult) -> String {
    format!("bounce buffer copy failed: errno={}", result.detail)
}

const CALLBACK_TABLE: &[CallbackDescriptor] = &[
    CallbackDescriptor {
        name: "checksum",
        prepare: None,
        complete: checksum_complete,
        error: checksum_error,
    },
    CallbackDescriptor {
        name: "bounce_copy",
        prepare: None,
        complete: bounce_copy_complete,
        error: bounce_copy_error,
    },
];

impl CallbackId {
    pub fn descriptor(self) -> &'static CallbackDescriptor {
        &CALLBACK_TABLE[self as usize]
    }

    /// Resolves a distilled result's `message_id` back to the callback whose
    /// `error` hook should format it (spec §7, scenario §8.5). `None` means
    /// [`NO_CALLBACK`]: the error never passed through a shared callback and
    /// must be formatted directly from `detail`.
    pub fn from_message_id(message_id: u16) -> Option<Self> {
        match message_id {
            x if x == CallbackId::Checksum as u16 => Some(CallbackId::Checksum),
            x if x == CallbackId::BounceCopy as u16 => Some(CallbackId::BounceCopy),
            _ => None,
        }
    }
}

/// Sentinel `message_id` meaning no shared callback claimed this result;
/// distinct from any real [`CallbackId`] discriminant so `0` unambiguously
/// means "attributed to `CallbackId::Checksum`" rather than "unattributed".
pub const NO_CALLBACK: u16 = u16::MAX;

/// Formats a terminal error result into a user-facing message (spec §7,
/// scenario §8.5): resolves `message_id` back to the callback that produced
/// it and defers to that callback's `error` hook, or falls back to a plain
/// errno-based message when no callback claimed it.
pub fn format_error(result: DistilledResult) -> String {
    match CallbackId::from_message_id(result.message_id) {
        Some(callback) => (callback.descriptor().error)(result),
        None => format!("i/o error: errno={}", result.detail),
    }
}

/// Runs the full chain in reverse registration order (spec §4.4), starting
/// from the method backend's raw result, and returns the handle's distilled
/// result. A raw-result error is attributed to the callback nearest the
/// actual I/O (the last one registered, since the chain runs in reverse and
/// that one sees the raw result first) so its `error` hook can later format
/// the message; with no callbacks registered the error is left unattributed.
pub(crate) fn distill(op: OpType, callbacks: &[CallbackId], raw_result: i64) -> DistilledResult {
    let is_error = raw_result < 0;
    let message_id = if is_error {
        callbacks.last().map(|c| *c as u16).unwrap_or(NO_CALLBACK)
    } else {
        NO_CALLBACK
    };
    let mut result = CallbackResult {
        status: if is_error { IoStatus::Error } else { IoStatus::Ok },
        message_id,
        detail: if is_error { (-raw_result) as i32 } else { 0 },
        raw_result,
    };
    for callback in callbacks.iter().rev() {
        result = (callback.descriptor().complete)(op, result);
    }
    result.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distill_negative_raw_result_is_error() {
        let result = distill(OpType::Read, &[CallbackId::Checksum], -5);
        assert_eq!(result.status, IoStatus::Error);
        assert_eq!(result.detail, 5);
        assert_eq!(result.message_id, CallbackId::Checksum as u16);
    }

    #[test]
    fn distill_attributes_the_error_to_the_callback_nearest_the_io() {
        let result = distill(OpType::Read, &[CallbackId::Checksum, CallbackId::BounceCopy], -5);
        assert_eq!(result.message_id, CallbackId::BounceCopy as u16);
        assert_eq!(format_error(result), "bounce buffer copy failed: errno=5");
    }

    #[test]
    fn distill_error_with_no_callbacks_is_unattributed() {
        let result = distill(OpType::Read, &[], -5);
        assert_eq!(result.message_id, NO_CALLBACK);
        assert_eq!(format_error(result), "i/o error: errno=5");
    }

    #[test]
    fn distill_positive_raw_result_is_ok() {
        let result = distill(OpType::Write, &[], 4096);
        assert_eq!(result.status, IoStatus::Ok);
        assert_eq!(result.raw_result, 4096);
    }

    #[test]
    fn error_hook_formats_message() {
        let result = DistilledResult::error(CallbackId::Checksum as u16, 5, -5);
        let message = (CallbackId::Checksum.descriptor().error)(result);
        assert!(message.contains("checksum"));
    }

    #[test]
    fn from_message_id_round_trips_real_callback_ids() {
        assert_eq!(CallbackId::from_message_id(CallbackId::Checksum as u16), Some(CallbackId::Checksum));
        assert_eq!(CallbackId::from_message_id(CallbackId::BounceCopy as u16), Some(CallbackId::BounceCopy));
        assert_eq!(CallbackId::from_message_id(NO_CALLBACK), None);
    }
}

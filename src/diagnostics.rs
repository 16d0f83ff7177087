//! `pg_aios`-style point-in-time view over every handle slot (spec §6
//! "Diagnostics"), grounded on the shape of PostgreSQL's `pg_aios` system
//! view (confirmed against the diesel schema in the reference pack): one
//! row per handle, state, owning backend, and a log-safe subject
//! description.

use crate::handle::{DistilledResult, HandleState, OpType};
use crate::subject::SubjectId;

/// One row of a [`crate::engine::AioEngine::snapshot_handles`] call.
#[derive(Debug, Clone)]
pub struct HandleSnapshot {
    pub index: u32,
    pub generation: u64,
    pub state: HandleState,
    pub owner_backend: Option<u32>,
    pub op: OpType,
    pub subject_description: Option<String>,
    pub last_result: Option<DistilledResult>,
}

impl HandleSnapshot {
    pub(crate) fn describe_subject(subject: Option<SubjectId>, subject_data: u64) -> Option<String> {
        subject.map(|s| (s.descriptor().describe)(subject_data))
    }
}

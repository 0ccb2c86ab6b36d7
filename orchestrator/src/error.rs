//! Typed failures surfaced by an orchestration round.
//!
//! Functions still return `anyhow::Result`; these variants ride inside the
//! `anyhow::Error` so callers can `downcast_ref::<OrchestrateError>()` when
//! they need to branch on the failure class.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::core::reconcile::format_indices;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestrateError {
    /// Two indices of one job array normalize to the same text.
    #[error("duplicate command at indices {first} and {second}: {command}")]
    DuplicateWorkItem {
        first: usize,
        second: usize,
        command: String,
    },

    /// A work item without a program to run.
    #[error("work item at index {index} has no program")]
    EmptyWorkItem { index: usize },

    /// The submission command exited non-zero or returned no job id.
    #[error("submission failed: {0}")]
    SubmissionFailure(String),

    /// The queue or accounting query could not be completed.
    #[error("scheduler poll failed: {0}")]
    PollFailure(String),

    /// The accounting query never listed every requested index.
    #[error("accounting list for job {job_id} is missing indices [{}]", format_indices(.missing))]
    StaleStatusList {
        job_id: String,
        missing: BTreeSet<usize>,
    },

    /// A single array index did not complete.
    #[error("task {index} did not complete")]
    TaskFailure { index: usize },

    /// The routine emitted a different command sequence during replay.
    #[error("replay mismatch at position {position}: expected {expected:?}, found {found:?}")]
    ReplayMismatch {
        position: usize,
        expected: Option<String>,
        found: Option<String>,
    },

    /// A cached output would be replaced by strictly less output.
    #[error("refusing to overwrite cached output for {command} ({existing_len} bytes) with {new_len} bytes")]
    CacheWriteConflict {
        command: String,
        existing_len: usize,
        new_len: usize,
    },

    /// Reuse mode found no output for these indices.
    #[error("no existing output for indices [{}]", format_indices(.indices))]
    MissingResults { indices: BTreeSet<usize> },

    /// The operator declined a confirmation gate.
    #[error("operator declined: {action}")]
    Declined { action: String },
}

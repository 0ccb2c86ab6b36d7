//! Out-of-band maintenance of an existing job directory.
//!
//! These operations work from a submission script on disk rather than from an
//! experiment routine: resubmitting selected indices after a run was accepted
//! with failures, and listing indices that never produced output.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::core::descriptor::{self, rewrite_array_directive};
use crate::core::reconcile::{RetryPlan, failure_report, format_indices, reconcile};
use crate::core::status::TerminalState;
use crate::error::OrchestrateError;
use crate::io::confirm::ConfirmRequest;
use crate::io::fs_util::write_atomic;
use crate::io::job_dir::{JobDir, scan_outputs};
use crate::io::scheduler::SchedulerClient;

/// Job directory holding `script`: its parent, or `.` for a bare file name.
pub fn job_dir_of(script: &Path) -> JobDir {
    match script.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => JobDir::new(parent),
        _ => JobDir::new("."),
    }
}

/// Outcome of a narrowed resubmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RerunReport {
    pub script: PathBuf,
    pub job_id: String,
    pub states: BTreeMap<usize, TerminalState>,
    /// Indices that still have no output.
    pub failed: RetryPlan,
    /// `[i] State: invocation` per failed index; commands come from the
    /// directory's manifest when it has one.
    pub report: String,
}

/// Write `rerun-<name>` next to `script` with the array limited to
/// `indices`.
pub fn write_rerun_script(script: &Path, indices: &RetryPlan) -> Result<PathBuf> {
    if indices.is_empty() {
        bail!("no indices to rerun");
    }
    let contents =
        fs::read_to_string(script).with_context(|| format!("read {}", script.display()))?;
    if descriptor::array_directive(&contents).is_none() {
        bail!("{} has no #SBATCH --array= directive", script.display());
    }
    if let Some(count) = descriptor::job_count(&contents)
        && let Some(&last) = indices.last()
        && last >= count
    {
        bail!("index {last} is outside the job array 0-{}", count - 1);
    }
    let path = JobDir::rerun_script_path(script);
    write_atomic(&path, &rewrite_array_directive(&contents, indices))?;
    Ok(path)
}

/// Resubmit `indices` of `script` after confirmation and classify the outcome.
///
/// Outputs of the targeted indices are removed before submission, so only
/// this round's successes count as completed.
pub fn rerun_failed(
    script: &Path,
    indices: &RetryPlan,
    client: &SchedulerClient<'_>,
) -> Result<RerunReport> {
    let path = write_rerun_script(script, indices)?;
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let action = format!(
        "resubmit {} tasks from {}",
        indices.len(),
        path.display()
    );
    if !client.confirm.confirm(&ConfirmRequest::new(&action).with_details(contents))? {
        return Err(OrchestrateError::Declined { action }.into());
    }
    client.job_dir.remove_outputs(indices)?;

    info!(script = %path.display(), indices = %format_indices(indices), "resubmitting");
    let (job_id, mut states) = client.run_array(&path, indices)?;
    for (&index, state) in &mut states {
        if client.job_dir.read_output(index)?.is_some() {
            *state = TerminalState::Completed;
        } else if *state == TerminalState::Completed {
            *state = TerminalState::Missing;
        }
    }
    let failed = reconcile(&states);
    let manifest = if client.job_dir.manifest_path().exists() {
        Some(client.job_dir.load_manifest()?)
    } else {
        None
    };
    let report = failure_report(&states, &failed, |index| {
        manifest
            .as_ref()
            .and_then(|m| m.entries.get(index))
            .map(|entry| entry.invocation.as_str())
    });
    Ok(RerunReport {
        script: path,
        job_id,
        states,
        failed,
        report,
    })
}

/// Indices of `script`'s array without output, and those without non-blank output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingReport {
    pub missing: Vec<usize>,
    pub missing_or_empty: Vec<usize>,
}

impl MissingReport {
    pub fn is_complete(&self) -> bool {
        self.missing_or_empty.is_empty()
    }
}

pub fn find_missing(script: &Path) -> Result<MissingReport> {
    let contents =
        fs::read_to_string(script).with_context(|| format!("read {}", script.display()))?;
    let (missing, missing_or_empty) = scan_outputs(&job_dir_of(script), &contents)?;
    Ok(MissingReport {
        missing,
        missing_or_empty,
    })
}

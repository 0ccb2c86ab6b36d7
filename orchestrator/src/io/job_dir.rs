//! Layout and file operations of a job directory.
//!
//! ```text
//! {job_dir}/
//!   job_script.sbatch          submission script for the full array
//!   dispatch.sh                per-index dispatch branches
//!   job_array.json             index -> command manifest
//!   rerun-job_script.sbatch    last narrowed resubmission
//!   rerun-<timestamp>.sh       operator rerun helper
//!   {i}.jobout / {i}.joberror  per-index captured output
//!   unfinished.tasks           live queue snapshot
//!   all.tasks                  last accounting snapshot
//!   _aggregated.json           result cache, survives clearing
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::confirm::{Confirm, ConfirmRequest};
use super::fs_util::{make_executable, write_atomic};
use crate::core::descriptor::{
    self, BatchDescriptor, DISPATCH_SCRIPT, SUBMISSION_SCRIPT, output_file_name,
};
use crate::core::job_array::{JobArray, JobEntry};
use crate::core::reconcile::format_indices;
use crate::core::work_item::shell_quote;
use crate::error::OrchestrateError;

pub const CACHE_FILE: &str = "_aggregated.json";
pub const MANIFEST_FILE: &str = "job_array.json";
pub const UNFINISHED_TASKS: &str = "unfinished.tasks";
pub const ALL_TASKS: &str = "all.tasks";

/// Persisted index -> command mapping of the job array in this directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<JobEntry>,
}

#[derive(Debug, Clone)]
pub struct JobDir {
    root: PathBuf,
}

impl JobDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn submission_script_path(&self) -> PathBuf {
        self.root.join(SUBMISSION_SCRIPT)
    }

    pub fn dispatch_script_path(&self) -> PathBuf {
        self.root.join(DISPATCH_SCRIPT)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.root.join(CACHE_FILE)
    }

    pub fn output_path(&self, index: usize) -> PathBuf {
        self.root.join(output_file_name(index))
    }

    /// Sibling of `script` used for narrowed resubmission.
    pub fn rerun_script_path(script: &Path) -> PathBuf {
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| SUBMISSION_SCRIPT.to_string());
        let name = if name.starts_with("rerun-") {
            name
        } else {
            format!("rerun-{name}")
        };
        script.with_file_name(name)
    }

    /// Contents of `name` in this directory, if it exists.
    fn read_optional(&self, name: &str) -> Result<Option<String>> {
        let path = self.root.join(name);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("read {}", path.display()))
    }

    /// True when the directory was generated from exactly this descriptor,
    /// so its per-index outputs belong to the same indices.
    ///
    /// Both scripts are compared: once the dispatch branches are no longer
    /// inlined, the submission script does not depend on the commands.
    pub fn matches(&self, desc: &BatchDescriptor) -> Result<bool> {
        let submission = self.read_optional(SUBMISSION_SCRIPT)?;
        if submission.as_deref() != Some(desc.submission_script.as_str()) {
            return Ok(false);
        }
        let dispatch = self.read_optional(DISPATCH_SCRIPT)?;
        Ok(dispatch.as_deref() == Some(desc.dispatch_script.as_str()))
    }

    /// Remove everything except the aggregated cache, after confirmation.
    pub fn clear(&self, confirm: &dyn Confirm) -> Result<()> {
        let entries = self.entries_except_cache()?;
        if entries.is_empty() {
            fs::create_dir_all(&self.root)
                .with_context(|| format!("create {}", self.root.display()))?;
            return Ok(());
        }
        let action = format!("clear content in {}", self.root.display());
        if !confirm.confirm(&ConfirmRequest::new(&action))? {
            return Err(OrchestrateError::Declined { action }.into());
        }
        for path in entries {
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.with_context(|| format!("remove {}", path.display()))?;
        }
        info!(job_dir = %self.root.display(), "cleared job directory");
        Ok(())
    }

    fn entries_except_cache(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in
            fs::read_dir(&self.root).with_context(|| format!("read {}", self.root.display()))?
        {
            let entry = entry.context("read entry")?;
            if entry.file_name() != CACHE_FILE {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Persist the descriptor scripts and the manifest for audit and retry.
    pub fn write_descriptor(&self, desc: &BatchDescriptor, array: &JobArray) -> Result<()> {
        let submission = self.submission_script_path();
        let dispatch = self.dispatch_script_path();
        write_atomic(&submission, &desc.submission_script)?;
        write_atomic(&dispatch, &desc.dispatch_script)?;
        make_executable(&dispatch)?;
        let manifest = Manifest {
            entries: array.entries().to_vec(),
        };
        let mut buf = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
        buf.push('\n');
        write_atomic(&self.manifest_path(), &buf)?;
        debug!(path = %submission.display(), size = desc.size, "wrote descriptor");
        Ok(())
    }

    pub fn load_manifest(&self) -> Result<Manifest> {
        let path = self.manifest_path();
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    /// Captured stdout of `index`; `None` when the task never succeeded.
    pub fn read_output(&self, index: usize) -> Result<Option<String>> {
        let path = self.output_path(index);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("read {}", path.display()))
    }

    /// Delete the captured stdout of `indices` so a resubmission cannot be
    /// mistaken for success by a stale file.
    pub fn remove_outputs<'a>(&self, indices: impl IntoIterator<Item = &'a usize>) -> Result<()> {
        for &index in indices {
            let path = self.output_path(index);
            if path.exists() {
                fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            }
        }
        Ok(())
    }

    pub fn write_snapshot(&self, name: &str, contents: &str) -> Result<()> {
        let path = self.root.join(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    /// Write an executable `rerun-<timestamp>.sh` that resubmits `indices` of `script`.
    pub fn write_rerun_helper(
        &self,
        program: &str,
        script: &Path,
        indices: &BTreeSet<usize>,
        now: DateTime<Local>,
    ) -> Result<RerunHelper> {
        let list = format_indices(indices);
        let command = format!(
            "{} rerun {} {}",
            shell_quote(program),
            shell_quote(&script.to_string_lossy()),
            list
        );
        let path = self
            .root
            .join(now.format("rerun-%m-%d-%Y-%H-%M-%S.sh").to_string());
        let contents = format!("#!/bin/sh\n\n# failed indices: {list}\n{command}\n");
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        make_executable(&path)?;
        Ok(RerunHelper { path, command })
    }
}

/// An operator-facing rerun script and the command it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RerunHelper {
    pub path: PathBuf,
    pub command: String,
}

/// Indices of a script's array whose outputs are missing, and those missing or empty.
pub fn scan_outputs(dir: &JobDir, script: &str) -> Result<(Vec<usize>, Vec<usize>)> {
    let count = descriptor::job_count(script)
        .context("submission script must contain #SBATCH --array=0-<count-1>")?;
    let mut missing = Vec::new();
    let mut missing_or_empty = Vec::new();
    for index in 0..count {
        match dir.read_output(index)? {
            None => {
                missing.push(index);
                missing_or_empty.push(index);
            }
            Some(text) if text.trim().is_empty() => missing_or_empty.push(index),
            Some(_) => {}
        }
    }
    Ok((missing, missing_or_empty))
}

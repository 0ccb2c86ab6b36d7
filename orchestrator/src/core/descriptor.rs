//! Batch submission and per-index dispatch script generation.
//!
//! Scripts are a pure function of the job array, the resource request and the
//! job directory. Regenerating them must be byte-identical so an existing job
//! directory can be recognised as a reusable prior run.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use super::job_array::JobArray;
use super::reconcile::format_indices;
use super::work_item::shell_quote;

pub const SUBMISSION_SCRIPT: &str = "job_script.sbatch";
pub const DISPATCH_SCRIPT: &str = "dispatch.sh";
pub const ARRAY_DIRECTIVE: &str = "#SBATCH --array=";

/// Captured stdout of one array index.
pub fn output_file_name(index: usize) -> String {
    format!("{index}.jobout")
}

/// Captured stderr of one array index.
pub fn error_file_name(index: usize) -> String {
    format!("{index}.joberror")
}

/// Stdout while the command is still running; renamed on success.
pub fn partial_output_file_name(index: usize) -> String {
    format!("{index}.jobout.partial")
}

/// Resource request shared by every task of one job array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceConfig {
    pub job_name: String,
    /// Wall-clock limit per task in scheduler syntax (e.g. `1-00:00:00`).
    pub time: String,
    /// Memory per task (e.g. `8G`).
    pub mem: String,
    pub cpus_per_task: u32,
    pub nodes: u32,
    pub ntasks: u32,
    pub mail_type: Option<String>,
    /// Node names or ranges the scheduler must avoid.
    pub exclude_nodes: Vec<String>,
    pub partition: Option<String>,
    /// Maximum number of simultaneously running array tasks.
    pub max_concurrent: Option<u32>,
    /// Exit code a task reports when its command fails.
    pub failure_exit_code: i32,
    /// Dispatch bodies larger than this are not inlined into the submission script.
    pub inline_limit_bytes: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            job_name: "orchestrator".to_string(),
            time: "1-00:00:00".to_string(),
            mem: "8G".to_string(),
            cpus_per_task: 36,
            nodes: 1,
            ntasks: 1,
            mail_type: None,
            exclude_nodes: Vec::new(),
            partition: None,
            max_concurrent: None,
            failure_exit_code: 91,
            inline_limit_bytes: 1_000_000,
        }
    }
}

impl ResourceConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.job_name.trim().is_empty(), "resources.job_name must be non-empty");
        ensure!(!self.time.trim().is_empty(), "resources.time must be non-empty");
        ensure!(!self.mem.trim().is_empty(), "resources.mem must be non-empty");
        ensure!(self.cpus_per_task > 0, "resources.cpus_per_task must be > 0");
        ensure!(self.nodes > 0, "resources.nodes must be > 0");
        ensure!(self.ntasks > 0, "resources.ntasks must be > 0");
        ensure!(
            (1..=255).contains(&self.failure_exit_code),
            "resources.failure_exit_code must be in 1..=255"
        );
        if let Some(limit) = self.max_concurrent {
            ensure!(limit > 0, "resources.max_concurrent must be > 0");
        }
        Ok(())
    }

    fn throttle_suffix(&self) -> String {
        self.max_concurrent
            .map(|limit| format!("%{limit}"))
            .unwrap_or_default()
    }
}

/// Generated scripts for one job array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDescriptor {
    pub size: usize,
    pub submission_script: String,
    pub dispatch_script: String,
    /// True when the dispatch branches are embedded in the submission script.
    pub inlined: bool,
}

impl BatchDescriptor {
    /// Same descriptor, with the array directive limited to `indices`.
    pub fn narrowed<'a>(&self, indices: impl IntoIterator<Item = &'a usize>) -> Self {
        Self {
            submission_script: rewrite_array_directive(&self.submission_script, indices),
            ..self.clone()
        }
    }

    pub fn array_directive(&self) -> Option<&str> {
        array_directive(&self.submission_script)
    }
}

/// Build the submission and dispatch scripts for `array`.
pub fn build(array: &JobArray, resources: &ResourceConfig, job_dir: &Path) -> Result<BatchDescriptor> {
    ensure!(!array.is_empty(), "cannot build a descriptor for an empty job array");

    let body = dispatch_body(array, resources, job_dir);
    let dispatch_script = format!("#!/bin/bash\n\n{body}");

    let mut submission = String::from("#!/bin/bash\n");
    for directive in directives(array.len(), resources, job_dir) {
        let _ = writeln!(submission, "#SBATCH {directive}");
    }
    submission.push('\n');

    let inlined = body.len() <= resources.inline_limit_bytes;
    if inlined {
        submission.push_str(&body);
    } else {
        let dispatch_path = job_dir.join(DISPATCH_SCRIPT);
        let _ = writeln!(
            submission,
            "bash {}",
            shell_quote(&dispatch_path.to_string_lossy())
        );
    }

    Ok(BatchDescriptor {
        size: array.len(),
        submission_script: submission,
        dispatch_script,
        inlined,
    })
}

fn directives(size: usize, resources: &ResourceConfig, job_dir: &Path) -> Vec<String> {
    let mut out = vec![
        format!("--job-name={}", resources.job_name),
        format!("--time={}", resources.time),
        format!("--mem={}", resources.mem),
    ];
    if let Some(mail_type) = &resources.mail_type {
        out.push(format!("--mail-type={mail_type}"));
    }
    out.push(format!("--nodes={}", resources.nodes));
    out.push(format!("--ntasks={}", resources.ntasks));
    out.push(format!("--cpus-per-task={}", resources.cpus_per_task));
    out.push(format!(
        "--array=0-{}{}",
        size - 1,
        resources.throttle_suffix()
    ));
    out.push(format!(
        "--out=\"{}\"",
        job_dir.join("slurm-%a.out").display()
    ));
    out.push(format!(
        "--error=\"{}\"",
        job_dir.join("slurm-%a.err").display()
    ));
    if !resources.exclude_nodes.is_empty() {
        out.push(format!("--exclude={}", resources.exclude_nodes.join(",")));
    }
    if let Some(partition) = &resources.partition {
        out.push(format!("--partition={partition}"));
    }
    out
}

fn dispatch_body(array: &JobArray, resources: &ResourceConfig, job_dir: &Path) -> String {
    let path = |name: String| shell_quote(&job_dir.join(name).to_string_lossy());
    let mut body = String::new();
    for entry in array.entries() {
        let i = entry.index;
        let partial = path(partial_output_file_name(i));
        let output = path(output_file_name(i));
        let _ = writeln!(
            body,
            "if [ \"$SLURM_ARRAY_TASK_ID\" == \"{i}\" ]; then rm -f {output}; {} > {partial} 2> {} && mv {partial} {output} || exit {}; fi",
            entry.invocation,
            path(error_file_name(i)),
            resources.failure_exit_code,
        );
    }
    body
}

/// Value of the `--array=` directive, if present.
pub fn array_directive(script: &str) -> Option<&str> {
    script
        .lines()
        .find_map(|line| line.strip_prefix(ARRAY_DIRECTIVE))
        .map(str::trim)
}

/// Replace the array range with an explicit index list, keeping any `%k` throttle.
pub fn rewrite_array_directive<'a>(
    script: &str,
    indices: impl IntoIterator<Item = &'a usize>,
) -> String {
    let list = format_indices(indices);
    script
        .split_inclusive('\n')
        .map(|line| match line.strip_prefix(ARRAY_DIRECTIVE) {
            Some(value) => {
                let throttle = value
                    .trim_end()
                    .split_once('%')
                    .map(|(_, k)| format!("%{k}"))
                    .unwrap_or_default();
                let ending = if line.ends_with('\n') { "\n" } else { "" };
                format!("{ARRAY_DIRECTIVE}{list}{throttle}{ending}")
            }
            None => line.to_string(),
        })
        .collect()
}

/// Indices selected by a script's array directive (`0-3`, `1,4,7`, `0-9%5`).
pub fn array_indices(script: &str) -> Option<Vec<usize>> {
    let value = array_directive(script)?;
    let value = value.split('%').next().unwrap_or(value);
    let mut indices = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().ok()?;
                let hi: usize = hi.trim().parse().ok()?;
                indices.extend(lo..=hi);
            }
            None => indices.push(part.parse().ok()?),
        }
    }
    Some(indices)
}

/// Array size of a full (non-narrowed) submission script.
pub fn job_count(script: &str) -> Option<usize> {
    let value = array_directive(script)?;
    let value = value.split('%').next().unwrap_or(value);
    let last: usize = value.strip_prefix("0-")?.trim().parse().ok()?;
    Some(last + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::work_item::{Normalizer, WorkItem};

    fn echo_array() -> JobArray {
        JobArray::new(
            vec![
                WorkItem::new(["echo", "a"]),
                WorkItem::new(["echo", "b"]),
                WorkItem::new(["echo", "c"]),
            ],
            &Normalizer::default(),
        )
        .expect("array")
    }

    fn resources() -> ResourceConfig {
        ResourceConfig {
            job_name: "test".to_string(),
            time: "00:05:00".to_string(),
            mem: "1G".to_string(),
            cpus_per_task: 1,
            exclude_nodes: vec!["p08r07n[01-08]".to_string(), "p09r11n25".to_string()],
            ..ResourceConfig::default()
        }
    }

    #[test]
    fn submission_script_carries_directives() {
        let desc = build(&echo_array(), &resources(), Path::new("/jobs")).expect("build");
        let expected_head = "#!/bin/bash\n\
            #SBATCH --job-name=test\n\
            #SBATCH --time=00:05:00\n\
            #SBATCH --mem=1G\n\
            #SBATCH --nodes=1\n\
            #SBATCH --ntasks=1\n\
            #SBATCH --cpus-per-task=1\n\
            #SBATCH --array=0-2\n\
            #SBATCH --out=\"/jobs/slurm-%a.out\"\n\
            #SBATCH --error=\"/jobs/slurm-%a.err\"\n\
            #SBATCH --exclude=p08r07n[01-08],p09r11n25\n\n";
        assert!(desc.submission_script.starts_with(expected_head));
        assert!(desc.inlined);
        assert_eq!(desc.size, 3);
    }

    #[test]
    fn dispatch_branch_drops_stale_output_and_signals_failure() {
        let desc = build(&echo_array(), &resources(), Path::new("/jobs")).expect("build");
        let line = "if [ \"$SLURM_ARRAY_TASK_ID\" == \"1\" ]; then rm -f /jobs/1.jobout; echo b > /jobs/1.jobout.partial 2> /jobs/1.joberror && mv /jobs/1.jobout.partial /jobs/1.jobout || exit 91; fi\n";
        assert!(desc.dispatch_script.contains(line));
        assert!(desc.submission_script.contains(line));
    }

    #[test]
    fn large_bodies_are_delegated_to_dispatch_script() {
        let res = ResourceConfig {
            inline_limit_bytes: 10,
            ..resources()
        };
        let desc = build(&echo_array(), &res, Path::new("/jobs")).expect("build");
        assert!(!desc.inlined);
        assert!(desc.submission_script.ends_with("\nbash /jobs/dispatch.sh\n"));
        assert!(!desc.submission_script.contains("SLURM_ARRAY_TASK_ID"));
    }

    #[test]
    fn regeneration_is_byte_identical() {
        let a = build(&echo_array(), &resources(), Path::new("/jobs")).expect("build");
        let b = build(&echo_array(), &resources(), Path::new("/jobs")).expect("build");
        assert_eq!(a, b);
    }

    #[test]
    fn empty_array_is_rejected() {
        assert!(build(&JobArray::default(), &resources(), Path::new("/jobs")).is_err());
    }

    #[test]
    fn optional_directives_follow_config() {
        let res = ResourceConfig {
            partition: Some("scavenge".to_string()),
            mail_type: Some("ALL".to_string()),
            max_concurrent: Some(25),
            exclude_nodes: Vec::new(),
            ..resources()
        };
        let desc = build(&echo_array(), &res, Path::new("/jobs")).expect("build");
        assert!(desc.submission_script.contains("#SBATCH --mail-type=ALL\n"));
        assert!(desc.submission_script.contains("#SBATCH --array=0-2%25\n"));
        assert!(desc.submission_script.contains("#SBATCH --partition=scavenge\n"));
        assert!(!desc.submission_script.contains("--exclude"));
    }

    #[test]
    fn narrowed_rewrites_only_array_line() {
        let desc = build(&echo_array(), &resources(), Path::new("/jobs")).expect("build");
        let narrowed = desc.narrowed(&[1]);
        assert_eq!(narrowed.array_directive(), Some("1"));
        assert_eq!(
            narrowed.submission_script.replace("--array=1\n", "--array=0-2\n"),
            desc.submission_script
        );
        assert_eq!(narrowed.dispatch_script, desc.dispatch_script);
    }

    #[test]
    fn rewrite_keeps_throttle() {
        let script = "#!/bin/bash\n#SBATCH --array=0-9%5\necho\n";
        assert_eq!(
            rewrite_array_directive(script, &[2, 7]),
            "#!/bin/bash\n#SBATCH --array=2,7%5\necho\n"
        );
    }

    #[test]
    fn parses_array_indices() {
        assert_eq!(
            array_indices("#SBATCH --array=0-3\n"),
            Some(vec![0, 1, 2, 3])
        );
        assert_eq!(
            array_indices("#SBATCH --array=1,4-5,9%2\n"),
            Some(vec![1, 4, 5, 9])
        );
        assert_eq!(array_indices("#SBATCH --array=x\n"), None);
        assert_eq!(array_indices("#!/bin/bash\n"), None);
    }

    #[test]
    fn job_count_reads_full_range() {
        assert_eq!(job_count("#SBATCH --array=0-41\n"), Some(42));
        assert_eq!(job_count("#SBATCH --array=0-9%3\n"), Some(10));
        assert_eq!(job_count("#SBATCH --array=1,2\n"), None);
    }
}

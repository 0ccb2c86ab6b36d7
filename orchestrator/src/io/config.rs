//! Orchestrator configuration (TOML).
//!
//! The configuration is loaded once at process start and passed by reference
//! to every component. Nothing in the library reads environment variables.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use serde::{Deserialize, Serialize};

use crate::core::descriptor::ResourceConfig;
use crate::core::status::{Markers, default_active_markers};
use crate::core::work_item::{Normalizer, RewriteRule};

/// How an experiment routine is executed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Run every work item synchronously on this machine.
    #[default]
    Local,
    /// Submit work items as one array job on the cluster scheduler.
    Cluster,
    /// Collect and list the work items without running anything.
    PrintOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub mode: ExecutionMode,

    /// Never submit; feed from the aggregated cache and existing job outputs.
    pub reuse_existing_data: bool,

    /// Directory holding generated scripts, per-index outputs and the cache.
    pub job_dir: PathBuf,

    /// Upper bound on automatic retry rounds after a partial failure.
    pub max_retry_rounds: u32,

    /// Bytes of stdout kept per locally executed work item.
    pub local_output_limit_bytes: usize,

    /// Wall-clock limit for one locally executed work item.
    pub local_timeout_secs: u64,

    /// Program named in generated rerun helpers.
    pub rerun_program: String,

    pub resources: ResourceConfig,
    pub scheduler: SchedulerConfig,
    pub normalize: NormalizeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Local,
            reuse_existing_data: false,
            job_dir: PathBuf::from("slurm_jobs"),
            max_retry_rounds: 5,
            local_output_limit_bytes: 64 * 1024 * 1024,
            local_timeout_secs: 24 * 60 * 60,
            rerun_program: "orchestrator".to_string(),
            resources: ResourceConfig::default(),
            scheduler: SchedulerConfig::default(),
            normalize: NormalizeConfig::default(),
        }
    }
}

/// Scheduler command lines and polling cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Submission command; the script path is appended.
    pub submit_command: Vec<String>,
    /// Queue-status command listing one line per active array task.
    pub queue_command: Vec<String>,
    /// Accounting command; the job id is appended.
    pub accounting_command: Vec<String>,
    /// Token marking a finished task in the accounting listing.
    pub completed_marker: String,
    /// Tokens marking tasks the accounting listing reports as unfinished.
    pub active_markers: Vec<String>,
    pub poll_interval_ms: u64,
    pub stale_retry_interval_ms: u64,
    /// Incomplete accounting listings tolerated before asking the operator.
    pub stale_retry_limit: u32,
    /// Consecutive failed queue queries tolerated before giving up.
    pub max_poll_failures: u32,
    pub command_timeout_secs: u64,
    /// Give up waiting for the queue to drain after this long.
    pub poll_timeout_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            submit_command: vec!["sbatch".to_string()],
            queue_command: vec![
                "squeue".to_string(),
                "--me".to_string(),
                "--array".to_string(),
            ],
            accounting_command: vec!["sacct".to_string(), "-j".to_string()],
            completed_marker: "COMPLETED".to_string(),
            active_markers: default_active_markers(),
            poll_interval_ms: 300,
            stale_retry_interval_ms: 3_000,
            stale_retry_limit: 3,
            max_poll_failures: 10,
            command_timeout_secs: 60,
            poll_timeout_secs: None,
        }
    }
}

impl SchedulerConfig {
    pub fn markers(&self) -> Markers {
        Markers::new(self.completed_marker.clone(), self.active_markers.clone())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_retry_interval(&self) -> Duration {
        Duration::from_millis(self.stale_retry_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout_secs.map(Duration::from_secs)
    }
}

/// Rewrite rules collapsing irrelevant parts of commands before cache lookup.
///
/// Paths that change between runs (temporary files, build directories) only
/// stop causing cache misses when a rule names them explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct NormalizeConfig {
    pub rules: Vec<RewriteRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewriteRuleConfig {
    /// Regular expression matched against each token.
    pub pattern: String,
    pub replacement: String,
}

impl NormalizeConfig {
    pub fn normalizer(&self) -> Result<Normalizer> {
        let rules = self
            .rules
            .iter()
            .map(|rule| {
                RewriteRule::new(&rule.pattern, rule.replacement.clone())
                    .with_context(|| format!("compile normalize rule '{}'", rule.pattern))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Normalizer::new(rules))
    }
}

impl OrchestratorConfig {
    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_dir.as_os_str().is_empty() {
            return Err(anyhow!("job_dir must be non-empty"));
        }
        ensure!(
            self.local_output_limit_bytes > 0,
            "local_output_limit_bytes must be > 0"
        );
        ensure!(self.local_timeout_secs > 0, "local_timeout_secs must be > 0");
        ensure!(
            !self.rerun_program.trim().is_empty(),
            "rerun_program must be non-empty"
        );
        self.resources.validate()?;
        let sched = &self.scheduler;
        for (name, command) in [
            ("submit_command", &sched.submit_command),
            ("queue_command", &sched.queue_command),
            ("accounting_command", &sched.accounting_command),
        ] {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(anyhow!("scheduler.{name} must be a non-empty array"));
            }
        }
        ensure!(
            !sched.completed_marker.trim().is_empty(),
            "scheduler.completed_marker must be non-empty"
        );
        ensure!(
            sched.command_timeout_secs > 0,
            "scheduler.command_timeout_secs must be > 0"
        );
        self.normalize.normalizer()?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::fs_util::write_atomic(path, &buf)
}

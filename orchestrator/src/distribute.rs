//! Orchestration rounds.
//!
//! [`Orchestrator::run`] executes an experiment routine in the configured
//! mode. In cluster mode one call goes through these states:
//!
//! ```text
//! collect -> lookup -> (all cached) ----------------------------> persist -> feed
//!                   -> prepare job dir -> submit -> wait -> reconcile
//!                                           ^                    |
//!                                           +---- retry round ---+-> persist -> feed
//! ```

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::Local;
use tracing::{debug, info, instrument, warn};

use crate::collect::{CommandRunner, collect};
use crate::core::descriptor::{self, BatchDescriptor};
use crate::core::job_array::JobArray;
use crate::core::reconcile::{RetryPlan, failure_report, format_indices, reconcile};
use crate::core::status::TerminalState;
use crate::core::work_item::Normalizer;
use crate::error::OrchestrateError;
use crate::feed::feed;
use crate::io::cache::ResultCache;
use crate::io::clock::Clock;
use crate::io::config::{ExecutionMode, OrchestratorConfig};
use crate::io::confirm::{Confirm, ConfirmRequest};
use crate::io::fs_util::write_atomic;
use crate::io::job_dir::JobDir;
use crate::io::scheduler::{Scheduler, SchedulerClient};
use crate::local::LocalRunner;

/// How the last round of a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    AllCompleted,
    /// The operator (or the retry bound) stopped with these indices failed.
    AcceptedWithFailures {
        failed: BTreeSet<usize>,
        /// `[i] State: invocation` per failed index.
        report: String,
        /// Command of the generated rerun helper.
        rerun_command: String,
    },
}

impl RoundOutcome {
    pub fn failed(&self) -> Option<&BTreeSet<usize>> {
        match self {
            Self::AllCompleted => None,
            Self::AcceptedWithFailures { failed, .. } => Some(failed),
        }
    }
}

/// Result of one orchestrated run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distributed<T> {
    /// The routine's value; `None` in print-only mode.
    pub value: Option<T>,
    pub outcome: RoundOutcome,
    /// Scheduler submissions made by this run.
    pub submissions: usize,
    /// Collected invocations, in index order (print-only mode).
    pub commands: Vec<String>,
}

impl<T> Distributed<T> {
    fn completed(value: T, submissions: usize) -> Self {
        Self {
            value: Some(value),
            outcome: RoundOutcome::AllCompleted,
            submissions,
            commands: Vec::new(),
        }
    }

    /// Error with the first failed index unless every task completed.
    pub fn require_all_completed(&self) -> Result<(), OrchestrateError> {
        match &self.outcome {
            RoundOutcome::AllCompleted => Ok(()),
            RoundOutcome::AcceptedWithFailures { failed, .. } => match failed.first() {
                Some(&index) => Err(OrchestrateError::TaskFailure { index }),
                None => Ok(()),
            },
        }
    }
}

/// Runs experiment routines against the configured backend.
pub struct Orchestrator<'a> {
    pub config: &'a OrchestratorConfig,
    pub normalizer: Normalizer,
    pub scheduler: &'a dyn Scheduler,
    pub clock: &'a dyn Clock,
    pub confirm: &'a dyn Confirm,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a OrchestratorConfig,
        scheduler: &'a dyn Scheduler,
        clock: &'a dyn Clock,
        confirm: &'a dyn Confirm,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            normalizer: config.normalize.normalizer()?,
            scheduler,
            clock,
            confirm,
        })
    }

    pub fn job_dir(&self) -> JobDir {
        JobDir::new(&self.config.job_dir)
    }

    /// Run `routine` once (local), not at all (print-only), or twice
    /// (cluster: collect, then feed).
    pub fn run<T, F>(&self, mut routine: F) -> Result<Distributed<T>>
    where
        F: FnMut(&mut dyn CommandRunner) -> Result<T>,
    {
        match self.config.mode {
            ExecutionMode::Local => {
                let mut runner = LocalRunner::new(
                    self.config.local_timeout(),
                    self.config.local_output_limit_bytes,
                );
                let value = routine(&mut runner)?;
                Ok(Distributed::completed(value, 0))
            }
            ExecutionMode::PrintOnly => {
                let array = collect(&mut routine, &self.normalizer)?;
                Ok(Distributed {
                    value: None,
                    outcome: RoundOutcome::AllCompleted,
                    submissions: 0,
                    commands: array
                        .entries()
                        .iter()
                        .map(|entry| entry.invocation.clone())
                        .collect(),
                })
            }
            ExecutionMode::Cluster => self.run_cluster(&mut routine),
        }
    }

    #[instrument(skip_all, fields(job_dir = %self.config.job_dir.display()))]
    fn run_cluster<T, F>(&self, routine: &mut F) -> Result<Distributed<T>>
    where
        F: FnMut(&mut dyn CommandRunner) -> Result<T>,
    {
        let failure_exit_code = self.config.resources.failure_exit_code;
        let array = collect(routine, &self.normalizer)?;
        info!(tasks = array.len(), "collected job array");
        if array.is_empty() {
            let value = feed(routine, &array, &self.normalizer, &BTreeMap::new(), failure_exit_code)?;
            return Ok(Distributed::completed(value, 0));
        }

        let job_dir = self.job_dir();
        let mut cache = ResultCache::load(&job_dir.cache_path())?;
        let desc = descriptor::build(&array, &self.config.resources, job_dir.root())?;
        let reusable = job_dir.matches(&desc)?;
        let lookup = cache.lookup(&array, reusable.then_some(&job_dir))?;
        info!(
            hits = lookup.hits.len(),
            misses = lookup.misses.len(),
            reusable,
            "looked up existing results"
        );

        if self.config.reuse_existing_data && !lookup.misses.is_empty() {
            return Err(OrchestrateError::MissingResults {
                indices: lookup.misses,
            }
            .into());
        }

        let mut outputs = lookup.hits;
        let mut outcome = RoundOutcome::AllCompleted;
        let mut submissions = 0usize;
        if !lookup.misses.is_empty() {
            if !reusable {
                job_dir.clear(self.confirm)?;
            }
            job_dir.write_descriptor(&desc, &array)?;
            let action = format!(
                "submit {} of {} tasks from {}",
                lookup.misses.len(),
                array.len(),
                job_dir.submission_script_path().display()
            );
            let request = ConfirmRequest::new(&action).with_details(desc.submission_script.clone());
            if !self.confirm.confirm(&request)? {
                return Err(OrchestrateError::Declined { action }.into());
            }
            (outcome, submissions) =
                self.submit_rounds(&job_dir, &desc, &array, lookup.misses, &mut outputs)?;
        }

        cache.persist(&array, &outputs)?;
        let value = feed(routine, &array, &self.normalizer, &outputs, failure_exit_code)?;
        Ok(Distributed {
            value: Some(value),
            outcome,
            submissions,
            commands: Vec::new(),
        })
    }

    /// Submit `pending`, then keep resubmitting failed indices while the
    /// operator approves and the retry bound allows.
    fn submit_rounds(
        &self,
        job_dir: &JobDir,
        desc: &BatchDescriptor,
        array: &JobArray,
        mut pending: RetryPlan,
        outputs: &mut BTreeMap<usize, String>,
    ) -> Result<(RoundOutcome, usize)> {
        let client = SchedulerClient {
            scheduler: self.scheduler,
            clock: self.clock,
            confirm: self.confirm,
            config: &self.config.scheduler,
            job_dir,
        };
        let full_script = job_dir.submission_script_path();
        let mut retries = 0u32;
        let mut submissions = 0usize;
        loop {
            let script = if pending.len() == array.len() {
                full_script.clone()
            } else {
                let path = JobDir::rerun_script_path(&full_script);
                write_atomic(&path, &desc.narrowed(&pending).submission_script)?;
                path
            };
            info!(round = retries, tasks = pending.len(), "submitting round");
            let (job_id, states) = client.run_array(&script, &pending)?;
            submissions += 1;

            let states = harvest(job_dir, &states, &pending, outputs)?;
            let plan = reconcile(&states);
            if plan.is_empty() {
                info!(job_id = %job_id, "all tasks completed");
                return Ok((RoundOutcome::AllCompleted, submissions));
            }

            let report = failure_report(&states, &plan, |index| {
                array.get(index).map(|entry| entry.invocation.as_str())
            });
            let helper = job_dir.write_rerun_helper(
                &self.config.rerun_program,
                &full_script,
                &plan,
                Local::now(),
            )?;
            warn!(
                job_id = %job_id,
                failed = %format_indices(&plan),
                helper = %helper.path.display(),
                "tasks failed"
            );
            let accepted = |plan: RetryPlan| RoundOutcome::AcceptedWithFailures {
                failed: plan,
                report: report.clone(),
                rerun_command: helper.command.clone(),
            };
            if retries >= self.config.max_retry_rounds {
                warn!(retries, "retry limit reached; accepting failures");
                return Ok((accepted(plan), submissions));
            }
            let request = ConfirmRequest::new(format!("retry {} failed tasks", plan.len()))
                .with_details(format!("{report}rerun later with: {}\n", helper.command));
            if !self.confirm.confirm(&request)? {
                info!(failed = %format_indices(&plan), "failures accepted by operator");
                return Ok((accepted(plan), submissions));
            }
            retries += 1;
            pending = plan;
        }
    }
}

/// Read outputs of `pending` and settle their final states.
///
/// An index counts as completed exactly when its output file exists; a
/// scheduler-reported completion without output becomes `Missing`.
fn harvest(
    job_dir: &JobDir,
    states: &BTreeMap<usize, TerminalState>,
    pending: &RetryPlan,
    outputs: &mut BTreeMap<usize, String>,
) -> Result<BTreeMap<usize, TerminalState>> {
    let mut settled = BTreeMap::new();
    for &index in pending {
        let reported = states.get(&index).copied().unwrap_or(TerminalState::Missing);
        let state = match job_dir.read_output(index)? {
            Some(output) => {
                if reported != TerminalState::Completed {
                    debug!(index, ?reported, "output present despite reported state");
                }
                outputs.insert(index, output);
                TerminalState::Completed
            }
            None if reported == TerminalState::Completed => {
                warn!(index, "completed without output");
                TerminalState::Missing
            }
            None => reported,
        };
        settled.insert(index, state);
    }
    Ok(settled)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::collect::RunOutput;
    use crate::core::work_item::WorkItem;
    use crate::io::confirm::FixedConfirm;
    use crate::test_support::{FakeScheduler, ManualClock};

    fn echo_routine(runner: &mut dyn CommandRunner) -> Result<Vec<RunOutput>> {
        ["a", "b"]
            .iter()
            .map(|arg| runner.run(&WorkItem::new(["echo", *arg])))
            .collect()
    }

    fn cluster_config(dir: &Path) -> OrchestratorConfig {
        OrchestratorConfig {
            mode: ExecutionMode::Cluster,
            job_dir: dir.join("jobs"),
            ..OrchestratorConfig::default()
        }
    }

    #[test]
    fn print_only_lists_invocations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = OrchestratorConfig {
            mode: ExecutionMode::PrintOnly,
            ..cluster_config(temp.path())
        };
        let sched = FakeScheduler::new();
        let clock = ManualClock::new();
        let orch = Orchestrator::new(&config, &sched, &clock, &FixedConfirm(true)).expect("new");
        let result = orch.run(echo_routine).expect("run");
        assert_eq!(result.value, None);
        assert_eq!(result.commands, vec!["echo a", "echo b"]);
        assert_eq!(sched.submissions(), 0);
        assert!(!config.job_dir.exists());
    }

    #[test]
    fn local_mode_runs_synchronously() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = OrchestratorConfig {
            mode: ExecutionMode::Local,
            ..cluster_config(temp.path())
        };
        let sched = FakeScheduler::new();
        let clock = ManualClock::new();
        let orch = Orchestrator::new(&config, &sched, &clock, &FixedConfirm(true)).expect("new");
        let result = orch.run(echo_routine).expect("run");
        let value = result.value.expect("value");
        assert_eq!(value[1].stdout, "b\n");
        assert_eq!(result.submissions, 0);
    }

    #[test]
    fn declined_submission_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = cluster_config(temp.path());
        let sched = FakeScheduler::new();
        let clock = ManualClock::new();
        let orch = Orchestrator::new(&config, &sched, &clock, &FixedConfirm(false)).expect("new");
        let err = orch.run(echo_routine).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestrateError>(),
            Some(OrchestrateError::Declined { .. })
        ));
        assert_eq!(sched.submissions(), 0);
    }

    #[test]
    fn retry_bound_accepts_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = OrchestratorConfig {
            max_retry_rounds: 1,
            ..cluster_config(temp.path())
        };
        let sched = FakeScheduler::new().fail_on_submission(0, [1]).fail_on_submission(1, [1]);
        let clock = ManualClock::new();
        let orch = Orchestrator::new(&config, &sched, &clock, &FixedConfirm(true)).expect("new");
        let result = orch.run(echo_routine).expect("run");
        assert_eq!(result.outcome.failed(), Some(&[1].into_iter().collect()));
        assert_eq!(result.submissions, 2);
        assert_eq!(
            result.require_all_completed(),
            Err(OrchestrateError::TaskFailure { index: 1 })
        );
        let value = result.value.expect("value");
        assert_eq!(value[0].stdout, "a\n");
        assert_eq!(value[1], RunOutput::failed(91));
    }

    #[test]
    fn exhausted_retry_bound_still_reports_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = OrchestratorConfig {
            max_retry_rounds: 0,
            ..cluster_config(temp.path())
        };
        let sched = FakeScheduler::new().fail_on_submission(0, [1]);
        let clock = ManualClock::new();
        let orch = Orchestrator::new(&config, &sched, &clock, &FixedConfirm(true)).expect("new");
        let result = orch.run(echo_routine).expect("run");
        let RoundOutcome::AcceptedWithFailures {
            failed,
            report,
            rerun_command,
        } = &result.outcome
        else {
            panic!("expected accepted failures, got {:?}", result.outcome);
        };
        assert_eq!(failed, &[1].into_iter().collect::<BTreeSet<_>>());
        assert_eq!(report, "[1] Failed: echo b\n");
        assert!(rerun_command.ends_with(" 1"));
        assert!(rerun_command.contains("job_script.sbatch"));
        assert_eq!(sched.submissions(), 1);
    }

    #[test]
    fn completed_without_output_is_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = JobDir::new(temp.path());
        let states = [(0, TerminalState::Completed), (1, TerminalState::Failed)]
            .into_iter()
            .collect();
        std::fs::write(dir.output_path(1), "late\n").expect("write");
        let mut outputs = BTreeMap::new();
        let settled = harvest(&dir, &states, &[0, 1].into_iter().collect(), &mut outputs)
            .expect("harvest");
        assert_eq!(settled[&0], TerminalState::Missing);
        assert_eq!(settled[&1], TerminalState::Completed);
        assert_eq!(outputs.get(&1).map(String::as_str), Some("late\n"));
    }
}

//! Cluster scheduler client.
//!
//! The [`Scheduler`] trait is the raw command boundary (submission, queue
//! listing, accounting listing). [`SchedulerClient`] layers the polling and
//! classification rules on top, parsing text through `core::status`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, Deadline};
use super::config::SchedulerConfig;
use super::confirm::{Confirm, ConfirmRequest};
use super::job_dir::{ALL_TASKS, JobDir, UNFINISHED_TASKS};
use super::process::run_command_with_timeout;
use crate::core::reconcile::format_indices;
use crate::core::status::{
    Markers, StatusLine, TerminalState, classify, matching_lines, parse_job_id, snapshot,
};
use crate::error::OrchestrateError;

const SCHEDULER_OUTPUT_LIMIT_BYTES: usize = 16 * 1024 * 1024;

/// Raw access to a batch scheduler's command line tools.
pub trait Scheduler {
    /// Submit `script`; returns the acknowledgement text.
    fn submit(&self, script: &Path) -> Result<String>;
    /// One line per active array task.
    fn queue_status(&self) -> Result<String>;
    /// One line per historical task of `job_id`.
    fn accounting(&self, job_id: &str) -> Result<String>;
}

/// Slurm via `sbatch`, `squeue` and `sacct` (commands configurable).
pub struct SlurmScheduler {
    config: SchedulerConfig,
}

impl SlurmScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    fn run(&self, argv: &[String], extra: &[&str]) -> Result<Result<String, String>> {
        let (program, args) = argv
            .split_first()
            .context("scheduler command must not be empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args).args(extra);
        let output = run_command_with_timeout(
            cmd,
            self.config.command_timeout(),
            SCHEDULER_OUTPUT_LIMIT_BYTES,
        )?;
        if output.success() {
            Ok(Ok(output.stdout_text()))
        } else {
            Ok(Err(format!("{program}: {}", output.failure_summary())))
        }
    }
}

impl Scheduler for SlurmScheduler {
    fn submit(&self, script: &Path) -> Result<String> {
        let script = script.to_string_lossy();
        match self.run(&self.config.submit_command, &[script.as_ref()]) {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(msg)) => Err(OrchestrateError::SubmissionFailure(msg).into()),
            Err(err) => Err(OrchestrateError::SubmissionFailure(format!("{err:#}")).into()),
        }
    }

    fn queue_status(&self) -> Result<String> {
        match self.run(&self.config.queue_command, &[]) {
            Ok(Ok(listing)) => Ok(listing),
            Ok(Err(msg)) => Err(OrchestrateError::PollFailure(msg).into()),
            Err(err) => Err(OrchestrateError::PollFailure(format!("{err:#}")).into()),
        }
    }

    fn accounting(&self, job_id: &str) -> Result<String> {
        match self.run(&self.config.accounting_command, &[job_id]) {
            Ok(Ok(listing)) => Ok(listing),
            Ok(Err(msg)) => Err(OrchestrateError::PollFailure(msg).into()),
            Err(err) => Err(OrchestrateError::PollFailure(format!("{err:#}")).into()),
        }
    }
}

/// Submission, polling and final-state classification for one job directory.
pub struct SchedulerClient<'a> {
    pub scheduler: &'a dyn Scheduler,
    pub clock: &'a dyn Clock,
    pub confirm: &'a dyn Confirm,
    pub config: &'a SchedulerConfig,
    pub job_dir: &'a JobDir,
}

impl SchedulerClient<'_> {
    fn markers(&self) -> Markers {
        self.config.markers()
    }

    /// Submit `script` and return the scheduler's job id.
    #[instrument(skip_all, fields(script = %script.display()))]
    pub fn submit(&self, script: &Path) -> Result<String> {
        let ack = self.scheduler.submit(script)?;
        let job_id = parse_job_id(&ack).ok_or_else(|| {
            OrchestrateError::SubmissionFailure(format!(
                "no job id in acknowledgement {:?}",
                ack.trim()
            ))
        })?;
        info!(job_id = %job_id, "submitted");
        Ok(job_id)
    }

    /// Active tasks of `job_id` among `indices`. Writes `unfinished.tasks`.
    pub fn poll(&self, job_id: &str, indices: &BTreeSet<usize>) -> Result<BTreeMap<usize, StatusLine>> {
        let listing = self.scheduler.queue_status()?;
        let active = matching_lines(&listing, job_id, indices, &self.markers());
        self.job_dir
            .write_snapshot(UNFINISHED_TASKS, &snapshot(&listing, &active))?;
        Ok(active)
    }

    /// Sleep-poll until no task of `job_id` is queued or running.
    ///
    /// Failed queue queries are retried at the poll interval; more than
    /// `max_poll_failures` in a row, or exceeding `poll_timeout`, is fatal.
    #[instrument(skip_all, fields(job_id = %job_id, tasks = indices.len()))]
    pub fn wait_until_idle(&self, job_id: &str, indices: &BTreeSet<usize>) -> Result<()> {
        let deadline = Deadline::after(self.clock, self.config.poll_timeout());
        let mut failures = 0u32;
        let mut last_remaining = None;
        loop {
            // Fresh submissions take a moment to show up in the queue.
            self.clock.sleep(self.config.poll_interval());
            match self.poll(job_id, indices) {
                Ok(active) => {
                    failures = 0;
                    if last_remaining != Some(active.len()) {
                        info!(remaining = active.len(), total = indices.len(), "jobs remaining");
                        last_remaining = Some(active.len());
                    }
                    if active.is_empty() {
                        return Ok(());
                    }
                }
                Err(err) if is_poll_failure(&err) => {
                    failures += 1;
                    warn!(failures, err = %err, "queue query failed");
                    if failures > self.config.max_poll_failures {
                        return Err(err.context(format!(
                            "queue query failed {failures} times in a row"
                        )));
                    }
                }
                Err(err) => return Err(err),
            }
            if deadline.expired(self.clock) {
                return Err(OrchestrateError::PollFailure(format!(
                    "job {job_id} still active after {:?}",
                    self.config.poll_timeout().unwrap_or_default()
                ))
                .into());
            }
        }
    }

    /// Terminal state of every index in `indices`. Writes `all.tasks`.
    ///
    /// An accounting listing that omits requested indices (or still shows
    /// them active) is retried `stale_retry_limit` times; after that the
    /// operator decides whether the absent indices count as `Missing`.
    #[instrument(skip_all, fields(job_id = %job_id, tasks = indices.len()))]
    pub fn final_states(
        &self,
        job_id: &str,
        indices: &BTreeSet<usize>,
    ) -> Result<BTreeMap<usize, TerminalState>> {
        let markers = self.markers();
        let mut attempts = 0u32;
        loop {
            let (mut states, unlisted) = match self.scheduler.accounting(job_id) {
                Ok(listing) => {
                    let matched = matching_lines(&listing, job_id, indices, &markers);
                    self.job_dir
                        .write_snapshot(ALL_TASKS, &snapshot(&listing, &matched))?;
                    classify(&matched, indices)
                }
                Err(err) if is_poll_failure(&err) => {
                    warn!(err = %err, "accounting query failed");
                    (BTreeMap::new(), indices.clone())
                }
                Err(err) => return Err(err),
            };
            if unlisted.is_empty() {
                debug!("accounting list complete");
                return Ok(states);
            }

            attempts += 1;
            warn!(
                attempts,
                missing = %format_indices(&unlisted),
                "accounting list incomplete"
            );
            if attempts >= self.config.stale_retry_limit {
                let request = ConfirmRequest::new(
                    "accounting list is incomplete, perhaps because of interrupted tasks; treat the absent tasks as missing",
                )
                .with_details(format!(
                    "job {job_id}: no final state for indices [{}]\n",
                    format_indices(&unlisted)
                ));
                if !self.confirm.confirm(&request)? {
                    return Err(OrchestrateError::StaleStatusList {
                        job_id: job_id.to_string(),
                        missing: unlisted,
                    }
                    .into());
                }
                for index in unlisted {
                    states.insert(index, TerminalState::Missing);
                }
                return Ok(states);
            }
            self.clock.sleep(self.config.stale_retry_interval());
        }
    }

    /// Submit `script`, wait for the indices it covers, and classify them.
    pub fn run_array(
        &self,
        script: &Path,
        indices: &BTreeSet<usize>,
    ) -> Result<(String, BTreeMap<usize, TerminalState>)> {
        let job_id = self.submit(script)?;
        self.wait_until_idle(&job_id, indices)?;
        let states = self.final_states(&job_id, indices)?;
        Ok((job_id, states))
    }
}

fn is_poll_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<OrchestrateError>(),
        Some(OrchestrateError::PollFailure(_))
    )
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::*;
    use crate::io::confirm::FixedConfirm;
    use crate::test_support::ManualClock;

    /// Replays canned listings in order.
    #[derive(Default)]
    struct CannedScheduler {
        ack: String,
        queue: RefCell<VecDeque<Result<String, String>>>,
        accounting: RefCell<VecDeque<String>>,
    }

    impl Scheduler for CannedScheduler {
        fn submit(&self, _script: &Path) -> Result<String> {
            Ok(self.ack.clone())
        }

        fn queue_status(&self) -> Result<String> {
            match self.queue.borrow_mut().pop_front() {
                Some(Ok(listing)) => Ok(listing),
                Some(Err(msg)) => Err(OrchestrateError::PollFailure(msg).into()),
                None => Ok(String::new()),
            }
        }

        fn accounting(&self, _job_id: &str) -> Result<String> {
            Ok(self.accounting.borrow_mut().pop_front().unwrap_or_default())
        }
    }

    fn indices(list: &[usize]) -> BTreeSet<usize> {
        list.iter().copied().collect()
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            max_poll_failures: 2,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn submit_extracts_job_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = JobDir::new(temp.path());
        let sched = CannedScheduler {
            ack: "Submitted batch job 777\n".to_string(),
            ..CannedScheduler::default()
        };
        let clock = ManualClock::new();
        let cfg = config();
        let client = SchedulerClient {
            scheduler: &sched,
            clock: &clock,
            confirm: &FixedConfirm(true),
            config: &cfg,
            job_dir: &dir,
        };
        assert_eq!(client.submit(Path::new("x.sbatch")).expect("submit"), "777");
    }

    #[test]
    fn submit_without_job_id_is_submission_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = JobDir::new(temp.path());
        let sched = CannedScheduler {
            ack: "sbatch: error: invalid partition!\n".to_string(),
            ..CannedScheduler::default()
        };
        let clock = ManualClock::new();
        let cfg = config();
        let client = SchedulerClient {
            scheduler: &sched,
            clock: &clock,
            confirm: &FixedConfirm(true),
            config: &cfg,
            job_dir: &dir,
        };
        let err = client.submit(Path::new("x.sbatch")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestrateError>(),
            Some(OrchestrateError::SubmissionFailure(_))
        ));
    }

    #[test]
    fn wait_polls_until_idle_and_tolerates_transient_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = JobDir::new(temp.path());
        let sched = CannedScheduler::default();
        sched.queue.borrow_mut().extend([
            Ok("JOBID NAME\n9_0 t\n9_1 t\n8_0 other\n".to_string()),
            Err("squeue: socket timed out".to_string()),
            Ok("JOBID NAME\n9_1 t\n".to_string()),
            Ok("JOBID NAME\n8_0 other\n".to_string()),
        ]);
        let clock = ManualClock::new();
        let cfg = config();
        let client = SchedulerClient {
            scheduler: &sched,
            clock: &clock,
            confirm: &FixedConfirm(true),
            config: &cfg,
            job_dir: &dir,
        };
        client
            .wait_until_idle("9", &indices(&[0, 1]))
            .expect("wait");
        assert_eq!(clock.sleeps(), 4);
        let snap = std::fs::read_to_string(temp.path().join(UNFINISHED_TASKS)).expect("snapshot");
        assert_eq!(snap, "JOBID NAME\n");
    }

    #[test]
    fn wait_gives_up_after_repeated_poll_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = JobDir::new(temp.path());
        let sched = CannedScheduler::default();
        sched
            .queue
            .borrow_mut()
            .extend((0..3).map(|_| Err("down".to_string())));
        let clock = ManualClock::new();
        let cfg = config();
        let client = SchedulerClient {
            scheduler: &sched,
            clock: &clock,
            confirm: &FixedConfirm(true),
            config: &cfg,
            job_dir: &dir,
        };
        let err = client.wait_until_idle("9", &indices(&[0])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestrateError>(),
            Some(OrchestrateError::PollFailure(_))
        ));
    }

    #[test]
    fn wait_honours_poll_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = JobDir::new(temp.path());
        let sched = CannedScheduler::default();
        sched
            .queue
            .borrow_mut()
            .extend((0..100).map(|_| Ok("9_0 t RUNNING\n".to_string())));
        let clock = ManualClock::new();
        let cfg = SchedulerConfig {
            poll_interval_ms: 1_000,
            poll_timeout_secs: Some(5),
            ..config()
        };
        let client = SchedulerClient {
            scheduler: &sched,
            clock: &clock,
            confirm: &FixedConfirm(true),
            config: &cfg,
            job_dir: &dir,
        };
        assert!(client.wait_until_idle("9", &indices(&[0])).is_err());
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn final_states_retries_stale_listing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = JobDir::new(temp.path());
        let sched = CannedScheduler::default();
        sched.accounting.borrow_mut().extend([
            "JobID State\n9_0 COMPLETED\n".to_string(),
            "JobID State\n9_0 COMPLETED\n9_1 FAILED\n".to_string(),
        ]);
        let clock = ManualClock::new();
        let cfg = config();
        let client = SchedulerClient {
            scheduler: &sched,
            clock: &clock,
            confirm: &FixedConfirm(false),
            config: &cfg,
            job_dir: &dir,
        };
        let states = client.final_states("9", &indices(&[0, 1])).expect("states");
        assert_eq!(states[&0], TerminalState::Completed);
        assert_eq!(states[&1], TerminalState::Failed);
        assert_eq!(clock.sleeps(), 1);
        let snap = std::fs::read_to_string(temp.path().join(ALL_TASKS)).expect("snapshot");
        assert_eq!(snap, "JobID State\n9_0 COMPLETED\n9_1 FAILED\n");
    }

    #[test]
    fn stale_listing_escalates_to_operator() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = JobDir::new(temp.path());
        let cfg = config();
        let clock = ManualClock::new();

        let sched = CannedScheduler::default();
        sched
            .accounting
            .borrow_mut()
            .extend((0..3).map(|_| "9_0 COMPLETED\n".to_string()));
        let approving = SchedulerClient {
            scheduler: &sched,
            clock: &clock,
            confirm: &FixedConfirm(true),
            config: &cfg,
            job_dir: &dir,
        };
        let states = approving
            .final_states("9", &indices(&[0, 1]))
            .expect("states");
        assert_eq!(states[&1], TerminalState::Missing);

        let sched = CannedScheduler::default();
        let declining = SchedulerClient {
            scheduler: &sched,
            clock: &clock,
            confirm: &FixedConfirm(false),
            config: &cfg,
            job_dir: &dir,
        };
        let err = declining.final_states("9", &indices(&[0])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestrateError>(),
            Some(OrchestrateError::StaleStatusList { .. })
        ));
    }

    #[test]
    fn running_tasks_in_accounting_are_not_final() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = JobDir::new(temp.path());
        let sched = CannedScheduler::default();
        sched.accounting.borrow_mut().extend([
            "9_0 RUNNING\n".to_string(),
            "9_0 COMPLETED\n".to_string(),
        ]);
        let clock = ManualClock::new();
        let cfg = config();
        let client = SchedulerClient {
            scheduler: &sched,
            clock: &clock,
            confirm: &FixedConfirm(false),
            config: &cfg,
            job_dir: &dir,
        };
        let states = client.final_states("9", &indices(&[0])).expect("states");
        assert_eq!(states[&0], TerminalState::Completed);
    }
}

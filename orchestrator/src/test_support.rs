//! Scripted collaborators for tests.
//!
//! [`FakeScheduler`] plays the cluster: on submission it reads the job
//! directory's manifest and writes the per-index output files itself, failing
//! the indices it was told to fail. No process is spawned.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::core::descriptor::{self, ResourceConfig, error_file_name};
use crate::core::job_array::JobArray;
use crate::core::work_item::{Normalizer, WorkItem};
use crate::io::clock::Clock;
use crate::io::confirm::{Confirm, ConfirmRequest};
use crate::io::job_dir::JobDir;
use crate::io::scheduler::Scheduler;
use crate::rerun::job_dir_of;

const QUEUE_HEADER: &str = "JOBID PARTITION NAME USER ST TIME NODES NODELIST(REASON)";
const ACCOUNTING_HEADER: &str = "JobID JobName Partition Account AllocCPUS State ExitCode";

/// Stdout the fake cluster produces for `item`: its arguments, echo style.
pub fn simulated_output(item: &WorkItem) -> String {
    let args = item.tokens().get(1..).unwrap_or_default();
    format!("{}\n", args.join(" "))
}

#[derive(Debug)]
struct FakeJob {
    id: String,
    indices: Vec<usize>,
    failed: BTreeSet<usize>,
    queue_polls_left: u32,
}

#[derive(Debug, Default)]
struct FakeState {
    scripts: Vec<String>,
    jobs: Vec<FakeJob>,
    stale_left: u32,
}

/// In-memory scheduler with a per-submission failure plan.
#[derive(Debug, Default)]
pub struct FakeScheduler {
    failures: BTreeMap<usize, BTreeSet<usize>>,
    queue_polls: u32,
    state: RefCell<FakeState>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self {
            queue_polls: 1,
            ..Self::default()
        }
    }

    /// Fail `indices` in the `submission`-th submission (0-based).
    pub fn fail_on_submission(
        mut self,
        submission: usize,
        indices: impl IntoIterator<Item = usize>,
    ) -> Self {
        self.failures.entry(submission).or_default().extend(indices);
        self
    }

    /// The first `count` accounting queries list no tasks at all.
    pub fn stale_accounting(self, count: u32) -> Self {
        self.state.borrow_mut().stale_left = count;
        self
    }

    /// Queue polls that still report a submitted job as running.
    pub fn queue_polls(mut self, polls: u32) -> Self {
        self.queue_polls = polls;
        self
    }

    pub fn submissions(&self) -> usize {
        self.state.borrow().scripts.len()
    }

    /// Contents of every submitted script, in submission order.
    pub fn submitted_scripts(&self) -> Vec<String> {
        self.state.borrow().scripts.clone()
    }
}

impl Scheduler for FakeScheduler {
    fn submit(&self, script: &Path) -> Result<String> {
        let text =
            fs::read_to_string(script).with_context(|| format!("read {}", script.display()))?;
        let indices = descriptor::array_indices(&text).context("script has no array directive")?;
        let dir = job_dir_of(script);
        let manifest = dir.load_manifest()?;

        let mut state = self.state.borrow_mut();
        let submission = state.scripts.len();
        let failed = self.failures.get(&submission).cloned().unwrap_or_default();
        for &index in &indices {
            let entry = manifest
                .entries
                .get(index)
                .with_context(|| format!("index {index} not in manifest"))?;
            if failed.contains(&index) {
                // Dispatch branches drop the previous output before running.
                dir.remove_outputs([index].iter())?;
                fs::write(dir.root().join(error_file_name(index)), "simulated failure\n")?;
            } else {
                fs::write(dir.output_path(index), simulated_output(&entry.item))?;
            }
        }

        let id = (1000 + submission).to_string();
        state.scripts.push(text);
        state.jobs.push(FakeJob {
            id: id.clone(),
            indices,
            failed,
            queue_polls_left: self.queue_polls,
        });
        Ok(format!("Submitted batch job {id}\n"))
    }

    fn queue_status(&self) -> Result<String> {
        let mut state = self.state.borrow_mut();
        let mut out = format!("{QUEUE_HEADER}\n");
        for job in &mut state.jobs {
            if job.queue_polls_left == 0 {
                continue;
            }
            job.queue_polls_left -= 1;
            for index in &job.indices {
                let _ = writeln!(out, "{}_{index} day orchestr user R 0:01 1 node01", job.id);
            }
        }
        Ok(out)
    }

    fn accounting(&self, job_id: &str) -> Result<String> {
        let mut state = self.state.borrow_mut();
        let mut out = format!("{ACCOUNTING_HEADER}\n");
        if state.stale_left > 0 {
            state.stale_left -= 1;
            return Ok(out);
        }
        let Some(job) = state.jobs.iter().find(|job| job.id == job_id) else {
            return Ok(out);
        };
        for index in &job.indices {
            let (status, code) = if job.failed.contains(index) {
                ("FAILED", "91:0")
            } else {
                ("COMPLETED", "0:0")
            };
            let _ = writeln!(out, "{}_{index} orchestr day lab 1 {status} {code}", job.id);
            let _ = writeln!(out, "{}_{index}.batch batch lab 1 {status} {code}", job.id);
        }
        Ok(out)
    }
}

/// Clock that advances only when slept on.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    elapsed: Cell<Duration>,
    sleeps: Cell<usize>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Cell::new(Duration::ZERO),
            sleeps: Cell::new(0),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }

    pub fn sleeps(&self) -> usize {
        self.sleeps.get()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed.get()
    }

    fn sleep(&self, duration: Duration) {
        self.elapsed.set(self.elapsed.get() + duration);
        self.sleeps.set(self.sleeps.get() + 1);
    }
}

/// Answers confirmations from a queue, then with `fallback`; records every request.
#[derive(Debug)]
pub struct ScriptedConfirm {
    answers: RefCell<VecDeque<bool>>,
    fallback: bool,
    requests: RefCell<Vec<ConfirmRequest>>,
}

impl ScriptedConfirm {
    pub fn new(answers: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        Self {
            answers: RefCell::new(answers.into_iter().collect()),
            fallback,
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ConfirmRequest> {
        self.requests.borrow().clone()
    }

    /// Actions asked so far, in order.
    pub fn actions(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .map(|request| request.action.clone())
            .collect()
    }
}

impl Confirm for ScriptedConfirm {
    fn confirm(&self, request: &ConfirmRequest) -> Result<bool> {
        self.requests.borrow_mut().push(request.clone());
        Ok(self.answers.borrow_mut().pop_front().unwrap_or(self.fallback))
    }
}

/// `echo <arg>` work items.
pub fn echo_items(args: &[&str]) -> Vec<WorkItem> {
    args.iter().map(|arg| WorkItem::new(["echo", *arg])).collect()
}

/// Job directory under `root` holding the descriptor and manifest of an
/// `echo <arg>` array, as a cluster round leaves it before submission.
pub fn write_demo_job_dir(root: &Path, args: &[&str]) -> JobDir {
    let dir = JobDir::new(root.join("jobs"));
    fs::create_dir_all(dir.root()).expect("create job dir");
    let array = JobArray::new(echo_items(args), &Normalizer::default()).expect("array");
    let desc =
        descriptor::build(&array, &ResourceConfig::default(), dir.root()).expect("descriptor");
    dir.write_descriptor(&desc, &array).expect("write descriptor");
    dir
}

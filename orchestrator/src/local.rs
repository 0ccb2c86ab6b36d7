//! Synchronous execution on this machine.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::collect::{CommandRunner, RunOutput};
use crate::core::work_item::WorkItem;
use crate::io::process::run_command_with_timeout;

/// Runs each work item as a child process and returns its stdout.
///
/// A non-zero exit is reported through `exit_code`, not as an error; the
/// routine decides what a failed item means.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    timeout: Duration,
    output_limit_bytes: usize,
}

impl LocalRunner {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            timeout,
            output_limit_bytes,
        }
    }
}

impl CommandRunner for LocalRunner {
    #[instrument(skip_all, fields(command = %item))]
    fn run(&mut self, item: &WorkItem) -> Result<RunOutput> {
        let (program, args) = item
            .tokens()
            .split_first()
            .context("work item has no program")?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run {item}"))?;
        if !output.success() {
            debug!(summary = %output.failure_summary(), "work item failed");
        }
        let exit_code = if output.timed_out {
            -1
        } else {
            output.status.code().unwrap_or(-1)
        };
        Ok(RunOutput {
            stdout: output.stdout_text(),
            exit_code,
        })
    }
}

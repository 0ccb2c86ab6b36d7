//! Result feeding.
//!
//! After a cluster round the experiment routine is run a second time. This
//! pass answers each work item from the harvested outputs, checking that the
//! routine emits exactly the sequence it emitted while collecting.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::debug;

use crate::collect::{CommandRunner, RunOutput};
use crate::core::job_array::JobArray;
use crate::core::work_item::{Normalizer, WorkItem};
use crate::error::OrchestrateError;

/// Answers work items in order from recorded outputs.
pub struct ReplayRunner<'a> {
    array: &'a JobArray,
    normalizer: &'a Normalizer,
    outputs: &'a BTreeMap<usize, String>,
    failure_exit_code: i32,
    position: usize,
}

impl<'a> ReplayRunner<'a> {
    pub fn new(
        array: &'a JobArray,
        normalizer: &'a Normalizer,
        outputs: &'a BTreeMap<usize, String>,
        failure_exit_code: i32,
    ) -> Self {
        Self {
            array,
            normalizer,
            outputs,
            failure_exit_code,
            position: 0,
        }
    }

    /// Error unless every recorded item was replayed.
    pub fn finish(&self) -> Result<(), OrchestrateError> {
        match self.array.get(self.position) {
            Some(entry) => Err(OrchestrateError::ReplayMismatch {
                position: self.position,
                expected: Some(entry.normalized.clone()),
                found: None,
            }),
            None => Ok(()),
        }
    }
}

impl CommandRunner for ReplayRunner<'_> {
    fn run(&mut self, item: &WorkItem) -> Result<RunOutput> {
        let position = self.position;
        let found = self.normalizer.normalize(item);
        let Some(entry) = self.array.get(position) else {
            return Err(OrchestrateError::ReplayMismatch {
                position,
                expected: None,
                found: Some(found),
            }
            .into());
        };
        if entry.normalized != found {
            return Err(OrchestrateError::ReplayMismatch {
                position,
                expected: Some(entry.normalized.clone()),
                found: Some(found),
            }
            .into());
        }
        self.position += 1;
        Ok(match self.outputs.get(&position) {
            Some(stdout) => RunOutput::success(stdout.clone()),
            None => {
                debug!(index = position, "replaying failed task");
                RunOutput::failed(self.failure_exit_code)
            }
        })
    }
}

/// Run `routine` against `outputs` and return its value.
///
/// Indices absent from `outputs` replay as an empty stdout with exit code
/// `failure_exit_code`.
pub fn feed<T, F>(
    routine: &mut F,
    array: &JobArray,
    normalizer: &Normalizer,
    outputs: &BTreeMap<usize, String>,
    failure_exit_code: i32,
) -> Result<T>
where
    F: FnMut(&mut dyn CommandRunner) -> Result<T>,
{
    let mut runner = ReplayRunner::new(array, normalizer, outputs, failure_exit_code);
    let value = routine(&mut runner)?;
    runner.finish()?;
    Ok(value)
}

//! Command collection.
//!
//! An experiment routine is written once against [`CommandRunner`]. Running it
//! with a [`CollectingRunner`] records every work item instead of executing
//! it, which yields the job array for a cluster round.

use anyhow::Result;
use tracing::debug;

use crate::core::job_array::JobArray;
use crate::core::work_item::{Normalizer, WorkItem};

/// Captured result of one work item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunOutput {
    pub stdout: String,
    pub exit_code: i32,
}

impl RunOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32) -> Self {
        Self {
            stdout: String::new(),
            exit_code,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The only way an experiment routine executes a work item.
pub trait CommandRunner {
    fn run(&mut self, item: &WorkItem) -> Result<RunOutput>;
}

/// Records items and answers with an empty success.
///
/// Routines see placeholder output while collecting, so they must not branch
/// on it in ways that change which items they emit.
#[derive(Debug, Default)]
pub struct CollectingRunner {
    items: Vec<WorkItem>,
}

impl CollectingRunner {
    pub fn into_items(self) -> Vec<WorkItem> {
        self.items
    }
}

impl CommandRunner for CollectingRunner {
    fn run(&mut self, item: &WorkItem) -> Result<RunOutput> {
        self.items.push(item.clone());
        Ok(RunOutput::default())
    }
}

/// Run `routine` in collection mode and build its job array.
///
/// The routine's own return value is discarded.
pub fn collect<T, F>(routine: &mut F, normalizer: &Normalizer) -> Result<JobArray>
where
    F: FnMut(&mut dyn CommandRunner) -> Result<T>,
{
    let mut runner = CollectingRunner::default();
    routine(&mut runner)?;
    let items = runner.into_items();
    debug!(items = items.len(), "collected work items");
    Ok(JobArray::new(items, normalizer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrateError;

    fn echo(arg: &str) -> WorkItem {
        WorkItem::new(["echo", arg])
    }

    #[test]
    fn collects_in_emission_order() {
        let mut routine = |runner: &mut dyn CommandRunner| -> Result<Vec<RunOutput>> {
            let mut seen = Vec::new();
            for arg in ["a", "b", "c"] {
                seen.push(runner.run(&echo(arg))?);
            }
            Ok(seen)
        };
        let array = collect(&mut routine, &Normalizer::default()).expect("collect");
        let invocations: Vec<_> = array.entries().iter().map(|e| e.invocation.as_str()).collect();
        assert_eq!(invocations, vec!["echo a", "echo b", "echo c"]);
    }

    #[test]
    fn placeholder_output_is_empty_success() {
        let mut runner = CollectingRunner::default();
        let out = runner.run(&echo("x")).expect("run");
        assert!(out.is_success());
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn duplicate_items_are_rejected() {
        let mut routine = |runner: &mut dyn CommandRunner| -> Result<()> {
            runner.run(&echo("a"))?;
            runner.run(&echo("b"))?;
            runner.run(&echo("a"))?;
            Ok(())
        };
        let err = collect(&mut routine, &Normalizer::default()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<OrchestrateError>(),
            Some(&OrchestrateError::DuplicateWorkItem {
                first: 0,
                second: 2,
                command: "echo a".to_string(),
            })
        );
    }

    #[test]
    fn routine_errors_propagate() {
        let mut routine =
            |_: &mut dyn CommandRunner| -> Result<()> { Err(anyhow::anyhow!("bad parameters")) };
        let err = collect(&mut routine, &Normalizer::default()).unwrap_err();
        assert!(err.to_string().contains("bad parameters"));
    }
}

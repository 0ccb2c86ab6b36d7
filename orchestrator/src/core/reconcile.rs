//! Retry planning from terminal task states.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use super::status::TerminalState;

/// Indices that must be resubmitted.
pub type RetryPlan = BTreeSet<usize>;

/// Every index whose terminal state is not `Completed`.
pub fn reconcile(states: &BTreeMap<usize, TerminalState>) -> RetryPlan {
    states
        .iter()
        .filter(|(_, state)| **state != TerminalState::Completed)
        .map(|(index, _)| *index)
        .collect()
}

/// One line per index of `plan`: `[i] State: invocation`.
pub fn failure_report<'a>(
    states: &BTreeMap<usize, TerminalState>,
    plan: &RetryPlan,
    invocation: impl Fn(usize) -> Option<&'a str>,
) -> String {
    let mut out = String::new();
    for &index in plan {
        let state = states.get(&index).copied().unwrap_or(TerminalState::Missing);
        let _ = match invocation(index) {
            Some(command) => writeln!(out, "[{index}] {state:?}: {command}"),
            None => writeln!(out, "[{index}] {state:?}"),
        };
    }
    out
}

/// Comma-separated index list, the format of `--array=` and of rerun scripts.
pub fn format_indices<'a>(indices: impl IntoIterator<Item = &'a usize>) -> String {
    indices
        .into_iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a comma-separated index list; order and duplicates are normalized away.
pub fn parse_indices(text: &str) -> Result<RetryPlan, String> {
    text.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<usize>()
                .map_err(|_| format!("invalid index '{part}'"))
        })
        .collect()
}

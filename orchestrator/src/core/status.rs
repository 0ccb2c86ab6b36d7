//! Parsers for scheduler command output.
//!
//! Queue and accounting listings are reduced to typed [`StatusLine`] records so
//! the matching rules can be tested without spawning anything.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Final classification of one array index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalState {
    Completed,
    Failed,
    /// The scheduler never reported the index, or it left no output.
    Missing,
}

/// State tokens recognised in listing lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub completed: String,
    /// States of tasks that have not finished yet.
    pub active: Vec<String>,
}

impl Markers {
    pub fn new(completed: impl Into<String>, active: Vec<String>) -> Self {
        Self {
            completed: completed.into(),
            active,
        }
    }
}

impl Default for Markers {
    fn default() -> Self {
        Self::new("COMPLETED", default_active_markers())
    }
}

/// Slurm job states that are not terminal.
pub fn default_active_markers() -> Vec<String> {
    [
        "PENDING",
        "RUNNING",
        "CONFIGURING",
        "COMPLETING",
        "REQUEUED",
        "RESIZING",
        "SUSPENDED",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// One listing line whose first token has the `{job}_{index}` shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub job_id: String,
    pub index: usize,
    pub completed: bool,
    pub active: bool,
    pub raw: String,
}

/// Extract the job id from an acknowledgement like `Submitted batch job 4242`.
///
/// The id is the last whitespace-delimited token of the last non-empty line.
pub fn parse_job_id(ack: &str) -> Option<String> {
    let line = ack.lines().rev().find(|line| !line.trim().is_empty())?;
    let token = line.split_whitespace().last()?;
    // `sbatch --parsable` prints `id;cluster`.
    let id = token.split(';').next().unwrap_or(token);
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(id.to_string())
}

/// Parse a single listing line. Header lines and job steps
/// (`4242_3.batch`) yield `None`.
pub fn parse_status_line(line: &str, markers: &Markers) -> Option<StatusLine> {
    let mut tokens = line.split_whitespace();
    let subject = tokens.next()?;
    let (job_id, index) = subject.split_once('_')?;
    let index: usize = index.parse().ok()?;
    if job_id.is_empty() {
        return None;
    }
    let mut completed = false;
    let mut active = false;
    for token in tokens {
        completed |= token == markers.completed;
        active |= markers.active.iter().any(|marker| marker == token);
    }
    Some(StatusLine {
        job_id: job_id.to_string(),
        index,
        completed,
        active,
        raw: line.trim_end().to_string(),
    })
}

/// Lines of `listing` that belong to `job_id` and one of `indices`.
pub fn matching_lines(
    listing: &str,
    job_id: &str,
    indices: &BTreeSet<usize>,
    markers: &Markers,
) -> BTreeMap<usize, StatusLine> {
    let mut out = BTreeMap::new();
    for line in listing.lines() {
        let Some(parsed) = parse_status_line(line, markers) else {
            continue;
        };
        if parsed.job_id == job_id && indices.contains(&parsed.index) {
            out.insert(parsed.index, parsed);
        }
    }
    out
}

/// Snapshot text: the listing's header line followed by the matched lines.
pub fn snapshot(listing: &str, matched: &BTreeMap<usize, StatusLine>) -> String {
    let mut out = String::new();
    if let Some(header) = listing.lines().find(|line| !line.trim().is_empty()) {
        out.push_str(header.trim_end());
        out.push('\n');
    }
    for line in matched.values() {
        out.push_str(&line.raw);
        out.push('\n');
    }
    out
}

/// Terminal states from an accounting listing.
///
/// Returns the states of finished indices plus the set of requested indices
/// the listing did not mention or still reports as active.
pub fn classify(
    matched: &BTreeMap<usize, StatusLine>,
    indices: &BTreeSet<usize>,
) -> (BTreeMap<usize, TerminalState>, BTreeSet<usize>) {
    let mut states = BTreeMap::new();
    let mut unlisted = BTreeSet::new();
    for &index in indices {
        match matched.get(&index) {
            Some(line) if line.active => {
                unlisted.insert(index);
            }
            Some(line) if line.completed => {
                states.insert(index, TerminalState::Completed);
            }
            Some(_) => {
                states.insert(index, TerminalState::Failed);
            }
            None => {
                unlisted.insert(index);
            }
        }
    }
    (states, unlisted)
}

//! Dense, duplicate-free job arrays.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::work_item::{Normalizer, WorkItem};
use crate::error::OrchestrateError;

/// One array slot: the item plus its two canonical strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEntry {
    pub index: usize,
    pub invocation: String,
    pub normalized: String,
    pub item: WorkItem,
}

/// Work items of one collection pass, indexed `0..N-1`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobArray {
    entries: Vec<JobEntry>,
}

impl JobArray {
    /// Build the array, refusing empty items and two items with identical
    /// normalized text.
    pub fn new(items: Vec<WorkItem>, normalizer: &Normalizer) -> Result<Self, OrchestrateError> {
        let mut seen: HashMap<String, usize> = HashMap::with_capacity(items.len());
        let mut entries = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            if item.tokens().is_empty() {
                return Err(OrchestrateError::EmptyWorkItem { index });
            }
            let normalized = normalizer.normalize(&item);
            if let Some(&first) = seen.get(&normalized) {
                return Err(OrchestrateError::DuplicateWorkItem {
                    first,
                    second: index,
                    command: normalized,
                });
            }
            seen.insert(normalized.clone(), index);
            entries.push(JobEntry {
                index,
                invocation: item.invocation(),
                normalized,
                item,
            });
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&JobEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[JobEntry] {
        &self.entries
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().map(|entry| entry.index)
    }
}

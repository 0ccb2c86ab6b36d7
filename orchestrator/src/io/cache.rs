//! Aggregated result cache (`_aggregated.json`).
//!
//! Maps normalized command text to captured stdout across rounds. One file
//! per job directory keeps the artifact count bounded no matter how many
//! array tasks ran. Entries are written sorted by command so the file is
//! stable under any insertion order and diffs cleanly.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::fs_util::write_atomic;
use super::job_dir::JobDir;
use crate::core::job_array::JobArray;
use crate::error::OrchestrateError;

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub command: String,
    pub output: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// What [`ResultCache::insert`] did with a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The identical pair was already cached.
    Unchanged,
    /// A different, non-shorter output was offered; the cached one was kept.
    KeptExisting,
}

/// Split of a job array into cached and uncached indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheLookup {
    pub hits: BTreeMap<usize, String>,
    pub misses: BTreeSet<usize>,
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl ResultCache {
    /// Load the cache at `path`; a missing file is an empty cache.
    pub fn load(path: &Path) -> Result<Self> {
        let mut cache = Self {
            path: path.to_path_buf(),
            entries: BTreeMap::new(),
        };
        if !path.exists() {
            return Ok(cache);
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read cache {}", path.display()))?;
        cache.entries =
            parse(&contents).with_context(|| format!("parse cache {}", path.display()))?;
        debug!(path = %path.display(), entries = cache.entries.len(), "loaded cache");
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, command: &str) -> Option<&str> {
        self.entries.get(command).map(String::as_str)
    }

    /// Entries in their persisted order.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.entries
            .iter()
            .map(|(command, output)| CacheEntry {
                command: command.clone(),
                output: output.clone(),
            })
            .collect()
    }

    /// Add one pair. Replacing a non-empty output with an empty output or a
    /// strict prefix of it is a [`OrchestrateError::CacheWriteConflict`].
    pub fn insert(&mut self, command: &str, output: &str) -> Result<InsertOutcome, OrchestrateError> {
        let Some(existing) = self.entries.get(command) else {
            self.entries.insert(command.to_string(), output.to_string());
            return Ok(InsertOutcome::Inserted);
        };
        if existing == output {
            return Ok(InsertOutcome::Unchanged);
        }
        if existing.is_empty() {
            self.entries.insert(command.to_string(), output.to_string());
            return Ok(InsertOutcome::Inserted);
        }
        if existing.starts_with(output) {
            return Err(OrchestrateError::CacheWriteConflict {
                command: command.to_string(),
                existing_len: existing.len(),
                new_len: output.len(),
            });
        }
        warn!(command, "cached output differs from new output; keeping cached");
        Ok(InsertOutcome::KeptExisting)
    }

    /// Cached outputs for `array`.
    ///
    /// When `raw` is given, per-index output files in that job directory are
    /// consulted for indices the aggregated record lacks. Callers must only
    /// pass a directory generated from the same descriptor.
    pub fn lookup(&self, array: &JobArray, raw: Option<&JobDir>) -> Result<CacheLookup> {
        let mut lookup = CacheLookup::default();
        for entry in array.entries() {
            if let Some(output) = self.get(&entry.normalized) {
                lookup.hits.insert(entry.index, output.to_string());
                continue;
            }
            if let Some(dir) = raw
                && let Some(output) = dir.read_output(entry.index)?
            {
                lookup.hits.insert(entry.index, output);
                continue;
            }
            lookup.misses.insert(entry.index);
        }
        debug!(
            hits = lookup.hits.len(),
            misses = lookup.misses.len(),
            "cache lookup"
        );
        Ok(lookup)
    }

    /// Merge `outputs` (by array index) and rewrite the file.
    ///
    /// All pairs are checked before anything is written, so a conflict leaves
    /// both the in-memory and on-disk record untouched.
    pub fn persist(&mut self, array: &JobArray, outputs: &BTreeMap<usize, String>) -> Result<usize> {
        let mut staged = self.clone();
        let mut inserted = 0usize;
        for (index, output) in outputs {
            let entry = array
                .get(*index)
                .with_context(|| format!("output for index {index} outside the job array"))?;
            if staged.insert(&entry.normalized, output)? == InsertOutcome::Inserted {
                inserted += 1;
            }
        }
        if inserted == 0 && self.path.exists() {
            return Ok(0);
        }
        staged.save()?;
        *self = staged;
        info!(path = %self.path.display(), inserted, total = self.len(), "persisted cache");
        Ok(inserted)
    }

    pub fn save(&self) -> Result<()> {
        write_atomic(&self.path, &self.to_json()?)
    }

    pub fn to_json(&self) -> Result<String> {
        let file = CacheFile {
            version: CACHE_VERSION,
            entries: self.entries(),
        };
        let mut buf = serde_json::to_string_pretty(&file).context("serialize cache")?;
        buf.push('\n');
        Ok(buf)
    }
}

fn parse(contents: &str) -> Result<BTreeMap<String, String>> {
    let file: CacheFile = serde_json::from_str(contents)?;
    if file.version != CACHE_VERSION {
        bail!("unsupported cache version {}", file.version);
    }
    let mut entries = BTreeMap::new();
    for entry in file.entries {
        if entries.contains_key(&entry.command) {
            bail!("duplicate cache entry for {}", entry.command);
        }
        entries.insert(entry.command, entry.output);
    }
    Ok(entries)
}

/// Fold every successful per-index output of a finished job directory into
/// its aggregated cache. Returns the number of new entries.
pub fn absorb_job_dir(dir: &JobDir) -> Result<usize> {
    let manifest = dir.load_manifest()?;
    let mut cache = ResultCache::load(&dir.cache_path())?;
    let mut inserted = 0usize;
    for entry in &manifest.entries {
        let Some(output) = dir.read_output(entry.index)? else {
            continue;
        };
        if cache.insert(&entry.normalized, &output)? == InsertOutcome::Inserted {
            inserted += 1;
        }
    }
    if inserted > 0 {
        cache.save()?;
    }
    info!(job_dir = %dir.root().display(), inserted, "absorbed job outputs");
    Ok(inserted)
}

// ABOUTME: Append-only per-entity changelog persisted as one JSON document (entity id -> entries).
// ABOUTME: Appends are serialized by a mutex; failed persists are retried with every unpersisted entry.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rollbook_core::{ChangeLogEntry, Operation};

use crate::atomic::{AtomicWriter, quarantine};
use crate::error::{Result, StoreError};

type Entries = BTreeMap<String, Vec<ChangeLogEntry>>;

struct LogState {
    entries: Entries,
    /// Set when memory holds entries the file does not.
    dirty: bool,
}

/// The changelog for every entity in a data directory.
pub struct ChangeLog {
    path: PathBuf,
    writer: AtomicWriter,
    state: Mutex<LogState>,
}

impl ChangeLog {
    /// Open (or start) the changelog at `path`. A file that does not parse is
    /// quarantined next to itself and an empty log is started, so history is
    /// never silently overwritten.
    pub fn open(path: &Path, writer: AtomicWriter) -> Result<Self> {
        let entries = if path.exists() {
            let bytes = fs::read(path)?;
            match serde_json::from_slice::<Entries>(&bytes) {
                Ok(entries) => {
                    let total: usize = entries.values().map(Vec::len).sum();
                    tracing::info!(
                        "loaded changelog with {} entries for {} entities",
                        total,
                        entries.len()
                    );
                    entries
                }
                Err(e) => {
                    tracing::error!("changelog {} is unreadable: {}", path.display(), e);
                    quarantine(path)?;
                    Entries::new()
                }
            }
        } else {
            Entries::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            state: Mutex::new(LogState {
                entries,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry and persist the whole document.
    ///
    /// The entry's timestamp is raised to the entity's latest timestamp if the
    /// clock went backwards, keeping history non-decreasing. If persisting
    /// fails the entry stays in memory and `AppendFailed` is returned; the next
    /// successful append or [`flush`](Self::flush) writes it along with
    /// everything else still pending.
    pub fn append(&self, mut entry: ChangeLogEntry) -> Result<()> {
        let mut state = self.lock();

        let history = state.entries.entry(entry.entity_id.clone()).or_default();
        if let Some(last) = history.last()
            && entry.timestamp < last.timestamp
        {
            entry.timestamp = last.timestamp;
        }
        tracing::debug!(
            "changelog append: {} {} ({} diffs)",
            entry.operation,
            entry.entity_id,
            entry.diffs.len()
        );
        history.push(entry);
        state.dirty = true;

        self.persist(&mut state)
            .map_err(|e| StoreError::AppendFailed { source: Box::new(e) })
    }

    /// Persist pending entries, if any. Returns whether a write happened.
    pub fn flush(&self) -> Result<bool> {
        let mut state = self.lock();
        if !state.dirty {
            return Ok(false);
        }
        self.persist(&mut state)
            .map_err(|e| StoreError::AppendFailed { source: Box::new(e) })?;
        Ok(true)
    }

    /// Whether memory holds entries that are not yet on disk.
    pub fn has_unpersisted(&self) -> bool {
        self.lock().dirty
    }

    /// Entries for `entity_id` in insertion order, optionally filtered by
    /// operation, keeping only the most recent `limit`.
    pub fn history(
        &self,
        entity_id: &str,
        operation: Option<Operation>,
        limit: Option<usize>,
    ) -> Vec<ChangeLogEntry> {
        self.indexed_history(entity_id, operation, limit)
            .into_iter()
            .map(|(_, entry)| entry)
            .collect()
    }

    /// Like [`history`](Self::history), paired with each entry's position in
    /// the unfiltered history (the index a restore takes).
    pub fn indexed_history(
        &self,
        entity_id: &str,
        operation: Option<Operation>,
        limit: Option<usize>,
    ) -> Vec<(usize, ChangeLogEntry)> {
        let state = self.lock();
        let Some(entries) = state.entries.get(entity_id) else {
            return Vec::new();
        };

        let matching: Vec<(usize, &ChangeLogEntry)> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| operation.is_none_or(|op| e.operation == op))
            .collect();
        let skip = match limit {
            Some(n) => matching.len().saturating_sub(n),
            None => 0,
        };
        matching
            .into_iter()
            .skip(skip)
            .map(|(i, e)| (i, e.clone()))
            .collect()
    }

    /// The entry at `index` (0 is the oldest) for `entity_id`.
    pub fn entry(&self, entity_id: &str, index: usize) -> Option<ChangeLogEntry> {
        self.lock()
            .entries
            .get(entity_id)
            .and_then(|entries| entries.get(index))
            .cloned()
    }

    pub fn len(&self, entity_id: &str) -> usize {
        self.lock().entries.get(entity_id).map_or(0, Vec::len)
    }

    pub fn total_entries(&self) -> usize {
        self.lock().entries.values().map(Vec::len).sum()
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    fn persist(&self, state: &mut LogState) -> Result<()> {
        self.writer.write_json(&self.path, &state.entries)?;
        state.dirty = false;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

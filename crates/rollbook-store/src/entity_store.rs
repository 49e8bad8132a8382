// ABOUTME: Load/save orchestration for entity files: diff against the previous snapshot, write atomically, log.
// ABOUTME: Saves on the same entity id are serialized by a per-entity lock; different ids run in parallel.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use rollbook_core::codec::{self, SkipReport, canonical_bytes, decode_slice, looks_like_entity};
use rollbook_core::diff::compute_from;
use rollbook_core::{ChangeLogEntry, DiffEntry, Entity, Operation};

use crate::atomic::{AtomicWriter, quarantine};
use crate::backup::BackupStore;
use crate::changelog::ChangeLog;
use crate::error::{Result, StoreError};

pub const CHANGELOG_FILE: &str = "changelog.json";
pub const BACKUP_DIR: &str = "backups";

/// An entity read from disk, with the count of sub-records that were dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub entity: Entity,
    pub skipped: SkipReport,
}

impl Loaded {
    /// True when some grades, notes, or insights could not be read.
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_clean()
    }
}

/// What a save did beyond writing the entity file.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    pub diffs: Vec<DiffEntry>,
    pub created: bool,
    /// False when the changelog could not be written; the entry is retried later.
    pub changelog_persisted: bool,
    pub backup_id: Option<String>,
}

/// One-file-per-entity store rooted at a data directory.
pub struct EntityStore {
    data_dir: PathBuf,
    writer: AtomicWriter,
    changelog: Arc<ChangeLog>,
    auto_backup: Option<Arc<BackupStore>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EntityStore {
    pub fn new(data_dir: &Path, writer: AtomicWriter, changelog: Arc<ChangeLog>) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            writer,
            changelog,
            auto_backup: None,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Back up every saved snapshot into `backups`.
    pub fn with_auto_backup(mut self, backups: Arc<BackupStore>) -> Self {
        self.auto_backup = Some(backups);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn changelog(&self) -> &Arc<ChangeLog> {
        &self.changelog
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", id))
    }

    /// Read the entity stored under `id`. `Ok(None)` means there is no such
    /// entity; a file that is not an entity at all is `Corrupt`. Malformed
    /// grades, notes, or insights are dropped and counted in `skipped`.
    pub fn load(&self, id: &str) -> Result<Option<Loaded>> {
        rollbook_core::model::validate_id(id)?;
        let path = self.path_for(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let decoded = decode_slice(&bytes, Some(id)).map_err(|e| StoreError::codec(&path, e))?;
        if decoded.entity.id != id {
            tracing::warn!(
                "{} declares id {:?}; keeping the file's id",
                path.display(),
                decoded.entity.id
            );
        }
        if !decoded.skipped.is_clean() {
            tracing::warn!(
                "skipped {} malformed sub-records loading {} (grades: {}, notes: {}, insights: {})",
                decoded.skipped.total(),
                id,
                decoded.skipped.grades,
                decoded.skipped.behavior_notes,
                decoded.skipped.insights
            );
        }

        let mut entity = decoded.entity;
        entity.id = id.to_string();
        Ok(Some(Loaded {
            entity,
            skipped: decoded.skipped,
        }))
    }

    /// Persist `entity`, recording what changed since the stored version.
    ///
    /// Stamps `last_updated`, diffs against the current file, writes the new
    /// file atomically, and appends a changelog entry when the diff is
    /// non-empty. A failed entity write fails the save and leaves the old file
    /// in place. A failed changelog append does not: it is logged, reported in
    /// the outcome, and retried on the next save.
    pub fn save(&self, entity: &mut Entity) -> Result<SaveOutcome> {
        entity.validate()?;
        let lock = self.entity_lock(&entity.id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        entity.last_updated = Some(Utc::now());

        let previous = self.current_or_none(&entity.id);
        let created = previous.is_none();
        let diffs = compute_from(previous.as_ref(), entity);

        let bytes = canonical_bytes(entity)
            .map_err(|e| StoreError::codec(self.path_for(&entity.id), e))?;
        self.writer.write(&self.path_for(&entity.id), &bytes)?;

        let changelog_persisted = if diffs.is_empty() {
            self.retry_pending_changelog()
        } else {
            let entry = ChangeLogEntry::record(
                previous,
                entity.clone(),
                diffs.clone(),
                codec::content_hash(&bytes),
            );
            self.append_logged(entry)
        };

        let backup_id = self.auto_backup.as_ref().and_then(|backups| {
            match backups.create(&entity.id, entity, Some("automatic backup after save")) {
                Ok(record) => Some(record.backup_id),
                Err(e) => {
                    tracing::warn!("automatic backup of {} failed: {}", entity.id, e);
                    None
                }
            }
        });

        tracing::info!("saved {} ({} changes)", entity.id, diffs.len());
        Ok(SaveOutcome {
            diffs,
            created,
            changelog_persisted,
            backup_id,
        })
    }

    /// Replace the stored entity with `target` as an auditable event: the
    /// changelog entry (with the current state as its previous snapshot) is
    /// appended first, then the file is written. Returns whether the entry
    /// reached disk; when it did not, it stays pending like a save's.
    pub(crate) fn replace(
        &self,
        target: &Entity,
        diffs: Vec<DiffEntry>,
        operation: Operation,
    ) -> Result<bool> {
        target.validate()?;
        let lock = self.entity_lock(&target.id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.current_or_none(&target.id);

        let bytes = canonical_bytes(target)
            .map_err(|e| StoreError::codec(self.path_for(&target.id), e))?;
        let mut entry = ChangeLogEntry::record(
            current.clone(),
            target.clone(),
            diffs,
            codec::content_hash(&bytes),
        );
        entry.operation = operation;
        let changelog_persisted = self.append_logged(entry);

        self.writer.write(&self.path_for(&target.id), &bytes)?;
        Ok(changelog_persisted)
    }

    /// Write `target` as the current file without touching the changelog.
    pub(crate) fn overwrite(&self, target: &Entity) -> Result<Option<Entity>> {
        target.validate()?;
        let lock = self.entity_lock(&target.id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.current_or_none(&target.id);
        let bytes = canonical_bytes(target)
            .map_err(|e| StoreError::codec(self.path_for(&target.id), e))?;
        self.writer.write(&self.path_for(&target.id), &bytes)?;
        Ok(current)
    }

    /// Every readable entity in the data directory, ordered by file name.
    /// Store documents and files that do not look like entities are skipped.
    pub fn list(&self) -> Result<Vec<Entity>> {
        let mut entities = Vec::new();
        for (id, path) in self.entity_files()? {
            let Ok(bytes) = fs::read(&path) else {
                tracing::warn!("skipping unreadable file {}", path.display());
                continue;
            };
            let value: serde_json::Value = match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("skipping invalid json {}: {}", path.display(), e);
                    continue;
                }
            };
            if !looks_like_entity(&value) {
                tracing::debug!("skipping non-entity file {}", path.display());
                continue;
            }
            match codec::decode_value(value, Some(&id)) {
                Ok(decoded) => {
                    if !decoded.skipped.is_clean() {
                        tracing::warn!(
                            "skipped {} malformed sub-records listing {}",
                            decoded.skipped.total(),
                            id
                        );
                    }
                    let mut entity = decoded.entity;
                    entity.id = id;
                    entities.push(entity);
                }
                Err(e) => tracing::warn!("skipping {}: {}", path.display(), e),
            }
        }
        Ok(entities)
    }

    /// `(id, path)` for every candidate entity file, sorted by file name.
    pub fn entity_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == CHANGELOG_FILE {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json")
                && rollbook_core::model::validate_id(id).is_ok()
            {
                files.push((id.to_string(), path));
            }
        }
        files.sort_by(|a, b| a.1.file_name().cmp(&b.1.file_name()));
        Ok(files)
    }

    /// The stored entity, or `None` when there is none or it cannot be read.
    /// A file that is not an entity is moved aside before it gets replaced.
    fn current_or_none(&self, id: &str) -> Option<Entity> {
        match self.load(id) {
            Ok(found) => found.map(|l| l.entity),
            Err(e) if e.is_corrupt() => {
                tracing::warn!("replacing unreadable file for {}: {}", id, e);
                if let Err(e) = quarantine(&self.path_for(id)) {
                    tracing::error!("could not quarantine the file for {}: {}", id, e);
                }
                None
            }
            Err(e) => {
                tracing::warn!("current file for {} is unreadable: {}", id, e);
                None
            }
        }
    }

    fn append_logged(&self, entry: ChangeLogEntry) -> bool {
        let id = entry.entity_id.clone();
        match self.changelog.append(entry) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    "changelog append for {} failed; entry kept in memory and retried on next save: {}",
                    id,
                    e
                );
                false
            }
        }
    }

    fn retry_pending_changelog(&self) -> bool {
        match self.changelog.flush() {
            Ok(true) => {
                tracing::info!("persisted previously pending changelog entries");
                true
            }
            Ok(false) => true,
            Err(e) => {
                tracing::error!("changelog still cannot be persisted: {}", e);
                false
            }
        }
    }

    /// Locks nobody holds are dropped here, so the map tracks in-flight ids only.
    fn entity_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollbook_core::diff::Member;
    use rollbook_core::{BehaviorNote, Grade, Insight};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> EntityStore {
        let writer = AtomicWriter::new(false);
        let log = Arc::new(ChangeLog::open(&dir.path().join(CHANGELOG_FILE), writer).unwrap());
        EntityStore::new(dir.path(), writer, log).unwrap()
    }

    fn ali() -> Entity {
        let mut e = Entity::empty("s1");
        e.name = "Ali".to_string();
        e.class_name = "9A".to_string();
        e.set_grade(Grade::new("Math", 70.0, "2024-01-01"));
        e
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut e = ali();
        e.add_behavior_note(BehaviorNote::new("Helpful", "positive", "2024-01-02 10:00"));
        e.push_insight(Insight::new("Strong start", "llama3.2"));

        let outcome = store.save(&mut e).unwrap();
        assert!(outcome.created);
        assert!(outcome.changelog_persisted);
        assert!(e.last_updated.is_some());

        let loaded = store.load("s1").unwrap().expect("entity should exist");
        assert_eq!(loaded.entity, e);
        assert!(!loaded.is_partial());
    }

    #[test]
    fn load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(open(&dir).load("ghost").unwrap().is_none());
    }

    #[test]
    fn first_save_logs_added_grade() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.save(&mut ali()).unwrap();

        let history = store.changelog().history("s1", None, None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].operation, Operation::Create);
        assert!(history[0].prev_snapshot.is_none());
        assert!(history[0].diffs.contains(&DiffEntry::Added {
            member: Member::Grade(Grade::new("Math", 70.0, "2024-01-01")),
        }));
    }

    #[test]
    fn unchanged_save_adds_no_entry() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut e = ali();
        store.save(&mut e).unwrap();
        let outcome = store.save(&mut e).unwrap();

        assert!(outcome.diffs.is_empty());
        assert!(!outcome.created);
        assert_eq!(store.changelog().len("s1"), 1);
    }

    #[test]
    fn partial_corruption_is_counted_not_fatal() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        fs::write(
            store.path_for("s1"),
            br#"{"id": "s1", "name": "Ali", "grades": [{"subject": "Math", "score": 70}, {"subject": "Art"}]}"#,
        )
        .unwrap();

        let loaded = store.load("s1").unwrap().unwrap();

        assert!(loaded.is_partial());
        assert_eq!(loaded.skipped.grades, 1);
        assert_eq!(loaded.entity.grades.len(), 1);
    }

    #[test]
    fn unreadable_file_is_corrupt_and_save_replaces_it() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        fs::write(store.path_for("s1"), b"[1, 2, 3]").unwrap();

        assert!(store.load("s1").unwrap_err().is_corrupt());

        let outcome = store.save(&mut ali()).unwrap();
        assert!(outcome.created);
        assert_eq!(store.load("s1").unwrap().unwrap().entity.name, "Ali");

        let moved: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with("s1.json.corrupt-"))
            })
            .collect();
        assert_eq!(moved.len(), 1);
        assert_eq!(fs::read(&moved[0]).unwrap(), b"[1, 2, 3]");
    }

    #[test]
    fn invalid_entities_are_rejected_before_disk() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut e = ali();
        e.id = "../escape".to_string();

        assert!(matches!(store.save(&mut e), Err(StoreError::Invalid(_))));
        assert_eq!(store.changelog().total_entries(), 0);
    }

    #[test]
    fn write_failure_is_fatal_and_not_logged() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let path = store.path_for("s1");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("blocker"), b"x").unwrap();

        let err = store.save(&mut ali()).unwrap_err();

        assert!(matches!(err, StoreError::WriteFailed { .. }));
        assert_eq!(store.changelog().len("s1"), 0);
    }

    #[test]
    fn changelog_failure_does_not_fail_save_and_is_retried() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let log_path = dir.path().join(CHANGELOG_FILE);
        fs::create_dir(&log_path).unwrap();
        fs::write(log_path.join("blocker"), b"x").unwrap();

        let mut e = ali();
        let outcome = store.save(&mut e).unwrap();
        assert!(!outcome.changelog_persisted);
        assert_eq!(store.load("s1").unwrap().unwrap().entity, e);

        e.set_grade(Grade::new("Math", 85.0, "2024-01-01"));
        assert!(!store.save(&mut e).unwrap().changelog_persisted);

        fs::remove_dir_all(&log_path).unwrap();

        // An unchanged save still flushes what is pending.
        let outcome = store.save(&mut e).unwrap();
        assert!(outcome.diffs.is_empty());
        assert!(outcome.changelog_persisted);

        let reopened = ChangeLog::open(&log_path, AtomicWriter::new(false)).unwrap();
        assert_eq!(reopened.len("s1"), 2);
    }

    #[test]
    fn list_skips_store_documents_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let mut b = ali();
        b.id = "b".to_string();
        let mut a = ali();
        a.id = "a".to_string();
        store.save(&mut b).unwrap();
        store.save(&mut a).unwrap();
        fs::write(dir.path().join("notes.json"), b"{\"title\": \"not a student\"}").unwrap();
        fs::write(dir.path().join("broken.json"), b"{oops").unwrap();
        fs::write(dir.path().join("readme.txt"), b"hi").unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn concurrent_saves_leave_one_submitted_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open(&dir));
        let names: Vec<String> = (0..8).map(|i| format!("name-{}", i)).collect();

        std::thread::scope(|scope| {
            for name in &names {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    let mut e = ali();
                    e.name = name.clone();
                    store.save(&mut e).unwrap();
                });
            }
        });

        let loaded = store.load("s1").unwrap().unwrap();
        assert!(!loaded.is_partial());
        assert!(names.contains(&loaded.entity.name));

        // Each save diffed against the file the previous one left behind.
        let history = store.changelog().history("s1", None, None);
        assert_eq!(history.len(), 8);
        for pair in history.windows(2) {
            assert_eq!(pair[1].prev_snapshot.as_ref(), Some(&pair[0].new_snapshot));
        }
    }

    #[test]
    fn idle_entity_locks_are_released() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        for i in 0..50 {
            let mut e = ali();
            e.id = format!("s{}", i);
            store.save(&mut e).unwrap();
        }
        assert!(store.locks.lock().unwrap().len() <= 1);

        let held = store.entity_lock("s7");
        store.entity_lock("s8");
        let locks = store.locks.lock().unwrap();
        assert!(locks.contains_key("s7"));
        assert!(Arc::ptr_eq(&held, &locks["s7"]));
    }
}

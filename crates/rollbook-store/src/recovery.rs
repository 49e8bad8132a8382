// ABOUTME: Operator-triggered recovery: restore an entity to a changelog entry or a backup, and audit the store.
// ABOUTME: Changelog restores are logged as new entries; nothing here repairs data automatically.

use std::fs;
use std::sync::Arc;

use rollbook_core::codec::{decode_value, entity_hash, looks_like_entity};
use rollbook_core::{DiffEntry, Entity, Operation};
use serde::Serialize;

use crate::backup::BackupStore;
use crate::entity_store::EntityStore;
use crate::error::{Result, StoreError};

/// Outcome of hashing a snapshot and comparing it to an expected hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Integrity {
    pub ok: bool,
    pub hash: String,
    pub message: String,
}

/// Problems found by [`RecoveryManager::check_consistency`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub ok: bool,
    pub issues: Vec<String>,
}

/// The state a changelog restore wrote, and whether its entry reached disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Restored {
    pub entity: Entity,
    /// False when the restore entry is only held in memory until the next save.
    pub changelog_persisted: bool,
}

pub struct RecoveryManager {
    store: Arc<EntityStore>,
    backups: Arc<BackupStore>,
}

impl RecoveryManager {
    pub fn new(store: Arc<EntityStore>, backups: Arc<BackupStore>) -> Self {
        Self { store, backups }
    }

    /// Bring `entity_id` back to the state recorded by changelog entry `index`.
    ///
    /// The target is the entry's previous snapshot; for the creation entry,
    /// which has none, it is the first recorded state. A `restore` entry whose
    /// previous snapshot is the current state is appended before the file is
    /// overwritten, so the restore can itself be undone.
    pub fn restore_from_changelog(&self, entity_id: &str, index: usize) -> Result<Restored> {
        rollbook_core::model::validate_id(entity_id)?;
        let entry = self
            .store
            .changelog()
            .entry(entity_id, index)
            .ok_or_else(|| {
                StoreError::not_found("changelog entry", format!("{}#{}", entity_id, index))
            })?;

        let target = entry.restore_target().clone();
        let diffs = vec![DiffEntry::Restore {
            description: format!("restore to entry {}", index),
        }];
        let changelog_persisted = self.store.replace(&target, diffs, Operation::Restore)?;

        tracing::info!("restored {} to changelog entry {}", entity_id, index);
        Ok(Restored {
            entity: target,
            changelog_persisted,
        })
    }

    /// Replace the entity a backup was taken from with the backup's snapshot.
    ///
    /// The backup is hash-checked before anything is written, the current
    /// state is saved as a pre-recovery backup, and the written file is read
    /// back and verified. The changelog is left untouched.
    pub fn restore_from_backup(&self, backup_id: &str) -> Result<Entity> {
        let record = self.backups.get(backup_id)?;
        let mut snapshot = self.backups.restore(backup_id)?;

        let check = self.verify_integrity(&snapshot, Some(&record.content_hash));
        if !check.ok {
            return Err(StoreError::corrupt(
                self.backups.payload_path(&record),
                check.message,
            ));
        }
        snapshot.id = record.source_id.clone();

        match self.store.load(&record.source_id) {
            Ok(Some(current)) => {
                self.backups
                    .create(&record.source_id, &current.entity, Some("pre-recovery backup"))?;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(
                "no pre-recovery backup for {}; current file is unreadable: {}",
                record.source_id,
                e
            ),
        }

        self.store.overwrite(&snapshot)?;

        let written = self
            .store
            .load(&record.source_id)?
            .ok_or_else(|| StoreError::not_found("entity", record.source_id.clone()))?;
        let expected = entity_hash(&snapshot)
            .map_err(|e| StoreError::codec(self.store.path_for(&snapshot.id), e))?;
        let check = self.verify_integrity(&written.entity, Some(&expected));
        if !check.ok {
            return Err(StoreError::corrupt(
                self.store.path_for(&snapshot.id),
                check.message,
            ));
        }

        tracing::info!("restored {} from backup {}", record.source_id, backup_id);
        Ok(snapshot)
    }

    /// Hash `snapshot`'s canonical form and compare against `expected_hash`.
    pub fn verify_integrity(&self, snapshot: &Entity, expected_hash: Option<&str>) -> Integrity {
        let hash = match entity_hash(snapshot) {
            Ok(hash) => hash,
            Err(e) => {
                return Integrity {
                    ok: false,
                    hash: String::new(),
                    message: format!("integrity check failed: {}", e),
                };
            }
        };

        match expected_hash {
            Some(expected) if expected != hash => Integrity {
                ok: false,
                message: format!("hash mismatch: expected {}, got {}", expected, hash),
                hash,
            },
            _ => Integrity {
                ok: true,
                message: format!("integrity verified: {}", hash),
                hash,
            },
        }
    }

    /// Audit entity files, the changelog, and backups. Reports only.
    pub fn check_consistency(&self) -> Result<ConsistencyReport> {
        let mut issues = Vec::new();

        for (id, path) in self.store.entity_files()? {
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    issues.push(format!("{}: unreadable: {}", path.display(), e));
                    continue;
                }
            };
            let value: serde_json::Value = match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(e) => {
                    issues.push(format!("{}: invalid json: {}", path.display(), e));
                    continue;
                }
            };
            if !looks_like_entity(&value) {
                continue;
            }
            match decode_value(value, Some(&id)) {
                Ok(decoded) if !decoded.skipped.is_clean() => issues.push(format!(
                    "{}: {} malformed sub-records",
                    id,
                    decoded.skipped.total()
                )),
                Ok(_) => {}
                Err(e) => issues.push(format!("{}: {}", path.display(), e)),
            }
        }

        if self.store.changelog().has_unpersisted() {
            issues.push("changelog has entries that are not yet on disk".to_string());
        }

        for record in self.backups.list(None) {
            if let Err(e) = self.backups.read_payload(&record.backup_id) {
                issues.push(format!("backup {}: {}", record.backup_id, e));
            }
        }

        for issue in &issues {
            tracing::warn!("consistency: {}", issue);
        }
        Ok(ConsistencyReport {
            ok: issues.is_empty(),
            issues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::AtomicWriter;
    use crate::changelog::ChangeLog;
    use crate::entity_store::{BACKUP_DIR, CHANGELOG_FILE};
    use rollbook_core::Grade;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<EntityStore>,
        backups: Arc<BackupStore>,
        recovery: RecoveryManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let writer = AtomicWriter::new(false);
        let log = Arc::new(ChangeLog::open(&dir.path().join(CHANGELOG_FILE), writer).unwrap());
        let store = Arc::new(EntityStore::new(dir.path(), writer, log).unwrap());
        let backups = Arc::new(BackupStore::open(&dir.path().join(BACKUP_DIR), writer).unwrap());
        let recovery = RecoveryManager::new(Arc::clone(&store), Arc::clone(&backups));
        Fixture {
            _dir: dir,
            store,
            backups,
            recovery,
        }
    }

    fn current(fx: &Fixture) -> Entity {
        fx.store.load("s1").unwrap().unwrap().entity
    }

    /// Saves Math 70, then 85, then removes Math.
    fn three_versions(fx: &Fixture) -> Entity {
        let mut e = Entity::empty("s1");
        e.name = "Ali".to_string();
        e.set_grade(Grade::new("Math", 70.0, "2024-01-01"));
        fx.store.save(&mut e).unwrap();
        e.set_grade(Grade::new("Math", 85.0, "2024-01-01"));
        fx.store.save(&mut e).unwrap();
        e.remove_grade("Math");
        fx.store.save(&mut e).unwrap();
        e
    }

    #[test]
    fn restore_to_first_entry_brings_back_original_grade() {
        let fx = fixture();
        let before = three_versions(&fx);

        let outcome = fx.recovery.restore_from_changelog("s1", 0).unwrap();
        assert!(outcome.changelog_persisted);
        let restored = outcome.entity;

        assert_eq!(restored.grades["Math"].score, 70.0);
        assert_eq!(current(&fx), restored);

        let history = fx.store.changelog().history("s1", None, None);
        assert_eq!(history.len(), 4);
        let last = &history[3];
        assert_eq!(last.operation, Operation::Restore);
        assert_eq!(last.prev_snapshot.as_ref(), Some(&before));
        assert_eq!(last.new_snapshot, restored);
        assert_eq!(
            last.diffs,
            vec![DiffEntry::Restore {
                description: "restore to entry 0".to_string()
            }]
        );
    }

    #[test]
    fn restore_to_update_entry_uses_its_previous_snapshot() {
        let fx = fixture();
        three_versions(&fx);

        let restored = fx.recovery.restore_from_changelog("s1", 2).unwrap().entity;
        assert_eq!(restored.grades["Math"].score, 85.0);
    }

    #[test]
    fn restore_reports_an_unpersisted_changelog_entry() {
        let fx = fixture();
        three_versions(&fx);
        let log_path = fx._dir.path().join(CHANGELOG_FILE);
        fs::remove_file(&log_path).unwrap();
        fs::create_dir(&log_path).unwrap();
        fs::write(log_path.join("blocker"), b"x").unwrap();

        let outcome = fx.recovery.restore_from_changelog("s1", 0).unwrap();

        assert!(!outcome.changelog_persisted);
        assert_eq!(current(&fx), outcome.entity);
        assert_eq!(fx.store.changelog().len("s1"), 4);
        assert!(fx.store.changelog().has_unpersisted());
    }

    #[test]
    fn restore_is_itself_reversible() {
        let fx = fixture();
        let before = three_versions(&fx);

        fx.recovery.restore_from_changelog("s1", 0).unwrap();
        fx.recovery.restore_from_changelog("s1", 3).unwrap();

        assert_eq!(current(&fx), before);
        assert_eq!(fx.store.changelog().len("s1"), 5);
    }

    #[test]
    fn out_of_range_index_is_not_found_and_changes_nothing() {
        let fx = fixture();
        let before = three_versions(&fx);

        let err = fx.recovery.restore_from_changelog("s1", 3).unwrap_err();
        assert!(err.is_not_found());
        assert!(fx.recovery.restore_from_changelog("ghost", 0).unwrap_err().is_not_found());

        assert_eq!(current(&fx), before);
        assert_eq!(fx.store.changelog().len("s1"), 3);
    }

    #[test]
    fn backup_restore_leaves_changelog_alone() {
        let fx = fixture();
        let mut e = Entity::empty("s1");
        e.set_grade(Grade::new("Math", 70.0, ""));
        fx.store.save(&mut e).unwrap();
        let record = fx.backups.create("s1", &e, None).unwrap();

        e.set_grade(Grade::new("Math", 10.0, ""));
        fx.store.save(&mut e).unwrap();
        let entries = fx.store.changelog().len("s1");

        let restored = fx.recovery.restore_from_backup(&record.backup_id).unwrap();

        assert_eq!(restored.grades["Math"].score, 70.0);
        assert_eq!(current(&fx), restored);
        assert_eq!(fx.store.changelog().len("s1"), entries);

        let pre = fx.backups.list(Some("s1"));
        assert_eq!(pre.len(), 2);
        assert_eq!(pre[1].description.as_deref(), Some("pre-recovery backup"));
        assert_eq!(
            fx.backups.restore(&pre[1].backup_id).unwrap().grades["Math"].score,
            10.0
        );
    }

    #[test]
    fn tampered_backup_is_refused_before_writing() {
        let fx = fixture();
        let mut e = Entity::empty("s1");
        e.set_grade(Grade::new("Math", 70.0, ""));
        fx.store.save(&mut e).unwrap();
        let record = fx.backups.create("s1", &e, None).unwrap();
        fs::write(fx.backups.payload_path(&record), b"{\"id\": \"s1\"}").unwrap();

        e.set_grade(Grade::new("Math", 99.0, ""));
        fx.store.save(&mut e).unwrap();

        let err = fx.recovery.restore_from_backup(&record.backup_id).unwrap_err();
        assert!(err.is_corrupt());
        assert_eq!(current(&fx).grades["Math"].score, 99.0);
    }

    #[test]
    fn verify_integrity_compares_hashes() {
        let fx = fixture();
        let e = Entity::empty("s1");
        let hash = entity_hash(&e).unwrap();

        let good = fx.recovery.verify_integrity(&e, Some(&hash));
        assert!(good.ok);
        assert_eq!(good.hash, hash);

        assert!(fx.recovery.verify_integrity(&e, None).ok);

        let bad = fx.recovery.verify_integrity(&e, Some("deadbeef"));
        assert!(!bad.ok);
        assert!(bad.message.contains("hash mismatch"));
    }

    #[test]
    fn consistency_reports_without_repairing() {
        let fx = fixture();
        three_versions(&fx);
        assert!(fx.recovery.check_consistency().unwrap().ok);

        let record = fx.backups.create("s1", &current(&fx), None).unwrap();
        fs::remove_file(fx.backups.payload_path(&record)).unwrap();
        fs::write(fx.store.path_for("broken"), b"{not json").unwrap();

        let report = fx.recovery.check_consistency().unwrap();

        assert!(!report.ok);
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues.iter().any(|i| i.contains(&record.backup_id)));
        assert!(report.issues.iter().any(|i| i.contains("invalid json")));
        assert!(fx.store.path_for("broken").exists());
        assert_eq!(fx.backups.len(), 1);
    }
}

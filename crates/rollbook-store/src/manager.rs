// ABOUTME: High-level storage manager for a rollbook data directory.
// ABOUTME: Wires the entity store, changelog, backups, and recovery together and writes roster exports.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rollbook_core::Entity;
use rollbook_core::export::{ExportFormat, export_csv, export_json, export_yaml};
use serde::Serialize;
use thiserror::Error;

use crate::atomic::AtomicWriter;
use crate::autosave::{AutosaveHandle, Autosaver};
use crate::backup::BackupStore;
use crate::changelog::ChangeLog;
use crate::config::RollbookConfig;
use crate::entity_store::{BACKUP_DIR, CHANGELOG_FILE, EntityStore};
use crate::error::StoreError;
use crate::recovery::RecoveryManager;

/// Errors that can occur during storage management operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json export error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml export error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("csv export error: {0}")]
    Csv(#[from] csv::Error),
}

/// Summary of a data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    pub data_dir: PathBuf,
    pub entity_count: usize,
    pub backup_count: usize,
    pub changelog_entries: usize,
    pub consistent: bool,
    pub issues: Vec<String>,
}

/// Owns every component for one data directory.
pub struct StorageManager {
    config: RollbookConfig,
    store: Arc<EntityStore>,
    backups: Arc<BackupStore>,
    recovery: RecoveryManager,
}

impl StorageManager {
    /// Open the data directory described by `config`, creating `data/` and
    /// `data/backups/` if they do not exist.
    pub fn open(config: &RollbookConfig) -> Result<Self, ManagerError> {
        let data_dir = &config.data_dir;
        fs::create_dir_all(data_dir.join(BACKUP_DIR))?;

        let writer = AtomicWriter::new(config.fsync);
        let changelog = Arc::new(ChangeLog::open(&data_dir.join(CHANGELOG_FILE), writer)?);
        let backups = Arc::new(BackupStore::open(&data_dir.join(BACKUP_DIR), writer)?);

        let mut store = EntityStore::new(data_dir, writer, changelog)?;
        if config.auto_backup {
            store = store.with_auto_backup(Arc::clone(&backups));
        }
        let store = Arc::new(store);
        let recovery = RecoveryManager::new(Arc::clone(&store), Arc::clone(&backups));

        tracing::info!("opened data directory {}", data_dir.display());
        Ok(Self {
            config: config.clone(),
            store,
            backups,
            recovery,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn config(&self) -> &RollbookConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn backups(&self) -> &Arc<BackupStore> {
        &self.backups
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Start an autosaver on the current tokio runtime using the configured interval.
    pub fn spawn_autosaver(&self) -> AutosaveHandle {
        Autosaver::spawn(Arc::clone(&self.store), self.config.autosave_interval)
    }

    /// Counts plus the result of a consistency check.
    pub fn status(&self) -> Result<StoreStatus, ManagerError> {
        let report = self.recovery.check_consistency()?;
        Ok(StoreStatus {
            data_dir: self.config.data_dir.clone(),
            entity_count: self.store.list()?.len(),
            backup_count: self.backups.len(),
            changelog_entries: self.store.changelog().total_entries(),
            consistent: report.ok,
            issues: report.issues,
        })
    }

    /// Write every readable entity to `path`. Returns how many were exported.
    pub fn export(&self, path: &Path, format: ExportFormat) -> Result<usize, ManagerError> {
        let entities = self.store.list()?;
        let text = render(&entities, format)?;
        AtomicWriter::new(self.config.fsync).write(path, text.as_bytes())?;
        tracing::info!(
            "exported {} entities as {} to {}",
            entities.len(),
            format,
            path.display()
        );
        Ok(entities.len())
    }

    /// Write each readable entity to its own `<id>.<ext>` file under `dir`.
    /// Stops at the first failure; files already written stay.
    pub fn export_batch(&self, dir: &Path, format: ExportFormat) -> Result<usize, ManagerError> {
        fs::create_dir_all(dir)?;
        let writer = AtomicWriter::new(self.config.fsync);
        let entities = self.store.list()?;
        for entity in &entities {
            let text = render(std::slice::from_ref(entity), format)?;
            let path = dir.join(format!("{}.{}", entity.id, format.extension()));
            writer.write(&path, text.as_bytes())?;
        }
        tracing::info!(
            "exported {} entities as {} files to {}",
            entities.len(),
            format,
            dir.display()
        );
        Ok(entities.len())
    }
}

fn render(entities: &[Entity], format: ExportFormat) -> Result<String, ManagerError> {
    Ok(match format {
        ExportFormat::Json => export_json(entities)?,
        ExportFormat::Yaml => export_yaml(entities)?,
        ExportFormat::Csv => export_csv(entities)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollbook_core::{Entity, Grade};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> RollbookConfig {
        RollbookConfig {
            fsync: false,
            ..RollbookConfig::default()
        }
        .with_data_dir(dir.path().join("data"))
    }

    fn student(id: &str, class: &str, score: f64) -> Entity {
        let mut e = Entity::empty(id);
        e.name = id.to_uppercase();
        e.class_name = class.to_string();
        e.set_grade(Grade::new("Math", score, ""));
        e
    }

    #[test]
    fn open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let manager = StorageManager::open(&config(&dir)).unwrap();

        assert!(manager.data_dir().is_dir());
        assert!(manager.data_dir().join("backups").is_dir());
    }

    #[test]
    fn status_counts_everything() {
        let dir = TempDir::new().unwrap();
        let manager = StorageManager::open(&config(&dir)).unwrap();
        let mut a = student("a", "9A", 70.0);
        manager.store().save(&mut a).unwrap();
        manager.store().save(&mut student("b", "9B", 50.0)).unwrap();
        manager.backups().create("a", &a, None).unwrap();

        let status = manager.status().unwrap();

        assert_eq!(status.entity_count, 2);
        assert_eq!(status.backup_count, 1);
        assert_eq!(status.changelog_entries, 2);
        assert!(status.consistent, "{:?}", status.issues);
    }

    #[test]
    fn auto_backup_follows_config() {
        let dir = TempDir::new().unwrap();
        let cfg = RollbookConfig {
            auto_backup: true,
            ..config(&dir)
        };
        let manager = StorageManager::open(&cfg).unwrap();

        let outcome = manager.store().save(&mut student("a", "9A", 70.0)).unwrap();

        assert!(outcome.backup_id.is_some());
        assert_eq!(manager.backups().list(Some("a")).len(), 1);
    }

    #[test]
    fn reopen_sees_previous_state() {
        let dir = TempDir::new().unwrap();
        {
            let manager = StorageManager::open(&config(&dir)).unwrap();
            manager.store().save(&mut student("a", "9A", 70.0)).unwrap();
        }
        let manager = StorageManager::open(&config(&dir)).unwrap();
        assert_eq!(manager.store().changelog().len("a"), 1);
        assert!(manager.store().load("a").unwrap().is_some());
    }

    #[test]
    fn export_writes_json_and_yaml() {
        let dir = TempDir::new().unwrap();
        let manager = StorageManager::open(&config(&dir)).unwrap();
        manager.store().save(&mut student("a", "9A", 70.0)).unwrap();
        manager.store().save(&mut student("b", "9B", 50.0)).unwrap();

        let json_path = dir.path().join("out").join("roster.json");
        assert_eq!(manager.export(&json_path, ExportFormat::Json).unwrap(), 2);
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(value[0]["id"], "a");
        assert_eq!(value[1]["id"], "b");

        let yaml_path = dir.path().join("roster.yaml");
        manager.export(&yaml_path, ExportFormat::Yaml).unwrap();
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(&yaml_path).unwrap()).unwrap();
        let classes = yaml["classes"].as_sequence().unwrap();
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0]["name"].as_str(), Some("9A"));
    }

    #[test]
    fn export_writes_csv_grade_sheet() {
        let dir = TempDir::new().unwrap();
        let manager = StorageManager::open(&config(&dir)).unwrap();
        manager.store().save(&mut student("a", "9A", 70.0)).unwrap();
        manager.store().save(&mut student("b", "9B", 50.0)).unwrap();

        let path = dir.path().join("grades.csv");
        assert_eq!(manager.export(&path, ExportFormat::Csv).unwrap(), 2);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "id,name,class,Math,average\na,A,9A,70,70.00\nb,B,9B,50,50.00\n"
        );
    }

    #[test]
    fn export_batch_writes_one_file_per_entity() {
        let dir = TempDir::new().unwrap();
        let manager = StorageManager::open(&config(&dir)).unwrap();
        manager.store().save(&mut student("a", "9A", 70.0)).unwrap();
        manager.store().save(&mut student("b", "9B", 50.0)).unwrap();

        let out = dir.path().join("batch");
        assert_eq!(manager.export_batch(&out, ExportFormat::Json).unwrap(), 2);
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join("a.json")).unwrap()).unwrap();
        assert_eq!(value[0]["id"], "a");
        assert!(out.join("b.json").is_file());

        assert_eq!(manager.export_batch(&out, ExportFormat::Csv).unwrap(), 2);
        assert_eq!(
            fs::read_to_string(out.join("b.csv")).unwrap(),
            "id,name,class,Math,average\nb,B,9B,50,50.00\n"
        );
        assert!(!out.join("a.yaml").exists());
    }
}

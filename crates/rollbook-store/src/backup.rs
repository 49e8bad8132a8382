// ABOUTME: Content-addressed snapshot backups with a JSON metadata index.
// ABOUTME: Payloads are named by their SHA-256; restores verify the hash before decoding.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rollbook_core::codec::{canonical_bytes, content_hash, decode_slice};
use rollbook_core::Entity;
use rollbook_core::model::validate_id;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::atomic::{AtomicWriter, quarantine};
use crate::error::{Result, StoreError};

pub const METADATA_FILE: &str = "metadata.json";

/// Encoding of a backup payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupFormat {
    Json,
}

impl BackupFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            BackupFormat::Json => "json",
        }
    }
}

/// Metadata describing one backup. `path` is relative to the backup directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub content_hash: String,
    pub path: PathBuf,
    pub format: BackupFormat,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Snapshot backups for all entities under one directory.
pub struct BackupStore {
    dir: PathBuf,
    writer: AtomicWriter,
    records: Mutex<Vec<BackupRecord>>,
}

impl BackupStore {
    /// Open the backup directory, creating it if needed. Unreadable metadata
    /// is quarantined and an empty index started; payload files are untouched.
    pub fn open(dir: &Path, writer: AtomicWriter) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let metadata_path = dir.join(METADATA_FILE);

        let records = if metadata_path.exists() {
            let bytes = fs::read(&metadata_path)?;
            match serde_json::from_slice::<Vec<BackupRecord>>(&bytes) {
                Ok(records) => {
                    tracing::info!("loaded {} backup records", records.len());
                    records
                }
                Err(e) => {
                    tracing::error!(
                        "backup metadata {} is unreadable: {}",
                        metadata_path.display(),
                        e
                    );
                    quarantine(&metadata_path)?;
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            writer,
            records: Mutex::new(records),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute location of a record's payload.
    pub fn payload_path(&self, record: &BackupRecord) -> PathBuf {
        self.dir.join(&record.path)
    }

    /// Back up `snapshot` for `entity_id`. Identical content shares one payload
    /// file but still gets its own record. Snapshots that could not be saved as
    /// an entity are rejected with `Invalid`.
    pub fn create(
        &self,
        entity_id: &str,
        snapshot: &Entity,
        description: Option<&str>,
    ) -> Result<BackupRecord> {
        validate_id(entity_id)?;
        snapshot.validate()?;
        let bytes = canonical_bytes(snapshot).map_err(|e| StoreError::codec(&self.dir, e))?;
        let hash = content_hash(&bytes);
        let format = BackupFormat::Json;
        let file_name = PathBuf::from(format!("backup_{}.{}", hash, format.extension()));

        let mut records = self.lock();

        self.writer.write(&self.dir.join(&file_name), &bytes)?;

        let record = BackupRecord {
            backup_id: Ulid::new().to_string(),
            timestamp: Utc::now(),
            source_id: entity_id.to_string(),
            content_hash: hash,
            path: file_name,
            format,
            file_size: bytes.len() as u64,
            description: description.map(str::to_string),
        };

        records.push(record.clone());
        if let Err(e) = self.persist(&records) {
            records.pop();
            return Err(e);
        }

        tracing::info!(
            "created backup {} for {} ({} bytes)",
            record.backup_id,
            entity_id,
            record.file_size
        );
        Ok(record)
    }

    /// The verified payload bytes of a backup.
    pub fn read_payload(&self, backup_id: &str) -> Result<Vec<u8>> {
        let record = self.get(backup_id)?;
        let path = self.payload_path(&record);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::corrupt(&path, "backup payload is missing"));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = content_hash(&bytes);
        if actual != record.content_hash {
            return Err(StoreError::corrupt(
                &path,
                format!(
                    "hash mismatch: expected {}, got {}",
                    record.content_hash, actual
                ),
            ));
        }
        Ok(bytes)
    }

    /// Load the snapshot stored in a backup. Fails with `NotFound` for an
    /// unknown id, and with `Corrupt` if the payload no longer matches its hash
    /// or any of its sub-records cannot be decoded.
    pub fn restore(&self, backup_id: &str) -> Result<Entity> {
        let bytes = self.read_payload(backup_id)?;
        let record = self.get(backup_id)?;
        let path = self.payload_path(&record);
        let decoded = decode_slice(&bytes, Some(&record.source_id))
            .map_err(|e| StoreError::codec(&path, e))?;
        if !decoded.skipped.is_clean() {
            return Err(StoreError::corrupt(
                &path,
                format!("{} malformed sub-records", decoded.skipped.total()),
            ));
        }
        tracing::info!("restored backup {}", backup_id);
        Ok(decoded.entity)
    }

    pub fn get(&self, backup_id: &str) -> Result<BackupRecord> {
        self.lock()
            .iter()
            .find(|r| r.backup_id == backup_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("backup", backup_id))
    }

    /// All records, oldest first, optionally only those for one entity.
    pub fn list(&self, entity_id: Option<&str>) -> Vec<BackupRecord> {
        self.lock()
            .iter()
            .filter(|r| entity_id.is_none_or(|id| r.source_id == id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove a backup record. Its payload file is deleted once no other
    /// record points at it.
    pub fn delete(&self, backup_id: &str) -> Result<()> {
        let mut records = self.lock();
        let index = records
            .iter()
            .position(|r| r.backup_id == backup_id)
            .ok_or_else(|| StoreError::not_found("backup", backup_id))?;

        let removed = records.remove(index);
        if let Err(e) = self.persist(&records) {
            records.insert(index, removed);
            return Err(e);
        }

        let shared = records.iter().any(|r| r.path == removed.path);
        if !shared {
            let path = self.payload_path(&removed);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("could not remove {}: {}", path.display(), e),
            }
        }

        tracing::info!("deleted backup {}", backup_id);
        Ok(())
    }

    fn persist(&self, records: &[BackupRecord]) -> Result<()> {
        self.writer.write_json(&self.dir.join(METADATA_FILE), records)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BackupRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

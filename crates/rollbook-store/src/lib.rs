// ABOUTME: Persistence layer for rollbook, handling entity files, change history, and backups.
// ABOUTME: Provides atomic writes, the changelog, content-addressed backups, recovery, and autosave.

pub mod atomic;
pub mod autosave;
pub mod backup;
pub mod changelog;
pub mod config;
pub mod entity_store;
pub mod error;
pub mod manager;
pub mod recovery;

pub use atomic::AtomicWriter;
pub use autosave::{AutosaveError, AutosaveHandle, Autosaver, LastKnownState, Saved};
pub use backup::{BackupFormat, BackupRecord, BackupStore};
pub use changelog::ChangeLog;
pub use config::{ConfigError, RollbookConfig};
pub use entity_store::{EntityStore, Loaded, SaveOutcome};
pub use error::{Result, StoreError};
pub use manager::{ManagerError, StorageManager, StoreStatus};
pub use recovery::{ConsistencyReport, Integrity, RecoveryManager, Restored};

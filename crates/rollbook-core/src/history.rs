// ABOUTME: Defines the changelog entry envelope and the operation kinds recorded for an entity.
// ABOUTME: Entries are immutable facts: what changed, when, and the snapshots on either side.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::DiffEntry;
use crate::model::Entity;

/// What kind of event produced a changelog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Restore,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Restore => "restore",
        };
        f.write_str(s)
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "restore" => Ok(Operation::Restore),
            other => Err(format!("unknown operation: {}", other)),
        }
    }
}

/// One recorded change to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub timestamp: DateTime<Utc>,
    pub entity_id: String,
    pub operation: Operation,
    pub diffs: Vec<DiffEntry>,
    /// State before the change; `None` when the entity did not exist yet.
    pub prev_snapshot: Option<Entity>,
    pub new_snapshot: Entity,
    /// SHA-256 of the canonical serialization of `new_snapshot`.
    #[serde(default)]
    pub snapshot_hash: String,
}

impl ChangeLogEntry {
    /// Build an entry stamped now. The operation is `Create` when there is no
    /// previous snapshot and `Update` otherwise.
    pub fn record(
        prev_snapshot: Option<Entity>,
        new_snapshot: Entity,
        diffs: Vec<DiffEntry>,
        snapshot_hash: String,
    ) -> Self {
        let operation = if prev_snapshot.is_some() {
            Operation::Update
        } else {
            Operation::Create
        };
        Self {
            timestamp: Utc::now(),
            entity_id: new_snapshot.id.clone(),
            operation,
            diffs,
            prev_snapshot,
            new_snapshot,
            snapshot_hash,
        }
    }

    /// The state a restore to this entry brings back: the state before the
    /// change, or for a creation entry the earliest recorded state.
    pub fn restore_target(&self) -> &Entity {
        self.prev_snapshot.as_ref().unwrap_or(&self.new_snapshot)
    }
}

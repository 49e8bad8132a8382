// ABOUTME: Defines the Entity record (a student profile) and its Grade, BehaviorNote, and Insight sub-records.
// ABOUTME: Grades and notes are strongly-typed keyed maps; insights are an append-only ordered list.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// File stems the store keeps for itself inside the data directory.
pub const RESERVED_IDS: &[&str] = &["changelog"];

/// Reasons an entity is refused before it reaches disk.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("entity id is empty")]
    EmptyId,

    #[error("entity id {0:?} is not usable as a file name")]
    UnsafeId(String),

    #[error("entity id {0:?} is reserved by the store")]
    ReservedId(String),

    #[error("grade for {subject:?} has a non-finite score")]
    NonFiniteScore { subject: String },
}

/// A single graded subject. Subjects are the identity key within an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grade {
    pub subject: String,
    pub score: f64,
    #[serde(default)]
    pub date: String,
}

impl Grade {
    pub fn new(subject: impl Into<String>, score: f64, date: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            score,
            date: date.into(),
        }
    }
}

/// A free-text observation about behavior, identified by its exact text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorNote {
    #[serde(alias = "note")]
    pub text: String,
    #[serde(rename = "type", default = "BehaviorNote::default_kind")]
    pub kind: String,
    #[serde(default)]
    pub date: String,
}

impl BehaviorNote {
    pub fn new(text: impl Into<String>, kind: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: kind.into(),
            date: date.into(),
        }
    }

    fn default_kind() -> String {
        "general".to_string()
    }
}

/// Finished analysis text produced by the AI collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    #[serde(alias = "analysis")]
    pub text: String,
    pub model: String,
    #[serde(default)]
    pub date: String,
}

impl Insight {
    pub fn new(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: model.into(),
            date: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// Collections keyed by one of their own fields serialize as plain lists.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Grade {
    fn key(&self) -> &str {
        &self.subject
    }
}

impl Keyed for BehaviorNote {
    fn key(&self) -> &str {
        &self.text
    }
}

/// Serde adapter storing a `BTreeMap<String, V>` as a JSON list of `V`.
/// On read, later duplicates of the same key replace earlier ones.
pub(crate) mod keyed_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Keyed;

    pub fn serialize<S, V>(map: &BTreeMap<String, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<BTreeMap<String, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de> + Keyed,
    {
        let items = Vec::<V>::deserialize(deserializer)?;
        Ok(items
            .into_iter()
            .map(|item| (item.key().to_string(), item))
            .collect())
    }
}

/// A student profile: the mutable record the store versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "class", default)]
    pub class_name: String,
    #[serde(default)]
    pub enrollment_date: String,
    #[serde(with = "keyed_list", default)]
    pub grades: BTreeMap<String, Grade>,
    #[serde(with = "keyed_list", default)]
    pub behavior_notes: BTreeMap<String, BehaviorNote>,
    #[serde(rename = "ai_insights", default)]
    pub insights: Vec<Insight>,
    #[serde(default)]
    pub file_content: String,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Entity {
    /// Create a new entity with a fresh ULID, enrolled today.
    pub fn new(name: impl Into<String>, class_name: impl Into<String>) -> Self {
        let mut entity = Self::empty(Ulid::new().to_string());
        entity.name = name.into();
        entity.class_name = class_name.into();
        entity.enrollment_date = Utc::now().format("%Y-%m-%d").to_string();
        entity
    }

    /// An entity with only its id set. Used as the "before" side of a first save.
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            class_name: String::new(),
            enrollment_date: String::new(),
            grades: BTreeMap::new(),
            behavior_notes: BTreeMap::new(),
            insights: Vec::new(),
            file_content: String::new(),
            last_updated: None,
        }
    }

    /// Insert or replace the grade for `grade.subject`. Returns the previous grade.
    pub fn set_grade(&mut self, grade: Grade) -> Option<Grade> {
        self.grades.insert(grade.subject.clone(), grade)
    }

    pub fn remove_grade(&mut self, subject: &str) -> Option<Grade> {
        self.grades.remove(subject)
    }

    /// Add a note unless one with the same text exists. Returns whether it was added.
    pub fn add_behavior_note(&mut self, note: BehaviorNote) -> bool {
        if self.behavior_notes.contains_key(&note.text) {
            return false;
        }
        self.behavior_notes.insert(note.text.clone(), note);
        true
    }

    pub fn remove_behavior_note(&mut self, text: &str) -> Option<BehaviorNote> {
        self.behavior_notes.remove(text)
    }

    pub fn push_insight(&mut self, insight: Insight) {
        self.insights.push(insight);
    }

    /// Check the invariants the store relies on before writing `<id>.json`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_id(&self.id)?;
        for grade in self.grades.values() {
            if !grade.score.is_finite() {
                return Err(ValidationError::NonFiniteScore {
                    subject: grade.subject.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Ids double as file stems, so they must not escape the data directory.
pub fn validate_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyId);
    }
    if id.starts_with('.') || id.contains(['/', '\\', '\0']) {
        return Err(ValidationError::UnsafeId(id.to_string()));
    }
    if RESERVED_IDS.contains(&id) {
        return Err(ValidationError::ReservedId(id.to_string()));
    }
    Ok(())
}

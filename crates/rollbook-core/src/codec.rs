// ABOUTME: Lenient JSON codec for Entity records with per-sub-record skip accounting.
// ABOUTME: Also defines the canonical serialization and SHA-256 content hash used for integrity checks.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{BehaviorNote, Entity, Grade, Insight, Keyed};

/// Errors that make a whole record unreadable.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record has no string id")]
    MissingId,
}

/// Counts of sub-records dropped while decoding, by collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipReport {
    pub grades: usize,
    pub behavior_notes: usize,
    pub insights: usize,
}

impl SkipReport {
    pub fn total(&self) -> usize {
        self.grades + self.behavior_notes + self.insights
    }

    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }
}

/// An entity recovered from disk together with what had to be dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub entity: Entity,
    pub skipped: SkipReport,
}

/// The byte form written to entity files and backups. Pretty-printed so the
/// data directory stays human-inspectable; deterministic because keyed
/// collections are ordered maps.
pub fn canonical_bytes(entity: &Entity) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec_pretty(entity)?)
}

/// Hex SHA-256 of arbitrary bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-256 of the canonical serialization of `entity`.
pub fn entity_hash(entity: &Entity) -> Result<String, CodecError> {
    Ok(content_hash(&canonical_bytes(entity)?))
}

/// Cheap check used when scanning a directory: a JSON object with a string id.
pub fn looks_like_entity(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|obj| obj.get("id"))
        .is_some_and(Value::is_string)
}

/// Decode raw bytes. See [`decode_value`].
pub fn decode_slice(bytes: &[u8], fallback_id: Option<&str>) -> Result<Decoded, CodecError> {
    let value: Value = serde_json::from_slice(bytes)?;
    decode_value(value, fallback_id)
}

/// Decode an entity, dropping (and counting) any grade, note, or insight that
/// does not parse instead of failing the whole record. `fallback_id` is used
/// when the record carries no id of its own, e.g. the file stem.
pub fn decode_value(value: Value, fallback_id: Option<&str>) -> Result<Decoded, CodecError> {
    let Value::Object(mut obj) = value else {
        return Err(CodecError::NotAnObject);
    };

    let id = match obj.remove("id") {
        Some(Value::String(id)) => id,
        _ => fallback_id.map(str::to_string).ok_or(CodecError::MissingId)?,
    };

    let mut skipped = SkipReport::default();
    let mut entity = Entity::empty(id);

    entity.name = take_string(&mut obj, &["name"]);
    entity.class_name = take_string(&mut obj, &["class_name", "class"]);
    entity.enrollment_date = take_string(&mut obj, &["enrollment_date"]);
    entity.file_content = take_string(&mut obj, &["file_content"]);
    entity.last_updated = obj.remove("last_updated").as_ref().and_then(parse_timestamp);

    let (grades, bad) = take_list::<Grade>(&mut obj, "grades");
    entity.grades = keyed(grades);
    skipped.grades = bad;

    let (notes, bad) = take_list::<BehaviorNote>(&mut obj, "behavior_notes");
    // Notes keep the first occurrence of a text, matching add_behavior_note.
    for note in notes {
        entity.add_behavior_note(note);
    }
    skipped.behavior_notes = bad;

    let (insights, bad) = take_list::<Insight>(&mut obj, "ai_insights");
    entity.insights = insights;
    skipped.insights = bad;

    Ok(Decoded { entity, skipped })
}

fn take_string(obj: &mut Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| match obj.remove(*key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        })
        .unwrap_or_default()
}

/// Decode each element of `obj[key]` independently. A missing or null field
/// is an empty list; any other non-list counts as one skipped record.
fn take_list<T: DeserializeOwned>(obj: &mut Map<String, Value>, key: &str) -> (Vec<T>, usize) {
    match obj.remove(key) {
        None | Some(Value::Null) => (Vec::new(), 0),
        Some(Value::Array(items)) => {
            let mut ok = Vec::with_capacity(items.len());
            let mut bad = 0;
            for item in items {
                match serde_json::from_value::<T>(item) {
                    Ok(parsed) => ok.push(parsed),
                    Err(e) => {
                        tracing::debug!("dropping malformed {} entry: {}", key, e);
                        bad += 1;
                    }
                }
            }
            (ok, bad)
        }
        Some(_) => (Vec::new(), 1),
    }
}

fn keyed<V: Keyed>(items: Vec<V>) -> BTreeMap<String, V> {
    items
        .into_iter()
        .map(|item| (item.key().to_string(), item))
        .collect()
}

/// Accepts RFC 3339 and the older "YYYY-MM-DD HH:MM:SS" local form.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

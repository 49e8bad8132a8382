// ABOUTME: Structural diff engine comparing two Entity snapshots.
// ABOUTME: Produces a deterministic list of tagged DiffEntry values (fields, grades, notes, insight count).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{BehaviorNote, Entity, Grade};

/// Longest prefix of `file_content` recorded in a FieldChanged entry.
pub const SNIPPET_CHARS: usize = 200;

/// Scalar fields, in the order their changes are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    ClassName,
    EnrollmentDate,
    FileContent,
}

impl Field {
    pub const ORDER: [Field; 4] = [
        Field::Name,
        Field::ClassName,
        Field::EnrollmentDate,
        Field::FileContent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::ClassName => "class_name",
            Field::EnrollmentDate => "enrollment_date",
            Field::FileContent => "file_content",
        }
    }

    fn get<'a>(&self, entity: &'a Entity) -> &'a str {
        match self {
            Field::Name => &entity.name,
            Field::ClassName => &entity.class_name,
            Field::EnrollmentDate => &entity.enrollment_date,
            Field::FileContent => &entity.file_content,
        }
    }
}

/// The keyed collection member an Added or Removed entry refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Member {
    Grade(Grade),
    BehaviorNote(BehaviorNote),
}

/// One structural change between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffEntry {
    FieldChanged {
        field: Field,
        old: String,
        new: String,
    },
    Added {
        member: Member,
    },
    Removed {
        member: Member,
    },
    Updated {
        subject: String,
        old: Grade,
        new: Grade,
    },
    CountChanged {
        old: usize,
        new: usize,
    },
    Restore {
        description: String,
    },
}

impl DiffEntry {
    /// A one-line summary for changelog listings.
    pub fn describe(&self) -> String {
        match self {
            DiffEntry::FieldChanged { field, old, new } => {
                if old.is_empty() {
                    format!("{} set to {:?}", field.as_str(), new)
                } else {
                    format!("{} changed from {:?} to {:?}", field.as_str(), old, new)
                }
            }
            DiffEntry::Added {
                member: Member::Grade(g),
            } => format!("grade added: {} = {}", g.subject, g.score),
            DiffEntry::Added {
                member: Member::BehaviorNote(n),
            } => format!("behavior note added: {:?}", n.text),
            DiffEntry::Removed {
                member: Member::Grade(g),
            } => format!("grade removed: {} (was {})", g.subject, g.score),
            DiffEntry::Removed {
                member: Member::BehaviorNote(n),
            } => format!("behavior note removed: {:?}", n.text),
            DiffEntry::Updated { subject, old, new } => {
                format!("grade updated: {} {} -> {}", subject, old.score, new.score)
            }
            DiffEntry::CountChanged { old, new } => {
                format!("insight count {} -> {}", old, new)
            }
            DiffEntry::Restore { description } => description.clone(),
        }
    }
}

/// Compare two snapshots of the same entity.
///
/// Ordering is fixed: scalar fields in [`Field::ORDER`], then grade changes by
/// subject, then note changes by text, then the insight count. Grades are
/// matched by exact subject and count as updated when the score differs;
/// notes are matched by exact text and are only ever added or removed.
pub fn compute(old: &Entity, new: &Entity) -> Vec<DiffEntry> {
    let mut diffs = Vec::new();

    for field in Field::ORDER {
        let (before, after) = (field.get(old), field.get(new));
        if before != after {
            diffs.push(DiffEntry::FieldChanged {
                field,
                old: snippet(field, before),
                new: snippet(field, after),
            });
        }
    }

    let subjects: BTreeSet<&String> = old.grades.keys().chain(new.grades.keys()).collect();
    for subject in subjects {
        match (old.grades.get(subject), new.grades.get(subject)) {
            (None, Some(added)) => diffs.push(DiffEntry::Added {
                member: Member::Grade(added.clone()),
            }),
            (Some(removed), None) => diffs.push(DiffEntry::Removed {
                member: Member::Grade(removed.clone()),
            }),
            (Some(before), Some(after)) if before.score != after.score => {
                diffs.push(DiffEntry::Updated {
                    subject: subject.clone(),
                    old: before.clone(),
                    new: after.clone(),
                })
            }
            _ => {}
        }
    }

    let texts: BTreeSet<&String> = old
        .behavior_notes
        .keys()
        .chain(new.behavior_notes.keys())
        .collect();
    for text in texts {
        match (old.behavior_notes.get(text), new.behavior_notes.get(text)) {
            (None, Some(added)) => diffs.push(DiffEntry::Added {
                member: Member::BehaviorNote(added.clone()),
            }),
            (Some(removed), None) => diffs.push(DiffEntry::Removed {
                member: Member::BehaviorNote(removed.clone()),
            }),
            _ => {}
        }
    }

    if old.insights.len() != new.insights.len() {
        diffs.push(DiffEntry::CountChanged {
            old: old.insights.len(),
            new: new.insights.len(),
        });
    }

    diffs
}

/// Like [`compute`], treating a missing previous snapshot as an empty entity
/// with the same id, so a first save reports everything as added.
pub fn compute_from(old: Option<&Entity>, new: &Entity) -> Vec<DiffEntry> {
    match old {
        Some(old) => compute(old, new),
        None => compute(&Entity::empty(new.id.clone()), new),
    }
}

fn snippet(field: Field, value: &str) -> String {
    if field == Field::FileContent {
        value.chars().take(SNIPPET_CHARS).collect()
    } else {
        value.to_string()
    }
}

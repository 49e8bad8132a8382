// ABOUTME: Exports entities as a structured YAML roster grouped by class.
// ABOUTME: Uses serde_yaml with deterministic ordering (class, then name, then id).

use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::Entity;

/// A serializable YAML representation of one grade line.
#[derive(Debug, Serialize)]
struct YamlGrade {
    subject: String,
    score: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    date: String,
}

/// A serializable YAML representation of a student.
#[derive(Debug, Serialize)]
struct YamlStudent {
    id: String,
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    enrolled: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    grades: Vec<YamlGrade>,
    #[serde(skip_serializing_if = "Option::is_none")]
    average: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    behavior: Vec<String>,
    insights: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_updated: Option<String>,
}

/// A class and its students.
#[derive(Debug, Serialize)]
struct YamlClass {
    name: String,
    students: Vec<YamlStudent>,
}

/// The top-level YAML roster.
#[derive(Debug, Serialize)]
struct YamlRoster {
    version: String,
    classes: Vec<YamlClass>,
}

/// Export entities as a YAML roster. Students without a class are grouped
/// under an empty class name, which sorts first.
pub fn export_yaml(entities: &[Entity]) -> Result<String, serde_yaml::Error> {
    let mut by_class: BTreeMap<&str, Vec<&Entity>> = BTreeMap::new();
    for entity in entities {
        by_class
            .entry(entity.class_name.as_str())
            .or_default()
            .push(entity);
    }

    let classes = by_class
        .into_iter()
        .map(|(class_name, mut students)| {
            students.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
            YamlClass {
                name: class_name.to_string(),
                students: students.into_iter().map(yaml_student).collect(),
            }
        })
        .collect();

    let roster = YamlRoster {
        version: "1".to_string(),
        classes,
    };

    serde_yaml::to_string(&roster)
}

fn yaml_student(entity: &Entity) -> YamlStudent {
    let grades: Vec<YamlGrade> = entity
        .grades
        .values()
        .map(|g| YamlGrade {
            subject: g.subject.clone(),
            score: g.score,
            date: g.date.clone(),
        })
        .collect();

    let average = if grades.is_empty() {
        None
    } else {
        Some(grades.iter().map(|g| g.score).sum::<f64>() / grades.len() as f64)
    };

    YamlStudent {
        id: entity.id.clone(),
        name: entity.name.clone(),
        enrolled: entity.enrollment_date.clone(),
        grades,
        average,
        behavior: entity
            .behavior_notes
            .values()
            .map(|n| format!("[{}] {}", n.kind, n.text))
            .collect(),
        insights: entity.insights.len(),
        last_updated: entity.last_updated.map(|ts| ts.to_rfc3339()),
    }
}

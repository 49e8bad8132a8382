// ABOUTME: Exports entities as a CSV grade sheet, one row per student and one column per subject.
// ABOUTME: Subject columns are the sorted union of every exported student's subjects.

use std::collections::BTreeSet;
use std::io;

use crate::model::Entity;

/// Export entities as CSV with the header `id,name,class,<subjects...>,average`.
///
/// A student without a grade in some subject gets an empty cell there, and a
/// student without grades has an empty average. Rows keep the input order.
pub fn export_csv(entities: &[Entity]) -> Result<String, csv::Error> {
    let subjects: BTreeSet<&str> = entities
        .iter()
        .flat_map(|e| e.grades.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = vec!["id", "name", "class"];
    header.extend(subjects.iter().copied());
    header.push("average");
    writer.write_record(&header)?;

    for entity in entities {
        let mut row = vec![entity.id.clone(), entity.name.clone(), entity.class_name.clone()];
        row.extend(subjects.iter().map(|subject| {
            entity
                .grades
                .get(*subject)
                .map(|g| g.score.to_string())
                .unwrap_or_default()
        }));
        row.push(average(entity).map(|avg| format!("{:.2}", avg)).unwrap_or_default());
        writer.write_record(&row)?;
    }

    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e).into())
}

fn average(entity: &Entity) -> Option<f64> {
    if entity.grades.is_empty() {
        return None;
    }
    let total: f64 = entity.grades.values().map(|g| g.score).sum();
    Some(total / entity.grades.len() as f64)
}

// ABOUTME: Exports a list of entities as a single pretty-printed JSON array.

use crate::model::Entity;

/// Export entities in their on-disk record shape, in the given order.
pub fn export_json(entities: &[Entity]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Grade;

    #[test]
    fn exports_array_of_records() {
        let mut e = Entity::empty("s1");
        e.set_grade(Grade::new("Math", 70.0, ""));

        let out = export_json(&[e]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();

        assert_eq!(value.as_array().map(Vec::len), Some(1));
        assert_eq!(value[0]["grades"][0]["subject"], "Math");
    }
}

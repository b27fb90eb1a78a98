//! Canonical record schema migration.
//!
//! Migration runs on the raw JSON value before typed deserialization, one
//! version step at a time. A record with no `version` key predates versioning
//! and is treated as v1. Versions newer than [`CURRENT_SCHEMA_VERSION`] are
//! rejected so an older engine never truncates a newer writer's data.
//!
//! | Version | Layout                                                          |
//! |---------|-----------------------------------------------------------------|
//! | 1       | flat: `fields`, `overview`, `notes`, `customSections`, `enrichedAt` |
//! | 2       | nested: `structured`, `narrative{overview,notes,sections}`, `enrichment` |

use serde_json::{Map, Value};
use thiserror::Error;

/// Schema version written by this engine.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Why a raw record could not be brought up to the current version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrateError {
    #[error("top-level value is not a JSON object")]
    NotAnObject,
    #[error("unreadable schema version {0}")]
    BadVersion(String),
    #[error("schema version {0} is newer than supported version {CURRENT_SCHEMA_VERSION}")]
    Future(u32),
    #[error("{0}")]
    Malformed(String),
}

/// Schema version of a raw record. Missing means v1.
pub fn schema_version(raw: &Value) -> Result<u32, MigrateError> {
    let Some(obj) = raw.as_object() else {
        return Err(MigrateError::NotAnObject);
    };
    match obj.get("version") {
        None => Ok(1),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n >= 1)
            .ok_or_else(|| MigrateError::BadVersion(v.to_string())),
    }
}

/// Migrate `raw` forward to [`CURRENT_SCHEMA_VERSION`].
///
/// Returns the migrated value and the version it started at.
pub fn migrate(mut raw: Value) -> Result<(Value, u32), MigrateError> {
    let original = schema_version(&raw)?;
    if original > CURRENT_SCHEMA_VERSION {
        return Err(MigrateError::Future(original));
    }
    let mut version = original;
    while version < CURRENT_SCHEMA_VERSION {
        raw = match version {
            1 => v1_to_v2(raw)?,
            other => return Err(MigrateError::BadVersion(other.to_string())),
        };
        version += 1;
    }
    Ok((raw, original))
}

fn v1_to_v2(raw: Value) -> Result<Value, MigrateError> {
    let Value::Object(mut obj) = raw else {
        return Err(MigrateError::NotAnObject);
    };

    let structured = take_object(&mut obj, "fields")?;

    let mut narrative = Map::new();
    for (from, to) in [("overview", "overview"), ("notes", "notes")] {
        if let Some(value) = obj.remove(from) {
            if !value.is_null() {
                narrative.insert(to.to_string(), value);
            }
        }
    }
    let sections = match obj.remove("customSections") {
        None | Some(Value::Null) => Value::Array(Vec::new()),
        Some(Value::Array(items)) => Value::Array(items),
        Some(_) => {
            return Err(MigrateError::Malformed(
                "v1 customSections must be an array".to_string(),
            ))
        }
    };
    narrative.insert("sections".to_string(), sections);

    let enrichment = take_object(&mut obj, "enrichedAt")?;

    obj.insert("version".to_string(), Value::from(2u32));
    obj.insert("structured".to_string(), Value::Object(structured));
    obj.insert("narrative".to_string(), Value::Object(narrative));
    if !enrichment.is_empty() {
        obj.insert("enrichment".to_string(), Value::Object(enrichment));
    }
    Ok(Value::Object(obj))
}

fn take_object(obj: &mut Map<String, Value>, key: &str) -> Result<Map<String, Value>, MigrateError> {
    match obj.remove(key) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(MigrateError::Malformed(format!(
            "v1 {key} must be an object"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_version_is_treated_as_v1() {
        assert_eq!(schema_version(&json!({"fields": {}})), Ok(1));
    }

    #[test]
    fn v1_fields_move_into_nested_layout() {
        let v1 = json!({
            "version": 1,
            "entityType": "account",
            "fields": {"health": "green", "arr": 120000},
            "overview": "Key logistics customer.",
            "notes": null,
            "customSections": [{"title": "Risks", "content": "Budget freeze"}],
            "enrichedAt": {"overview": "2026-01-02T03:04:05Z"},
            "x-legacy": 7
        });
        let (v2, from) = migrate(v1).unwrap();
        assert_eq!(from, 1);
        assert_eq!(v2["version"], 2);
        assert_eq!(v2["structured"]["health"], "green");
        assert_eq!(v2["narrative"]["overview"], "Key logistics customer.");
        assert!(v2["narrative"].get("notes").is_none());
        assert_eq!(v2["narrative"]["sections"][0]["title"], "Risks");
        assert_eq!(v2["enrichment"]["overview"], "2026-01-02T03:04:05Z");
        assert_eq!(v2["x-legacy"], 7);
        assert!(v2.get("fields").is_none());
    }

    #[test]
    fn current_version_passes_through_unchanged() {
        let v2 = json!({"version": 2, "entityType": "project", "structured": {}});
        let (out, from) = migrate(v2.clone()).unwrap();
        assert_eq!(from, 2);
        assert_eq!(out, v2);
    }

    #[test]
    fn future_version_fails_closed() {
        let err = migrate(json!({"version": 9})).unwrap_err();
        assert_eq!(err, MigrateError::Future(9));
        assert_eq!(
            err.to_string(),
            "schema version 9 is newer than supported version 2"
        );
    }

    #[test]
    fn nonsense_version_is_rejected() {
        assert!(matches!(
            migrate(json!({"version": "two"})),
            Err(MigrateError::BadVersion(_))
        ));
        assert!(matches!(
            migrate(json!({"version": 0})),
            Err(MigrateError::BadVersion(_))
        ));
        assert_eq!(migrate(json!([1, 2])), Err(MigrateError::NotAnObject));
    }

    #[test]
    fn malformed_v1_sections_are_rejected() {
        let err = migrate(json!({"version": 1, "customSections": "oops"})).unwrap_err();
        assert!(matches!(err, MigrateError::Malformed(_)));
    }
}

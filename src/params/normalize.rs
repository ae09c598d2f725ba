// Parameter Normalization
// Builds the canonical, sigil-insensitive ParameterSet for one execution request

use super::infer::{infer, infer_string};
use super::value::ParameterValue;
use crate::db::traits::DatabaseError;
use serde_json::Value;
use std::collections::HashMap;

/// Engine-neutral parameter sigil
pub const SIGIL: char = '@';

/// A caller-supplied parameter before typing.
///
/// JSON values go through type inference; already-typed values (the legacy
/// path for callers that build parameters in code) pass through unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum RawParameter {
    Json(Value),
    Typed(ParameterValue),
}

impl From<Value> for RawParameter {
    fn from(v: Value) -> Self {
        RawParameter::Json(v)
    }
}

impl From<ParameterValue> for RawParameter {
    fn from(v: ParameterValue) -> Self {
        RawParameter::Typed(v)
    }
}

/// Strip any leading sigils from a parameter name
pub fn strip_sigil(name: &str) -> &str {
    name.trim().trim_start_matches(SIGIL)
}

/// Canonical lookup key: sigil stripped, lower-cased
pub fn canonical_name(name: &str) -> String {
    strip_sigil(name).to_ascii_lowercase()
}

/// ASCII letters, digits and underscore only, non-empty
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterEntry {
    /// Name as supplied, without sigil
    pub name: String,
    value: ParameterValue,
    /// Caller's string when the value was inferred from one
    source: Option<String>,
}

impl ParameterEntry {
    pub fn new(name: &str, value: ParameterValue) -> Self {
        Self {
            name: strip_sigil(name).to_string(),
            value,
            source: None,
        }
    }

    /// Entry inferred from a caller string, remembering the exact text
    pub fn inferred(name: &str, value: ParameterValue, source: String) -> Self {
        Self {
            source: Some(source),
            ..Self::new(name, value)
        }
    }

    pub fn value(&self) -> &ParameterValue {
        &self.value
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Text to use where a string is required: the caller's original
    /// string when there was one, otherwise the value's text form
    pub fn text(&self) -> Option<String> {
        match &self.source {
            Some(source) => Some(source.clone()),
            None => self.value.to_text(),
        }
    }

    /// Replace the value; the original string no longer applies
    pub fn set_value(&mut self, value: ParameterValue) {
        self.value = value;
        self.source = None;
    }
}

/// Canonical parameter mapping for a single request.
///
/// Keys are compared case-insensitively and without sigil; each key is unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    entries: HashMap<String, ParameterEntry>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a parameter, validating its name
    pub fn insert(
        &mut self,
        name: &str,
        value: ParameterValue,
    ) -> Result<Option<ParameterValue>, DatabaseError> {
        self.insert_entry(ParameterEntry::new(name, value), name)
    }

    fn insert_entry(
        &mut self,
        entry: ParameterEntry,
        supplied: &str,
    ) -> Result<Option<ParameterValue>, DatabaseError> {
        if !is_valid_identifier(&entry.name) {
            return Err(DatabaseError::InvalidParameterName(supplied.to_string()));
        }
        let previous = self.entries.insert(entry.name.to_ascii_lowercase(), entry);
        Ok(previous.map(|entry| entry.value))
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.entries.get(&canonical_name(name)).map(|e| &e.value)
    }

    pub fn entry(&self, name: &str) -> Option<&ParameterEntry> {
        self.entries.get(&canonical_name(name))
    }

    pub fn entry_mut(&mut self, name: &str) -> Option<&mut ParameterEntry> {
        self.entries.get_mut(&canonical_name(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&canonical_name(name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate as (original name, value) in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.entries.values().map(|e| (e.name.as_str(), &e.value))
    }

    /// Parameter names sorted for stable log output
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.values().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Normalize caller parameters into a ParameterSet.
///
/// Later entries win when two names collapse to the same canonical key.
pub fn normalize<I, K>(params: I) -> Result<ParameterSet, DatabaseError>
where
    I: IntoIterator<Item = (K, RawParameter)>,
    K: AsRef<str>,
{
    let mut set = ParameterSet::new();
    for (name, raw) in params {
        let name = name.as_ref();
        let entry = match raw {
            RawParameter::Json(Value::String(text)) => {
                ParameterEntry::inferred(name, infer_string(&text), text)
            }
            RawParameter::Json(json) => ParameterEntry::new(name, infer(&json)),
            RawParameter::Typed(value) => ParameterEntry::new(name, value),
        };
        set.insert_entry(entry, name)?;
    }
    Ok(set)
}

/// Normalize a JSON object body (`{"@id": 1, "name": "x"}`).
///
/// `null` is treated as an empty parameter list; any other non-object fails.
pub fn normalize_json(body: Value) -> Result<ParameterSet, DatabaseError> {
    match body {
        Value::Null => Ok(ParameterSet::new()),
        Value::Object(map) => normalize(map.into_iter().map(|(k, v)| (k, RawParameter::Json(v)))),
        other => Err(DatabaseError::Conversion(format!(
            "expected a JSON object of parameters, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sigil_and_case_insensitive_lookup() {
        let set = normalize_json(json!({"@UserId": "42", "name": "Ana"})).unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.get("userid"), Some(&ParameterValue::Int(42)));
        assert_eq!(set.get("@USERID"), Some(&ParameterValue::Int(42)));
        assert_eq!(set.get("@name"), Some(&ParameterValue::Text("Ana".to_string())));
        assert!(set.contains("Name"));
    }

    #[test]
    fn test_original_name_kept_without_sigil() {
        let set = normalize_json(json!({"@UserId": 1})).unwrap();
        assert_eq!(set.names(), vec!["UserId"]);
    }

    #[test]
    fn test_invalid_names_rejected() {
        for bad in ["@", "user-id", "drop table", "naïve", ""] {
            let result = normalize(vec![(bad, RawParameter::Json(json!(1)))]);
            assert!(
                matches!(result, Err(DatabaseError::InvalidParameterName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_colliding_names_collapse_to_one_key() {
        let set = normalize(vec![
            ("@id", RawParameter::Json(json!(1))),
            ("ID", RawParameter::Json(json!(2))),
        ])
        .unwrap();

        assert_eq!(set.len(), 1);
        assert_eq!(set.get("id"), Some(&ParameterValue::Int(2)));
    }

    #[test]
    fn test_typed_values_pass_through() {
        let set = normalize(vec![(
            "code",
            RawParameter::Typed(ParameterValue::Text("0042".to_string())),
        )])
        .unwrap();
        assert_eq!(set.get("code"), Some(&ParameterValue::Text("0042".to_string())));
    }

    #[test]
    fn test_inferred_strings_keep_caller_text() {
        let set = normalize_json(json!({"code": "007", "fecha": "2024-01-05", "flag": "TRUE", "n": 7})).unwrap();

        let code = set.entry("code").unwrap();
        assert_eq!(code.value(), &ParameterValue::Int(7));
        assert_eq!(code.text().as_deref(), Some("007"));
        assert_eq!(set.entry("fecha").unwrap().text().as_deref(), Some("2024-01-05"));
        assert_eq!(set.entry("flag").unwrap().text().as_deref(), Some("TRUE"));

        // non-string JSON has no caller text to keep
        assert_eq!(set.entry("n").unwrap().source(), None);
        assert_eq!(set.entry("n").unwrap().text().as_deref(), Some("7"));
    }

    #[test]
    fn test_set_value_drops_source() {
        let mut set = normalize_json(json!({"pin": "0123"})).unwrap();
        let entry = set.entry_mut("pin").unwrap();
        entry.set_value(ParameterValue::Text("replaced".to_string()));
        assert_eq!(entry.source(), None);
        assert_eq!(entry.text().as_deref(), Some("replaced"));
    }

    #[test]
    fn test_non_object_body_rejected() {
        assert!(normalize_json(json!([1, 2])).is_err());
        assert!(normalize_json(Value::Null).unwrap().is_empty());
    }
}

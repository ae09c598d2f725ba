// Sensitive-Field Hashing
// One-way hashing of designated fields, top-level or nested inside JSON payload parameters

use super::normalize::{canonical_name, ParameterSet};
use super::value::ParameterValue;
use crate::db::traits::DatabaseError;
use serde_json::{Map, Value};

/// Default bcrypt cost factor
pub const DEFAULT_BCRYPT_COST: u32 = 10;

/// Prefixes of every bcrypt revision; a value starting with one is already hashed
pub const BCRYPT_PREFIXES: [&str; 4] = ["$2a$", "$2b$", "$2x$", "$2y$"];

/// Parameters that conventionally carry master/detail JSON documents.
///
/// Covers the `@Maestro`/`@Detalles` names used by SQL Server routines, the
/// `p_` prefixed names of PostgreSQL and MySQL routines, and their English
/// counterparts.
pub const PAYLOAD_PARAMETERS: &[&str] = &[
    "maestro",
    "detalles",
    "p_maestro",
    "p_detalles",
    "master",
    "details",
    "p_master",
    "p_details",
    "json",
    "p_json",
    "data",
    "p_data",
    "payload",
    "p_payload",
];

/// One-way hash scheme applied to sensitive fields
pub trait HashScheme: Send + Sync {
    /// Hash a plain-text value
    fn hash(&self, plain: &str) -> Result<String, DatabaseError>;

    /// True when the value already carries this scheme's recognizable prefix
    fn is_hashed(&self, value: &str) -> bool;
}

/// bcrypt with a fixed cost
#[derive(Debug, Clone)]
pub struct BcryptScheme {
    cost: u32,
}

impl BcryptScheme {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }
}

impl Default for BcryptScheme {
    fn default() -> Self {
        Self::new(DEFAULT_BCRYPT_COST)
    }
}

impl HashScheme for BcryptScheme {
    fn hash(&self, plain: &str) -> Result<String, DatabaseError> {
        bcrypt::hash(plain, self.cost).map_err(|e| DatabaseError::Hashing(e.to_string()))
    }

    fn is_hashed(&self, value: &str) -> bool {
        BCRYPT_PREFIXES.iter().any(|prefix| value.starts_with(prefix))
    }
}

/// Field names designated for hashing, compared without sigil and case-insensitively
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensitiveFieldSpec {
    fields: Vec<String>,
}

impl SensitiveFieldSpec {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut canonical: Vec<String> = Vec::new();
        for field in fields {
            let name = canonical_name(field.as_ref());
            if !name.is_empty() && !canonical.contains(&name) {
                canonical.push(name);
            }
        }
        Self { fields: canonical }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    fn matches(&self, key: &str) -> bool {
        let key = canonical_name(key);
        self.fields.iter().any(|f| *f == key)
    }
}

/// Apply one-way hashing to every designated field.
///
/// A field present as a top-level parameter is hashed there. Fields that are
/// not top-level parameters are looked up inside the well-known payload
/// parameters (a JSON object, or an array of objects). Payloads that are not
/// valid JSON are skipped. Values already hashed are left byte-identical.
pub fn apply_hashing(
    mut params: ParameterSet,
    spec: &SensitiveFieldSpec,
    scheme: &dyn HashScheme,
) -> Result<ParameterSet, DatabaseError> {
    let mut nested = Vec::new();

    for field in spec.fields() {
        match params.entry_mut(field) {
            Some(entry) => {
                if let Some(hashed) = hash_scalar(entry.text(), scheme)? {
                    tracing::debug!(field = %field, "hashed top-level sensitive parameter");
                    entry.set_value(ParameterValue::Text(hashed));
                }
            }
            None => nested.push(field.clone()),
        }
    }

    if nested.is_empty() {
        return Ok(params);
    }
    let nested = SensitiveFieldSpec { fields: nested };

    for payload in PAYLOAD_PARAMETERS {
        let Some(entry) = params.entry_mut(payload) else {
            continue;
        };
        let is_json = matches!(entry.value(), ParameterValue::Json(_));
        let Some(text) = entry.value().as_str().map(str::to_string) else {
            continue;
        };

        match hash_payload(payload, &text, &nested, scheme) {
            Ok(Some(rewritten)) => {
                tracing::debug!(parameter = %payload, "hashed sensitive fields inside payload");
                entry.set_value(if is_json {
                    ParameterValue::Json(rewritten)
                } else {
                    ParameterValue::Text(rewritten)
                });
            }
            Ok(None) => {}
            Err(DatabaseError::MalformedJsonPayload { parameter, reason }) => {
                tracing::warn!(parameter = %parameter, reason = %reason, "skipping malformed JSON payload");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(params)
}

/// Hash a top-level value's text; `None` when null or already hashed
fn hash_scalar(
    text: Option<String>,
    scheme: &dyn HashScheme,
) -> Result<Option<String>, DatabaseError> {
    let Some(text) = text else {
        return Ok(None);
    };
    if scheme.is_hashed(&text) {
        return Ok(None);
    }
    scheme.hash(&text).map(Some)
}

/// Rewrite one payload document, returning the new text only if something changed
fn hash_payload(
    parameter: &str,
    text: &str,
    spec: &SensitiveFieldSpec,
    scheme: &dyn HashScheme,
) -> Result<Option<String>, DatabaseError> {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return Ok(None);
    }

    let mut document: Value =
        serde_json::from_str(text).map_err(|e| DatabaseError::MalformedJsonPayload {
            parameter: parameter.to_string(),
            reason: e.to_string(),
        })?;

    let modified = match &mut document {
        Value::Object(object) => hash_object(object, spec, scheme)?,
        Value::Array(items) => {
            let mut any = false;
            for item in items.iter_mut() {
                if let Value::Object(object) = item {
                    any |= hash_object(object, spec, scheme)?;
                }
            }
            any
        }
        _ => false,
    };

    if !modified {
        return Ok(None);
    }
    serde_json::to_string(&document)
        .map(Some)
        .map_err(|e| DatabaseError::Conversion(e.to_string()))
}

/// Hash matching keys of a single JSON object in place
fn hash_object(
    object: &mut Map<String, Value>,
    spec: &SensitiveFieldSpec,
    scheme: &dyn HashScheme,
) -> Result<bool, DatabaseError> {
    let mut modified = false;
    for (key, value) in object.iter_mut() {
        if !spec.matches(key) {
            continue;
        }
        let plain = match value {
            Value::String(s) if !s.trim().is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        if scheme.is_hashed(&plain) {
            continue;
        }
        *value = Value::String(scheme.hash(&plain)?);
        modified = true;
    }
    Ok(modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::normalize::normalize_json;
    use serde_json::json;

    fn scheme() -> BcryptScheme {
        BcryptScheme::new(4)
    }

    fn payload(params: &ParameterSet, name: &str) -> Value {
        serde_json::from_str(params.get(name).and_then(|v| v.as_str()).unwrap()).unwrap()
    }

    #[test]
    fn test_top_level_field_hashed() {
        let params = normalize_json(json!({"@usuario": "ana", "@password": "secret123"})).unwrap();
        let spec = SensitiveFieldSpec::new(["@Password"]);

        let hashed = apply_hashing(params, &spec, &scheme()).unwrap();

        let value = hashed.get("password").and_then(|v| v.as_str()).unwrap();
        assert!(value.starts_with("$2b$"));
        assert!(bcrypt::verify("secret123", value).unwrap());
        assert_eq!(hashed.get("usuario"), Some(&ParameterValue::Text("ana".to_string())));
    }

    #[test]
    fn test_numeric_password_is_stringified() {
        let params = normalize_json(json!({"clave": 123456})).unwrap();
        let hashed = apply_hashing(params, &SensitiveFieldSpec::new(["clave"]), &scheme()).unwrap();

        let value = hashed.get("clave").and_then(|v| v.as_str()).unwrap();
        assert!(bcrypt::verify("123456", value).unwrap());
    }

    #[test]
    fn test_hash_covers_exact_caller_string() {
        let params = normalize_json(json!({
            "pin": "0123",
            "fecha": "2024-01-05",
            "flag": "TRUE",
            "phone": "+57300",
            "amount": "1.50"
        }))
        .unwrap();
        let spec = SensitiveFieldSpec::new(["pin", "fecha", "flag", "phone", "amount"]);

        let hashed = apply_hashing(params, &spec, &scheme()).unwrap();

        for (field, original) in [
            ("pin", "0123"),
            ("fecha", "2024-01-05"),
            ("flag", "TRUE"),
            ("phone", "+57300"),
            ("amount", "1.50"),
        ] {
            let value = hashed.get(field).and_then(|v| v.as_str()).unwrap();
            assert!(bcrypt::verify(original, value).unwrap(), "{field} should verify against {original:?}");
        }
    }

    #[test]
    fn test_null_field_untouched() {
        let params = normalize_json(json!({"password": null})).unwrap();
        let hashed = apply_hashing(params, &SensitiveFieldSpec::new(["password"]), &scheme()).unwrap();
        assert_eq!(hashed.get("password"), Some(&ParameterValue::Null));
    }

    #[test]
    fn test_object_payload_hashed_in_place() {
        let params = normalize_json(json!({
            "@p_maestro": r#"{"email":"a@b.com","password":"secret123"}"#
        }))
        .unwrap();
        let spec = SensitiveFieldSpec::new(["password"]);

        let hashed = apply_hashing(params, &spec, &scheme()).unwrap();
        let doc = payload(&hashed, "p_maestro");

        assert_eq!(doc["email"], "a@b.com");
        let password = doc["password"].as_str().unwrap();
        assert!(password.starts_with("$2b$"));
        assert!(bcrypt::verify("secret123", password).unwrap());
        // key order survives re-serialization
        let keys: Vec<&String> = doc.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["email", "password"]);
    }

    #[test]
    fn test_array_payload_hashes_each_element() {
        let params = normalize_json(json!({
            "@p_detalles": r#"[{"clave":"x"},{"clave":"y"},{"nombre":"sin clave"}]"#
        }))
        .unwrap();

        let hashed = apply_hashing(params, &SensitiveFieldSpec::new(["clave"]), &scheme()).unwrap();
        let doc = payload(&hashed, "p_detalles");

        assert!(bcrypt::verify("x", doc[0]["clave"].as_str().unwrap()).unwrap());
        assert!(bcrypt::verify("y", doc[1]["clave"].as_str().unwrap()).unwrap());
        assert_eq!(doc[2], json!({"nombre": "sin clave"}));
    }

    #[test]
    fn test_json_valued_payload_keeps_json_variant() {
        let params = normalize_json(json!({"detalles": [{"password": "abc"}]})).unwrap();
        let hashed = apply_hashing(params, &SensitiveFieldSpec::new(["password"]), &scheme()).unwrap();
        assert!(matches!(hashed.get("detalles"), Some(ParameterValue::Json(_))));
    }

    #[test]
    fn test_payload_without_field_is_unchanged() {
        let original = r#"{ "email" : "a@b.com" }"#;
        let params = normalize_json(json!({"maestro": original})).unwrap();

        let hashed = apply_hashing(params, &SensitiveFieldSpec::new(["password"]), &scheme()).unwrap();

        assert_eq!(hashed.get("maestro").and_then(|v| v.as_str()), Some(original));
    }

    #[test]
    fn test_malformed_payload_is_skipped() {
        let params = normalize_json(json!({
            "p_maestro": "{not json",
            "p_detalles": r#"[{"password":"ok"}]"#
        }))
        .unwrap();

        let hashed = apply_hashing(params, &SensitiveFieldSpec::new(["password"]), &scheme()).unwrap();

        assert_eq!(hashed.get("p_maestro").and_then(|v| v.as_str()), Some("{not json"));
        let doc = payload(&hashed, "p_detalles");
        assert!(doc[0]["password"].as_str().unwrap().starts_with("$2"));
    }

    #[test]
    fn test_hashing_is_idempotent() {
        let params = normalize_json(json!({
            "password": "secret",
            "p_maestro": r#"{"password":"secret"}"#
        }))
        .unwrap();
        let spec = SensitiveFieldSpec::new(["password"]);

        let once = apply_hashing(params, &spec, &scheme()).unwrap();
        let twice = apply_hashing(once.clone(), &spec, &scheme()).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_top_level_field_shadows_payload() {
        let params = normalize_json(json!({
            "password": "top",
            "p_maestro": r#"{"password":"nested"}"#
        }))
        .unwrap();

        let hashed = apply_hashing(params, &SensitiveFieldSpec::new(["password"]), &scheme()).unwrap();

        assert_eq!(payload(&hashed, "p_maestro")["password"], "nested");
    }

    #[test]
    fn test_spec_deduplicates_names() {
        let spec = SensitiveFieldSpec::new(["@Password", "password", "", "clave"]);
        assert_eq!(spec.fields(), &["password".to_string(), "clave".to_string()]);
    }
}

// Parameter Values
// Tagged scalar produced by type inference and consumed by every binding stage

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// A single typed parameter value.
///
/// `Json` holds the serialized text of a JSON array or object. It is never
/// decomposed at this layer; engines receive it as an opaque JSON document.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Float(f64),
    Decimal(Decimal),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Uuid(Uuid),
    Text(String),
    Json(String),
}

impl ParameterValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ParameterValue::Null)
    }

    /// Short type label used in logs and conversion errors
    pub fn kind(&self) -> &'static str {
        match self {
            ParameterValue::Null => "null",
            ParameterValue::Bool(_) => "boolean",
            ParameterValue::Int(_) => "int32",
            ParameterValue::BigInt(_) => "int64",
            ParameterValue::Float(_) => "float",
            ParameterValue::Decimal(_) => "decimal",
            ParameterValue::DateTime(_) => "datetime",
            ParameterValue::Date(_) => "date",
            ParameterValue::Uuid(_) => "uuid",
            ParameterValue::Text(_) => "text",
            ParameterValue::Json(_) => "json",
        }
    }

    /// String form of the value, `None` for null.
    ///
    /// Date/times use ISO-8601 so the text re-infers to the same value.
    pub fn to_text(&self) -> Option<String> {
        match self {
            ParameterValue::Null => None,
            ParameterValue::Bool(b) => Some(b.to_string()),
            ParameterValue::Int(v) => Some(v.to_string()),
            ParameterValue::BigInt(v) => Some(v.to_string()),
            ParameterValue::Float(v) => Some(v.to_string()),
            ParameterValue::Decimal(d) => Some(d.to_string()),
            ParameterValue::DateTime(dt) => Some(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            ParameterValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            ParameterValue::Uuid(u) => Some(u.to_string()),
            ParameterValue::Text(s) | ParameterValue::Json(s) => Some(s.clone()),
        }
    }

    /// Borrow the text of `Text` and `Json` values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::Text(s) | ParameterValue::Json(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => write!(f, "{}", text),
            None => write!(f, "NULL"),
        }
    }
}

impl Serialize for ParameterValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ParameterValue::Null => serializer.serialize_none(),
            ParameterValue::Bool(b) => serializer.serialize_bool(*b),
            ParameterValue::Int(v) => serializer.serialize_i32(*v),
            ParameterValue::BigInt(v) => serializer.serialize_i64(*v),
            ParameterValue::Float(v) => serializer.serialize_f64(*v),
            ParameterValue::Json(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(value) => value.serialize(serializer),
                Err(_) => serializer.serialize_str(raw),
            },
            other => match other.to_text() {
                Some(text) => serializer.serialize_str(&text),
                None => serializer.serialize_none(),
            },
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        ParameterValue::Bool(v)
    }
}

impl From<i32> for ParameterValue {
    fn from(v: i32) -> Self {
        ParameterValue::Int(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::BigInt(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Float(v)
    }
}

impl From<Decimal> for ParameterValue {
    fn from(v: Decimal) -> Self {
        ParameterValue::Decimal(v)
    }
}

impl From<NaiveDateTime> for ParameterValue {
    fn from(v: NaiveDateTime) -> Self {
        ParameterValue::DateTime(v)
    }
}

impl From<NaiveDate> for ParameterValue {
    fn from(v: NaiveDate) -> Self {
        ParameterValue::Date(v)
    }
}

impl From<Uuid> for ParameterValue {
    fn from(v: Uuid) -> Self {
        ParameterValue::Uuid(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::Text(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        ParameterValue::Text(v)
    }
}

impl<T: Into<ParameterValue>> From<Option<T>> for ParameterValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ParameterValue::Null)
    }
}

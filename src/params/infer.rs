// Type Inference
// Converts an untyped JSON scalar into the most specific ParameterValue it parses as

use super::value::ParameterValue;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde_json::{Number, Value};
use std::str::FromStr;
use uuid::Uuid;

/// Date/time layouts tried in order for string values
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Infer a typed value from a decoded JSON value.
///
/// Never fails: a candidate type that does not parse falls through to the next
/// one, and strings that match nothing stay text.
pub fn infer(raw: &Value) -> ParameterValue {
    match raw {
        Value::Null => ParameterValue::Null,
        Value::Bool(b) => ParameterValue::Bool(*b),
        Value::Number(n) => infer_number(n),
        Value::String(s) => infer_string(s),
        Value::Array(_) | Value::Object(_) => ParameterValue::Json(raw.to_string()),
    }
}

/// int32, then int64, then exact wide integer, then floating point
fn infer_number(n: &Number) -> ParameterValue {
    if let Some(v) = n.as_i64() {
        return match i32::try_from(v) {
            Ok(small) => ParameterValue::Int(small),
            Err(_) => ParameterValue::BigInt(v),
        };
    }
    if n.is_u64() {
        return wide_integer(&n.to_string());
    }
    match n.as_f64() {
        Some(f) => ParameterValue::Float(f),
        None => ParameterValue::Text(n.to_string()),
    }
}

/// Integers beyond i64: an exact decimal when one fits, otherwise the digits as text
fn wide_integer(digits: &str) -> ParameterValue {
    Decimal::from_str(digits)
        .map(ParameterValue::Decimal)
        .unwrap_or_else(|_| ParameterValue::Text(digits.to_string()))
}

fn is_integer_literal(s: &str) -> bool {
    let digits = s.strip_prefix(|c: char| c == '-' || c == '+').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// date/time, int32, int64, float, boolean, uuid, then text
pub fn infer_string(s: &str) -> ParameterValue {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return ParameterValue::Text(s.to_string());
    }

    if let Some(dt) = parse_datetime(trimmed) {
        return ParameterValue::DateTime(dt);
    }
    if let Ok(v) = trimmed.parse::<i32>() {
        return ParameterValue::Int(v);
    }
    if let Ok(v) = trimmed.parse::<i64>() {
        return ParameterValue::BigInt(v);
    }
    if is_integer_literal(trimmed) {
        return wide_integer(trimmed);
    }
    if let Some(f) = parse_float(trimmed) {
        return ParameterValue::Float(f);
    }
    if trimmed.eq_ignore_ascii_case("true") {
        return ParameterValue::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return ParameterValue::Bool(false);
    }
    if let Ok(u) = Uuid::parse_str(trimmed) {
        return ParameterValue::Uuid(u);
    }

    ParameterValue::Text(s.to_string())
}

/// Parse the date/time forms callers send from JSON.
///
/// A bare date yields midnight of that day; offsets are normalized to UTC.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Finite floats only; `f64::from_str` also accepts "inf" and "NaN"
fn parse_float(s: &str) -> Option<f64> {
    let starts_numeric = s
        .chars()
        .next()
        .map(|c| c.is_ascii_digit() || c == '-' || c == '+' || c == '.')
        .unwrap_or(false);
    if !starts_numeric {
        return None;
    }
    s.parse::<f64>().ok().filter(|f| f.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_scalars() {
        assert_eq!(infer(&Value::Null), ParameterValue::Null);
        assert_eq!(infer(&json!(true)), ParameterValue::Bool(true));
        assert_eq!(infer(&json!(7)), ParameterValue::Int(7));
        assert_eq!(infer(&json!(5_000_000_000i64)), ParameterValue::BigInt(5_000_000_000));
        assert_eq!(infer(&json!(2.5)), ParameterValue::Float(2.5));
    }

    #[test]
    fn test_integer_strings_never_become_floats() {
        assert_eq!(infer(&json!("42")), ParameterValue::Int(42));
        assert_eq!(infer(&json!("-17")), ParameterValue::Int(-17));
        assert_eq!(infer(&json!("9000000000")), ParameterValue::BigInt(9_000_000_000));
        assert_eq!(infer(&json!("3.75")), ParameterValue::Float(3.75));
    }

    #[test]
    fn test_wide_integers_stay_exact() {
        assert_eq!(
            infer(&json!(u64::MAX)),
            ParameterValue::Decimal(Decimal::from(u64::MAX))
        );
        assert_eq!(
            infer(&json!("18446744073709551616")),
            ParameterValue::Decimal(Decimal::from_str("18446744073709551616").unwrap())
        );

        // wider than any decimal
        let huge = "123456789012345678901234567890123";
        assert_eq!(infer(&json!(huge)), ParameterValue::Text(huge.to_string()));
    }

    #[test]
    fn test_string_precedence() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(infer(&json!("2024-01-05")), ParameterValue::DateTime(expected));
        assert_eq!(infer(&json!("TRUE")), ParameterValue::Bool(true));

        let id = "6f9619ff-8b86-d011-b42d-00c04fc964ff";
        assert_eq!(
            infer(&json!(id)),
            ParameterValue::Uuid(Uuid::parse_str(id).unwrap())
        );
        assert_eq!(infer(&json!("hello")), ParameterValue::Text("hello".to_string()));
    }

    #[test]
    fn test_datetime_with_offset_normalizes_to_utc() {
        let value = infer(&json!("2024-06-01T10:30:00-05:00"));
        let expected = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(15, 30, 0)
            .unwrap();
        assert_eq!(value, ParameterValue::DateTime(expected));
    }

    #[test]
    fn test_blank_strings_stay_text() {
        assert_eq!(infer(&json!("")), ParameterValue::Text(String::new()));
        assert_eq!(infer(&json!("   ")), ParameterValue::Text("   ".to_string()));
    }

    #[test]
    fn test_non_finite_words_stay_text() {
        assert_eq!(infer(&json!("NaN")), ParameterValue::Text("NaN".to_string()));
        assert_eq!(infer(&json!("inf")), ParameterValue::Text("inf".to_string()));
    }

    #[test]
    fn test_containers_kept_verbatim() {
        assert_eq!(
            infer(&json!({"a": 1, "b": [1, 2]})),
            ParameterValue::Json(r#"{"a":1,"b":[1,2]}"#.to_string())
        );
        assert_eq!(infer(&json!([])), ParameterValue::Json("[]".to_string()));
    }
}

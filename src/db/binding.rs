// Parameter Binding (shared rules)
// Declared-type classification, JSON detection, value coercion and the CallPlan every driver executes

use crate::db::routine::RoutineParameter;
use crate::params::normalize::{canonical_name, ParameterEntry, SIGIL};
use crate::params::{ParameterSet, ParameterValue};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Name fragments that conventionally carry JSON documents
pub const JSON_CARRIER_NAMES: &[&str] = &["roles", "detalles", "details", "json", "data"];

/// Broad family of a declared engine type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Text { unbounded: bool },
    Json,
    Integer,
    Decimal,
    Float,
    Boolean,
    Date,
    DateTime,
    Time,
    Uuid,
    Binary,
    Other,
}

impl TypeFamily {
    /// Classify an engine type name (`nvarchar`, `character varying(40)`, `jsonb`...)
    pub fn classify(data_type: &str, max_length: Option<i64>) -> Self {
        let lowered = data_type.trim().to_ascii_lowercase();
        let base = lowered.split('(').next().unwrap_or("").trim();

        match base {
            "json" | "jsonb" => TypeFamily::Json,
            "text" | "ntext" | "mediumtext" | "longtext" | "citext" => {
                TypeFamily::Text { unbounded: true }
            }
            "char" | "nchar" | "varchar" | "nvarchar" | "tinytext" | "character"
            | "character varying" | "bpchar" | "name" | "sysname" | "enum" | "set" => {
                TypeFamily::Text {
                    unbounded: max_length == Some(-1) || lowered.contains("(max)"),
                }
            }
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "int2"
            | "int4" | "int8" | "smallserial" | "serial" | "bigserial" | "year" => {
                TypeFamily::Integer
            }
            "decimal" | "numeric" | "money" | "smallmoney" => TypeFamily::Decimal,
            "float" | "real" | "double" | "double precision" | "float4" | "float8" => {
                TypeFamily::Float
            }
            "bit" | "bool" | "boolean" => TypeFamily::Boolean,
            "date" => TypeFamily::Date,
            "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset" | "timestamp"
            | "timestamptz" | "timestamp without time zone" | "timestamp with time zone" => {
                TypeFamily::DateTime
            }
            "time" | "timetz" | "time without time zone" | "time with time zone" => {
                TypeFamily::Time
            }
            "uniqueidentifier" | "uuid" => TypeFamily::Uuid,
            "binary" | "varbinary" | "image" | "bytea" | "blob" | "tinyblob" | "mediumblob"
            | "longblob" => TypeFamily::Binary,
            _ => TypeFamily::Other,
        }
    }

    pub fn of(param: &RoutineParameter) -> Self {
        Self::classify(&param.data_type, param.max_length)
    }
}

/// Which heuristic decided a value should travel as JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonSignal {
    /// Declared json/jsonb or unbounded text type
    DeclaredType,
    /// Conventional carrier name and a value that parses as a JSON container
    CarrierName,
    /// Value is a JSON container, or text starting with `{` or `[`
    ValueShape,
}

/// Decide whether a value is bound as the engine's native JSON type.
///
/// All three detection paths are kept; the first that fires is reported.
pub fn detect_json(
    name: &str,
    family: Option<TypeFamily>,
    value: &ParameterValue,
) -> Option<JsonSignal> {
    if value.is_null() {
        return None;
    }
    if matches!(family, Some(TypeFamily::Json) | Some(TypeFamily::Text { unbounded: true })) {
        return Some(JsonSignal::DeclaredType);
    }

    let lowered = canonical_name(name);
    let carrier = JSON_CARRIER_NAMES.iter().any(|c| lowered.contains(c));
    if carrier && looks_like_json(value) {
        return Some(JsonSignal::CarrierName);
    }

    match value {
        ParameterValue::Json(_) => Some(JsonSignal::ValueShape),
        ParameterValue::Text(s) => {
            let trimmed = s.trim_start();
            (trimmed.starts_with('{') || trimmed.starts_with('[')).then_some(JsonSignal::ValueShape)
        }
        _ => None,
    }
}

/// True when the value parses as a JSON object or array
pub fn looks_like_json(value: &ParameterValue) -> bool {
    match value {
        ParameterValue::Json(_) => true,
        ParameterValue::Text(s) => matches!(
            serde_json::from_str::<serde_json::Value>(s),
            Ok(serde_json::Value::Object(_)) | Ok(serde_json::Value::Array(_))
        ),
        _ => false,
    }
}

/// A parameter ready for a driver: final value plus the declared family if known
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParameter {
    pub name: String,
    pub value: ParameterValue,
    pub family: Option<TypeFamily>,
}

impl BoundParameter {
    pub fn new(name: &str, value: ParameterValue, family: Option<TypeFamily>) -> Self {
        Self {
            name: name.to_string(),
            value,
            family,
        }
    }
}

/// Apply the cross-engine binding rules to a declared routine parameter.
///
/// Absent inputs bind as null; required parameters without a default are left
/// for the engine to reject.
pub fn bind_declared(param: &RoutineParameter, entry: Option<&ParameterEntry>) -> BoundParameter {
    let family = TypeFamily::of(param);
    let (value, text) = match entry {
        Some(entry) => (entry.value().clone(), entry.text()),
        None => (ParameterValue::Null, None),
    };
    let bound = coerce_declared(&param.name, family, value, text);
    BoundParameter::new(&param.name, bound, Some(family))
}

/// Bind a parameter referenced from ad-hoc SQL, where no declared type exists
pub fn bind_untyped(name: &str, value: &ParameterValue) -> BoundParameter {
    let bound = match detect_json(name, None, value) {
        Some(_) => ParameterValue::Json(value.to_text().unwrap_or_default()),
        None => value.clone(),
    };
    BoundParameter::new(name, bound, None)
}

/// `text` is the caller's exact string when there was one, else the value's text form
fn coerce_declared(
    name: &str,
    family: TypeFamily,
    value: ParameterValue,
    text: Option<String>,
) -> ParameterValue {
    if value.is_null() {
        return value;
    }
    if let Some(signal) = detect_json(name, Some(family), &value) {
        tracing::trace!(parameter = %name, ?signal, "binding as JSON");
        return ParameterValue::Json(text.unwrap_or_default());
    }

    match (family, value) {
        // textual parameters always receive text, e.g. a password sent as a number
        (TypeFamily::Text { .. }, _) => ParameterValue::Text(text.unwrap_or_default()),
        (TypeFamily::Date, ParameterValue::DateTime(dt)) if dt.time() == chrono::NaiveTime::MIN => {
            ParameterValue::Date(dt.date())
        }
        (TypeFamily::DateTime, ParameterValue::Date(d)) => {
            ParameterValue::DateTime(d.and_time(chrono::NaiveTime::MIN))
        }
        (TypeFamily::Decimal, value) => to_decimal(&value).map(ParameterValue::Decimal).unwrap_or(value),
        (TypeFamily::Boolean, ParameterValue::Int(v)) => ParameterValue::Bool(v != 0),
        (TypeFamily::Boolean, ParameterValue::BigInt(v)) => ParameterValue::Bool(v != 0),
        (TypeFamily::Integer, ParameterValue::Bool(b)) => ParameterValue::Int(b as i32),
        (TypeFamily::Uuid, ParameterValue::Text(s)) => match Uuid::parse_str(s.trim()) {
            Ok(u) => ParameterValue::Uuid(u),
            Err(_) => ParameterValue::Text(s),
        },
        (_, value) => value,
    }
}

fn to_decimal(value: &ParameterValue) -> Option<Decimal> {
    match value {
        ParameterValue::Decimal(d) => Some(*d),
        ParameterValue::Int(v) => Some(Decimal::from(*v)),
        ParameterValue::BigInt(v) => Some(Decimal::from(*v)),
        ParameterValue::Float(f) => Decimal::from_f64(*f),
        ParameterValue::Text(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// How the driver consumes the call's result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Read and materialize rows
    Rows,
    /// Fire-and-forget; only an affected-row count is reported
    Execute,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStatement {
    pub sql: String,
    pub parameters: Vec<BoundParameter>,
}

impl PlannedStatement {
    pub fn new(sql: String, parameters: Vec<BoundParameter>) -> Self {
        Self { sql, parameters }
    }
}

/// An output/in-out parameter harvested after execution
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBinding {
    /// Declared parameter name, used as the result column name
    pub parameter: String,
    /// Batch or session variable that receives the value
    pub variable: String,
    pub data_type: String,
}

/// Everything a driver needs to execute one call
#[derive(Debug, Clone, PartialEq)]
pub struct CallPlan {
    /// Statements run before the call (MySQL session variables)
    pub setup: Vec<PlannedStatement>,
    pub call: PlannedStatement,
    /// Statement that reads output variables back, when the engine needs one
    pub harvest: Option<PlannedStatement>,
    pub outputs: Vec<OutputBinding>,
    pub fetch: FetchMode,
}

impl CallPlan {
    pub fn single(sql: String, parameters: Vec<BoundParameter>, fetch: FetchMode) -> Self {
        Self {
            setup: Vec::new(),
            call: PlannedStatement::new(sql, parameters),
            harvest: None,
            outputs: Vec::new(),
            fetch,
        }
    }
}

/// Variable name holding an output parameter's value
pub fn output_variable(parameter: &str) -> String {
    format!("__out_{}", parameter)
}

/// Native placeholder syntax of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `@P1`, one per distinct name (SQL Server)
    AtPositional,
    /// `$1`, one per distinct name (PostgreSQL)
    Dollar,
    /// `?`, one per occurrence (MySQL)
    Question,
}

impl PlaceholderStyle {
    pub fn render(&self, index: usize) -> String {
        match self {
            PlaceholderStyle::AtPositional => format!("@P{}", index),
            PlaceholderStyle::Dollar => format!("${}", index),
            PlaceholderStyle::Question => "?".to_string(),
        }
    }
}

/// Rewrite `@name` placeholders of ad-hoc SQL into the engine's native form.
///
/// Only names present in `params` are rewritten. Quoted literals, quoted
/// identifiers (brackets on SQL Server only), comments and `@@` system
/// variables are copied verbatim.
pub fn rewrite_placeholders(
    sql: &str,
    params: &ParameterSet,
    style: PlaceholderStyle,
) -> (String, Vec<BoundParameter>) {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut bound: Vec<BoundParameter> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();

        match ch {
            '\'' | '"' | '`' => {
                let end = find_closing(&chars, i + 1, ch);
                out.extend(&chars[i..end]);
                i = end;
            }
            '[' if style == PlaceholderStyle::AtPositional => {
                let end = find_closing(&chars, i + 1, ']');
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if next == Some('-') => {
                let end = chars[i..].iter().position(|&c| c == '\n').map(|p| i + p).unwrap_or(chars.len());
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if next == Some('*') => {
                let end = find_block_comment_end(&chars, i + 2);
                out.extend(&chars[i..end]);
                i = end;
            }
            c if c == SIGIL && next == Some(SIGIL) => {
                let end = identifier_end(&chars, i + 2);
                out.extend(&chars[i..end]);
                i = end;
            }
            c if c == SIGIL => {
                let end = identifier_end(&chars, i + 1);
                let name: String = chars[i + 1..end].iter().collect();
                match params.get(&name) {
                    Some(value) if !name.is_empty() => {
                        let key = canonical_name(&name);
                        let index = match style {
                            PlaceholderStyle::Question => {
                                bound.push(bind_untyped(&name, value));
                                bound.len()
                            }
                            _ => match positions.get(&key) {
                                Some(&index) => index,
                                None => {
                                    bound.push(bind_untyped(&name, value));
                                    positions.insert(key, bound.len());
                                    bound.len()
                                }
                            },
                        };
                        out.push_str(&style.render(index));
                    }
                    _ => out.extend(&chars[i..end]),
                }
                i = end;
            }
            _ => {
                out.push(ch);
                i += 1;
            }
        }
    }

    (out, bound)
}

/// Index just past the closing quote; doubled quotes are escapes
fn find_closing(chars: &[char], mut i: usize, close: char) -> usize {
    while i < chars.len() {
        if chars[i] == close {
            if chars.get(i + 1) == Some(&close) && close != ']' {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn find_block_comment_end(chars: &[char], mut i: usize) -> usize {
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

fn identifier_end(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
        i += 1;
    }
    i
}

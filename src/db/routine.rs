// Routine Metadata
// Routine names, catalog descriptors and the schema search order shared by every driver

use crate::db::traits::DatabaseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Routine name as requested by the caller, optionally schema-qualified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineName {
    pub schema: Option<String>,
    pub name: String,
}

impl RoutineName {
    /// Parse `routine`, `schema.routine` or bracketed/quoted forms such as
    /// `[dbo].[usp_login]` and `"ventas"."actualizar"`.
    pub fn parse(input: &str) -> Result<Self, DatabaseError> {
        let trimmed = input.trim();
        let parts: Vec<&str> = trimmed.split('.').map(unquote_identifier).collect();

        let (schema, name) = match parts.as_slice() {
            [name] => (None, *name),
            [schema, name] => (Some(*schema), *name),
            _ => return Err(DatabaseError::RoutineNotFound(input.to_string())),
        };

        if name.is_empty() || schema.map(str::is_empty).unwrap_or(false) {
            return Err(DatabaseError::RoutineNotFound(input.to_string()));
        }

        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for RoutineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

fn unquote_identifier(part: &str) -> &str {
    let part = part.trim();
    part.strip_prefix('[')
        .and_then(|p| p.strip_suffix(']'))
        .or_else(|| part.strip_prefix('"').and_then(|p| p.strip_suffix('"')))
        .or_else(|| part.strip_prefix('`').and_then(|p| p.strip_suffix('`')))
        .unwrap_or(part)
}

/// Function or procedure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoutineKind {
    Function,
    Procedure,
}

impl RoutineKind {
    /// Map a catalog ROUTINE_TYPE value
    pub fn from_catalog(routine_type: &str) -> Self {
        if routine_type.trim().eq_ignore_ascii_case("PROCEDURE") {
            RoutineKind::Procedure
        } else {
            RoutineKind::Function
        }
    }
}

/// Parameter direction as reported by PARAMETER_MODE
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ParameterDirection {
    In,
    Out,
    InOut,
}

impl ParameterDirection {
    pub fn from_catalog(mode: Option<&str>) -> Self {
        match mode.map(|m| m.trim().to_ascii_uppercase()).as_deref() {
            Some("OUT") => ParameterDirection::Out,
            Some("INOUT") => ParameterDirection::InOut,
            _ => ParameterDirection::In,
        }
    }

    /// Receives a value from the caller
    pub fn is_input(&self) -> bool {
        matches!(self, ParameterDirection::In | ParameterDirection::InOut)
    }

    /// Returns a value to the caller
    pub fn is_output(&self) -> bool {
        matches!(self, ParameterDirection::Out | ParameterDirection::InOut)
    }
}

/// Declared routine parameter, fetched fresh from the catalog on every call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutineParameter {
    /// Name without sigil
    pub name: String,
    pub direction: ParameterDirection,
    /// Engine type name, e.g. `nvarchar`, `jsonb`, `longtext`
    pub data_type: String,
    /// Character length; `-1` is SQL Server's `max`
    pub max_length: Option<i64>,
    pub precision: Option<i64>,
    pub scale: Option<i64>,
    pub ordinal_position: i32,
}

impl RoutineParameter {
    pub fn new(name: &str, direction: ParameterDirection, data_type: &str, ordinal_position: i32) -> Self {
        Self {
            name: name.trim_start_matches('@').to_string(),
            direction,
            data_type: data_type.to_string(),
            max_length: None,
            precision: None,
            scale: None,
            ordinal_position,
        }
    }
}

/// A resolved routine with its ordered parameter metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutineDescriptor {
    pub schema: Option<String>,
    pub name: String,
    pub kind: RoutineKind,
    /// Function returns a table (SQL Server TVF, PostgreSQL set-returning)
    pub returns_table: bool,
    pub parameters: Vec<RoutineParameter>,
}

impl RoutineDescriptor {
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }

    /// Parameters sorted by declared ordinal position
    pub fn ordered_parameters(&self) -> Vec<&RoutineParameter> {
        let mut params: Vec<&RoutineParameter> = self.parameters.iter().collect();
        params.sort_by_key(|p| p.ordinal_position);
        params
    }

    pub fn has_outputs(&self) -> bool {
        self.parameters.iter().any(|p| p.direction.is_output())
    }
}

/// One catalog row matching the requested routine name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogMatch {
    pub schema: String,
    /// Routine name as spelled in the catalog
    pub name: String,
    pub routine_type: String,
    /// Engine-specific discriminator (PostgreSQL specific_name, SQL Server data type)
    pub detail: Option<String>,
}

/// Pick the catalog match to use.
///
/// An explicit `schema.routine` qualifier only accepts that schema. Otherwise
/// the order is: schema hint, default schema, then any schema with the
/// lexicographically smallest name winning.
pub fn select_match<'a>(
    matches: &'a [CatalogMatch],
    name: &RoutineName,
    schema_hint: Option<&str>,
    default_schema: Option<&str>,
) -> Option<&'a CatalogMatch> {
    let by_schema = |schema: &str| {
        let mut found: Vec<&CatalogMatch> = matches
            .iter()
            .filter(|m| m.schema.eq_ignore_ascii_case(schema))
            .collect();
        found.sort_by(|a, b| a.schema.cmp(&b.schema).then_with(|| a.detail.cmp(&b.detail)));
        found.into_iter().next()
    };

    if let Some(explicit) = &name.schema {
        return by_schema(explicit.as_str());
    }

    schema_hint
        .and_then(by_schema)
        .or_else(|| default_schema.and_then(by_schema))
        .or_else(|| {
            matches
                .iter()
                .min_by(|a, b| a.schema.cmp(&b.schema).then_with(|| a.detail.cmp(&b.detail)))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(schemas: &[&str]) -> Vec<CatalogMatch> {
        schemas
            .iter()
            .map(|s| CatalogMatch {
                schema: s.to_string(),
                name: "fn".to_string(),
                routine_type: "FUNCTION".to_string(),
                detail: None,
            })
            .collect()
    }

    #[test]
    fn test_parse_plain_and_qualified() {
        let plain = RoutineName::parse("usp_login").unwrap();
        assert_eq!(plain.schema, None);
        assert_eq!(plain.name, "usp_login");

        let qualified = RoutineName::parse("ventas.actualizar_precio").unwrap();
        assert_eq!(qualified.schema.as_deref(), Some("ventas"));
        assert_eq!(qualified.name, "actualizar_precio");

        let bracketed = RoutineName::parse("[dbo].[usp_login]").unwrap();
        assert_eq!(bracketed.schema.as_deref(), Some("dbo"));
        assert_eq!(bracketed.name, "usp_login");
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert!(RoutineName::parse("").is_err());
        assert!(RoutineName::parse("a.b.c").is_err());
        assert!(RoutineName::parse(".routine").is_err());
    }

    #[test]
    fn test_explicit_schema_does_not_fall_back() {
        let rows = catalog(&["public", "ventas"]);
        let name = RoutineName::parse("ventas.actualizar_precio").unwrap();
        let chosen = select_match(&rows, &name, None, Some("public")).unwrap();
        assert_eq!(chosen.schema, "ventas");

        let missing = RoutineName::parse("compras.actualizar_precio").unwrap();
        assert!(select_match(&rows, &missing, None, Some("public")).is_none());
    }

    #[test]
    fn test_search_order() {
        let rows = catalog(&["zeta", "public", "alpha", "hinted"]);
        let name = RoutineName::parse("fn").unwrap();

        assert_eq!(select_match(&rows, &name, Some("hinted"), Some("public")).unwrap().schema, "hinted");
        assert_eq!(select_match(&rows, &name, Some("nope"), Some("public")).unwrap().schema, "public");

        let no_default = catalog(&["zeta", "alpha"]);
        assert_eq!(select_match(&no_default, &name, None, Some("public")).unwrap().schema, "alpha");
    }

    #[test]
    fn test_directions() {
        assert_eq!(ParameterDirection::from_catalog(Some("inout")), ParameterDirection::InOut);
        assert_eq!(ParameterDirection::from_catalog(Some("OUT")), ParameterDirection::Out);
        assert_eq!(ParameterDirection::from_catalog(None), ParameterDirection::In);
        assert!(ParameterDirection::InOut.is_input());
        assert!(!ParameterDirection::Out.is_input());
    }

    #[test]
    fn test_ordered_parameters() {
        let descriptor = RoutineDescriptor {
            schema: Some("dbo".to_string()),
            name: "usp".to_string(),
            kind: RoutineKind::Procedure,
            returns_table: false,
            parameters: vec![
                RoutineParameter::new("@b", ParameterDirection::In, "int", 2),
                RoutineParameter::new("@a", ParameterDirection::Out, "int", 1),
            ],
        };
        let names: Vec<&str> = descriptor.ordered_parameters().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(descriptor.has_outputs());
        assert_eq!(descriptor.qualified_name(), "dbo.usp");
    }
}

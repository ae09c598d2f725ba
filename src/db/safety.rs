// Query Safety Gate
// Textual pre-check applied to ad-hoc SQL before it reaches any engine

use crate::db::traits::DatabaseError;

/// Leading keywords accepted for ad-hoc execution
const ALLOWED_PREFIXES: &[&str] = &["SELECT", "WITH"];

/// Source of the table names ad-hoc queries may not mention
pub trait ForbiddenTablePolicy: Send + Sync {
    fn forbidden_tables(&self) -> &[String];
}

impl ForbiddenTablePolicy for Vec<String> {
    fn forbidden_tables(&self) -> &[String] {
        self
    }
}

/// Check an ad-hoc query against the read-only policy.
///
/// This is a textual heuristic, not a parser: a forbidden name matches anywhere
/// in the text (including inside literals and comments), and a statement that
/// starts with SELECT may still contain further statements after a `;`.
pub fn validate(query: &str, forbidden: &[String]) -> Result<(), DatabaseError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(DatabaseError::EmptyQuery);
    }

    let upper = trimmed.to_uppercase();
    if !ALLOWED_PREFIXES.iter().any(|prefix| upper.starts_with(prefix)) {
        return Err(DatabaseError::StatementNotAllowed);
    }

    let lowered = trimmed.to_lowercase();
    for table in forbidden {
        let needle = table.trim().to_lowercase();
        if !needle.is_empty() && lowered.contains(&needle) {
            return Err(DatabaseError::ForbiddenTable(table.clone()));
        }
    }

    Ok(())
}

/// Validation outcome as a flag plus the rejection message
pub fn validate_query(query: &str, forbidden: &[String]) -> (bool, Option<String>) {
    match validate(query, forbidden) {
        Ok(()) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forbidden() -> Vec<String> {
        vec!["Usuarios".to_string(), "audit_log".to_string()]
    }

    #[test]
    fn test_select_and_with_allowed() {
        assert!(validate("SELECT * FROM productos", &forbidden()).is_ok());
        assert!(validate("  select 1", &forbidden()).is_ok());
        assert!(validate("WITH t AS (SELECT 1) SELECT * FROM t", &forbidden()).is_ok());
    }

    #[test]
    fn test_empty_query() {
        assert!(matches!(validate("   \n\t", &forbidden()), Err(DatabaseError::EmptyQuery)));
    }

    #[test]
    fn test_non_select_rejected() {
        for sql in ["UPDATE productos SET precio = 0", "DELETE FROM t", "EXEC usp_x", "-- c\nSELECT 1"] {
            assert!(
                matches!(validate(sql, &forbidden()), Err(DatabaseError::StatementNotAllowed)),
                "{sql} should be rejected"
            );
        }
    }

    #[test]
    fn test_forbidden_table_any_case() {
        let result = validate("SELECT * FROM dbo.USUARIOS", &forbidden());
        match result {
            Err(DatabaseError::ForbiddenTable(name)) => assert_eq!(name, "Usuarios"),
            other => panic!("expected ForbiddenTable, got {other:?}"),
        }
    }

    #[test]
    fn test_forbidden_table_matches_substrings() {
        // textual match: a column alias containing the name is rejected too
        assert!(validate("SELECT 1 AS usuarios_activos", &forbidden()).is_err());
    }

    #[test]
    fn test_validate_query_reports_message() {
        assert_eq!(validate_query("WITH x AS (SELECT 1) SELECT * FROM x", &forbidden()), (true, None));

        let (ok, message) = validate_query("SELECT * FROM Usuarios WHERE id=@id", &forbidden());
        assert!(!ok);
        assert_eq!(message.as_deref(), Some("Query references a forbidden table: Usuarios"));

        let (ok, message) = validate_query("truncate table x", &forbidden());
        assert!(!ok);
        assert_eq!(message.as_deref(), Some("Only SELECT or WITH statements are allowed"));
    }

    #[test]
    fn test_blank_forbidden_entries_ignored() {
        let list = vec!["  ".to_string()];
        assert!(validate("SELECT 1", &list).is_ok());
    }
}

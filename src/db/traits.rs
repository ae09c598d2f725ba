// Database Driver Traits
// Defines the core abstraction shared by the SQL Server, PostgreSQL and MySQL drivers

use crate::db::binding::CallPlan;
use crate::db::routine::{RoutineDescriptor, RoutineName};
use crate::params::ParameterSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported database types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[serde(alias = "sqlserver", alias = "sql_server")]
    Mssql,
    #[serde(alias = "postgres", alias = "pg")]
    Postgresql,
    #[serde(alias = "mariadb")]
    Mysql,
}

impl DatabaseType {
    /// Display name for logs and errors
    pub fn display_name(&self) -> &'static str {
        match self {
            DatabaseType::Mssql => "Microsoft SQL Server",
            DatabaseType::Postgresql => "PostgreSQL",
            DatabaseType::Mysql => "MySQL",
        }
    }

    /// Schema searched after an explicit hint, `None` for MySQL (current database)
    pub fn default_schema(&self) -> Option<&'static str> {
        match self {
            DatabaseType::Mssql => Some("dbo"),
            DatabaseType::Postgresql => Some("public"),
            DatabaseType::Mysql => None,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for DatabaseType {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mssql" | "sqlserver" | "sql_server" => Ok(DatabaseType::Mssql),
            "postgresql" | "postgres" | "pg" => Ok(DatabaseType::Postgresql),
            "mysql" | "mariadb" => Ok(DatabaseType::Mysql),
            other => Err(DatabaseError::InvalidConfig(format!(
                "Unknown database provider: {}",
                other
            ))),
        }
    }
}

/// Common database error type
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Invalid parameter name: {0}")]
    InvalidParameterName(String),

    #[error("Query is empty")]
    EmptyQuery,

    #[error("Only SELECT or WITH statements are allowed")]
    StatementNotAllowed,

    #[error("Query references a forbidden table: {0}")]
    ForbiddenTable(String),

    #[error("Routine not found: {0}")]
    RoutineNotFound(String),

    #[error("Malformed JSON in parameter {parameter}: {reason}")]
    MalformedJsonPayload { parameter: String, reason: String },

    #[error("{engine} execution error: {message}")]
    EngineExecution {
        engine: DatabaseType,
        code: Option<i64>,
        message: String,
    },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Invalid connection type")]
    InvalidConnection,

    #[error("Cannot convert parameter: {0}")]
    Conversion(String),

    #[error("Hashing failed: {0}")]
    Hashing(String),

    #[error("Timeout error")]
    Timeout,
}

impl DatabaseError {
    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            DatabaseError::InvalidParameterName(_) => "InvalidParameterName",
            DatabaseError::EmptyQuery => "EmptyQuery",
            DatabaseError::StatementNotAllowed => "StatementNotAllowed",
            DatabaseError::ForbiddenTable(_) => "ForbiddenTable",
            DatabaseError::RoutineNotFound(_) => "RoutineNotFound",
            DatabaseError::MalformedJsonPayload { .. } => "MalformedJsonPayload",
            DatabaseError::EngineExecution { .. } => "EngineExecutionError",
            DatabaseError::ConnectionFailed(_) => "ConnectionFailed",
            DatabaseError::InvalidConfig(_) => "InvalidConfig",
            DatabaseError::InvalidConnection => "InvalidConnection",
            DatabaseError::Conversion(_) => "Conversion",
            DatabaseError::Hashing(_) => "Hashing",
            DatabaseError::Timeout => "Timeout",
        }
    }
}

/// Column of a tabular result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultColumn {
    pub name: String,
    pub data_type: String,
}

impl ResultColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Cell value in a result set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(String),
    Binary(Vec<u8>),
}

/// Fully materialized result of one execution, uniform across engines
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TabularResult {
    pub query_id: String,
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<CellValue>>,
    pub row_count: usize,
    pub rows_affected: Option<u64>,
    pub execution_time_ms: u64,
}

impl TabularResult {
    pub fn new(query_id: String) -> Self {
        Self {
            query_id,
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            rows_affected: None,
            execution_time_ms: 0,
        }
    }

    pub fn with_rows(columns: Vec<ResultColumn>, rows: Vec<Vec<CellValue>>) -> Self {
        let mut result = Self::new(String::new());
        result.row_count = rows.len();
        result.columns = columns;
        result.rows = rows;
        result
    }

    /// Append output-parameter columns.
    ///
    /// The values are added to every existing row, or become a single row
    /// when the routine produced none.
    pub fn merge_outputs(&mut self, columns: Vec<ResultColumn>, values: Vec<CellValue>) {
        if columns.is_empty() {
            return;
        }
        if self.rows.is_empty() {
            self.columns = columns;
            self.rows = vec![values];
        } else {
            self.columns.extend(columns);
            for row in &mut self.rows {
                row.extend(values.iter().cloned());
            }
        }
        self.row_count = self.rows.len();
    }
}

/// An open connection owned by exactly one execution
pub trait Connection: Send {
    /// Allow downcasting for driver-specific operations
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Database driver trait - all database drivers must implement this
#[async_trait::async_trait]
pub trait DatabaseDriver: Send + Sync {
    // --- Metadata ---
    /// Get the database type this driver supports
    fn database_type(&self) -> DatabaseType;

    /// Get the display name for this driver
    fn driver_name(&self) -> &'static str {
        self.database_type().display_name()
    }

    // --- Connection Management ---
    /// Open a new connection for a single execution
    async fn connect(&self) -> Result<Box<dyn Connection>, DatabaseError>;

    // --- Routine Resolution ---
    /// Determine routine kind and fetch its parameter metadata from the catalog
    async fn resolve_routine(
        &self,
        conn: &mut dyn Connection,
        name: &RoutineName,
        schema_hint: Option<&str>,
    ) -> Result<RoutineDescriptor, DatabaseError>;

    // --- Binding ---
    /// Bind an ad-hoc query written with `@name` placeholders
    fn bind_query(&self, sql: &str, params: &ParameterSet) -> Result<CallPlan, DatabaseError>;

    /// Bind a resolved routine call
    fn bind_routine(
        &self,
        routine: &RoutineDescriptor,
        params: &ParameterSet,
    ) -> Result<CallPlan, DatabaseError>;

    // --- Execution ---
    /// Execute a bound plan and materialize the full result
    async fn invoke(
        &self,
        conn: &mut dyn Connection,
        plan: &CallPlan,
    ) -> Result<TabularResult, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_names() {
        assert_eq!("SqlServer".parse::<DatabaseType>().unwrap(), DatabaseType::Mssql);
        assert_eq!("postgres".parse::<DatabaseType>().unwrap(), DatabaseType::Postgresql);
        assert_eq!("MariaDB".parse::<DatabaseType>().unwrap(), DatabaseType::Mysql);
        assert!("oracle".parse::<DatabaseType>().is_err());
    }

    #[test]
    fn test_default_schemas() {
        assert_eq!(DatabaseType::Mssql.default_schema(), Some("dbo"));
        assert_eq!(DatabaseType::Postgresql.default_schema(), Some("public"));
        assert_eq!(DatabaseType::Mysql.default_schema(), None);
    }

    #[test]
    fn test_merge_outputs_into_empty_result() {
        let mut result = TabularResult::new("q".to_string());
        result.merge_outputs(
            vec![ResultColumn::new("total", "int")],
            vec![CellValue::Int(5)],
        );
        assert_eq!(result.row_count, 1);
        assert_eq!(result.rows, vec![vec![CellValue::Int(5)]]);
    }

    #[test]
    fn test_merge_outputs_appends_to_rows() {
        let mut result = TabularResult::with_rows(
            vec![ResultColumn::new("id", "int")],
            vec![vec![CellValue::Int(1)], vec![CellValue::Int(2)]],
        );
        result.merge_outputs(
            vec![ResultColumn::new("status", "nvarchar")],
            vec![CellValue::String("ok".to_string())],
        );

        assert_eq!(result.columns.len(), 2);
        assert_eq!(result.rows[1], vec![CellValue::Int(2), CellValue::String("ok".to_string())]);
    }
}

// MySQL / MariaDB Driver
// Implements DatabaseDriver for MySQL using sqlx

use crate::db::binding::{
    bind_declared, output_variable, rewrite_placeholders, BoundParameter, CallPlan, FetchMode,
    OutputBinding, PlaceholderStyle, PlannedStatement, TypeFamily,
};
use crate::db::connection::{open_mysql, ConnectionProvider};
use crate::db::routine::{
    select_match, CatalogMatch, ParameterDirection, RoutineDescriptor, RoutineKind, RoutineName,
    RoutineParameter,
};
use crate::db::traits::{
    CellValue, Connection, DatabaseDriver, DatabaseError, DatabaseType, ResultColumn, TabularResult,
};
use crate::params::{ParameterSet, ParameterValue};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlArguments, MySqlColumn, MySqlDatabaseError, MySqlRow};
use sqlx::{Column as _, Either, Executor as _, MySql, Row as _, Statement as _, TypeInfo as _};
use std::sync::Arc;

type MySqlQuery<'q> = sqlx::query::Query<'q, MySql, MySqlArguments>;

// information_schema exposes enums and utf8mb3 text; cast so sqlx decodes plain strings
const ROUTINE_CATALOG_QUERY: &str = r#"
    SELECT
        CAST(ROUTINE_SCHEMA AS CHAR),
        CAST(ROUTINE_NAME AS CHAR),
        CAST(ROUTINE_TYPE AS CHAR),
        CAST(DTD_IDENTIFIER AS CHAR)
    FROM information_schema.ROUTINES
    WHERE ROUTINE_NAME = ?
"#;

const PARAMETER_CATALOG_QUERY: &str = r#"
    SELECT
        CAST(PARAMETER_NAME AS CHAR),
        CAST(PARAMETER_MODE AS CHAR),
        CAST(DATA_TYPE AS CHAR),
        CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED),
        CAST(NUMERIC_PRECISION AS SIGNED),
        CAST(NUMERIC_SCALE AS SIGNED),
        CAST(ORDINAL_POSITION AS SIGNED)
    FROM information_schema.PARAMETERS
    WHERE SPECIFIC_SCHEMA = ? AND SPECIFIC_NAME = ? AND ORDINAL_POSITION > 0
    ORDER BY ORDINAL_POSITION
"#;

/// MySQL specific connection wrapper
pub struct MysqlConnection {
    pub conn: sqlx::MySqlConnection,
}

impl Connection for MysqlConnection {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// MySQL driver implementation
pub struct MysqlDriver {
    provider: Arc<dyn ConnectionProvider>,
}

impl MysqlDriver {
    /// Create a new MySQL driver
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self { provider }
    }

    fn connection<'a>(conn: &'a mut dyn Connection) -> Result<&'a mut sqlx::MySqlConnection, DatabaseError> {
        conn.as_any_mut()
            .downcast_mut::<MysqlConnection>()
            .map(|c| &mut c.conn)
            .ok_or(DatabaseError::InvalidConnection)
    }

    fn parameter_from_row(row: &MySqlRow) -> RoutineParameter {
        let text = |idx: usize| row.try_get::<Option<String>, _>(idx).ok().flatten();
        let number = |idx: usize| row.try_get::<Option<i64>, _>(idx).ok().flatten();

        let mut param = RoutineParameter::new(
            &text(0).unwrap_or_default(),
            ParameterDirection::from_catalog(text(1).as_deref()),
            &text(2).unwrap_or_default(),
            number(6).unwrap_or(0) as i32,
        );
        param.max_length = number(3);
        param.precision = number(4);
        param.scale = number(5);
        param
    }

    fn bind_function(routine: &RoutineDescriptor, params: &ParameterSet) -> CallPlan {
        let bound: Vec<BoundParameter> = routine
            .ordered_parameters()
            .into_iter()
            .filter(|p| p.direction.is_input())
            .map(|p| bind_declared(p, params.entry(&p.name)))
            .collect();

        let placeholders = vec!["?"; bound.len()].join(", ");
        let sql = format!("SELECT {}({}) AS result", qualified(routine), placeholders);

        CallPlan::single(sql, bound, FetchMode::Rows)
    }

    fn bind_procedure(routine: &RoutineDescriptor, params: &ParameterSet) -> CallPlan {
        let mut setup = Vec::new();
        let mut arguments = Vec::new();
        let mut bound = Vec::new();
        let mut outputs = Vec::new();

        for param in routine.ordered_parameters() {
            let binding = bind_declared(param, params.entry(&param.name));

            if param.direction.is_output() {
                let variable = output_variable(&param.name);
                // session variables outlive the call; reset OUT-only ones explicitly
                let seed = if param.direction.is_input() { vec![binding] } else { Vec::new() };
                let value = if seed.is_empty() { "NULL" } else { "?" };
                setup.push(PlannedStatement::new(format!("SET @{} = {}", variable, value), seed));

                arguments.push(format!("@{}", variable));
                outputs.push(OutputBinding {
                    parameter: param.name.clone(),
                    variable,
                    data_type: param.data_type.clone(),
                });
            } else {
                bound.push(binding);
                arguments.push("?".to_string());
            }
        }

        let sql = format!("CALL {}({})", qualified(routine), arguments.join(", "));

        let harvest = if outputs.is_empty() {
            None
        } else {
            let selected: Vec<String> = outputs
                .iter()
                .map(|o| format!("@{} AS {}", o.variable, quote_ident(&o.parameter)))
                .collect();
            Some(PlannedStatement::new(format!("SELECT {}", selected.join(", ")), Vec::new()))
        };

        CallPlan {
            setup,
            call: PlannedStatement::new(sql, bound),
            harvest,
            outputs,
            fetch: FetchMode::Rows,
        }
    }

    fn extract_value(row: &MySqlRow, idx: usize, type_name: &str) -> CellValue {
        match type_name {
            "NULL" => CellValue::Null,
            "BOOLEAN" => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(CellValue::Bool)
                .unwrap_or(CellValue::Null),
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => row
                .try_get::<Option<i64>, _>(idx)
                .ok()
                .flatten()
                .map(CellValue::Int)
                .unwrap_or(CellValue::Null),
            t if t.ends_with("UNSIGNED") => row
                .try_get::<Option<u64>, _>(idx)
                .ok()
                .flatten()
                .map(unsigned_cell)
                .unwrap_or(CellValue::Null),
            "FLOAT" | "DOUBLE" => row
                .try_get::<Option<f64>, _>(idx)
                .ok()
                .flatten()
                .map(CellValue::Float)
                .or_else(|| row.try_get::<Option<f32>, _>(idx).ok().flatten().map(|v| CellValue::Float(v as f64)))
                .unwrap_or(CellValue::Null),
            "DECIMAL" => row
                .try_get::<Option<Decimal>, _>(idx)
                .ok()
                .flatten()
                .map(|d| CellValue::String(d.to_string()))
                .unwrap_or(CellValue::Null),
            "DATE" => row
                .try_get::<Option<NaiveDate>, _>(idx)
                .ok()
                .flatten()
                .map(|d| CellValue::DateTime(d.to_string()))
                .unwrap_or(CellValue::Null),
            "DATETIME" => row
                .try_get::<Option<NaiveDateTime>, _>(idx)
                .ok()
                .flatten()
                .map(|dt| CellValue::DateTime(dt.to_string()))
                .unwrap_or(CellValue::Null),
            "TIMESTAMP" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)
                .ok()
                .flatten()
                .map(|dt| CellValue::DateTime(dt.to_rfc3339()))
                .unwrap_or(CellValue::Null),
            "TIME" => row
                .try_get::<Option<NaiveTime>, _>(idx)
                .ok()
                .flatten()
                .map(|t| CellValue::DateTime(t.to_string()))
                .unwrap_or(CellValue::Null),
            "JSON" => row
                .try_get::<Option<serde_json::Value>, _>(idx)
                .ok()
                .flatten()
                .map(|v| CellValue::String(v.to_string()))
                .unwrap_or(CellValue::Null),
            "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" => {
                Self::text_or_bytes(row, idx)
            }
            _ => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(CellValue::String)
                .unwrap_or_else(|| Self::text_or_bytes(row, idx)),
        }
    }

    /// Session variables come back as blobs on some servers; keep valid UTF-8 as text
    fn text_or_bytes(row: &MySqlRow, idx: usize) -> CellValue {
        match row.try_get::<Option<Vec<u8>>, _>(idx).ok().flatten() {
            Some(bytes) => match String::from_utf8(bytes) {
                Ok(text) => CellValue::String(text),
                Err(e) => CellValue::Binary(e.into_bytes()),
            },
            None => CellValue::Null,
        }
    }

    fn result_columns(columns: &[MySqlColumn]) -> Vec<ResultColumn> {
        columns
            .iter()
            .map(|c| ResultColumn::new(c.name(), c.type_info().name()))
            .collect()
    }

    fn materialize(columns: Vec<ResultColumn>, rows: &[MySqlRow]) -> (Vec<ResultColumn>, Vec<Vec<CellValue>>) {
        let values = rows
            .iter()
            .map(|row| {
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| Self::extract_value(row, idx, col.type_info().name()))
                    .collect()
            })
            .collect();

        (columns, values)
    }

    /// Run a statement and keep only the rows of its first result set
    async fn fetch_first_result_set(
        conn: &mut sqlx::MySqlConnection,
        statement: &PlannedStatement,
    ) -> Result<Vec<MySqlRow>, DatabaseError> {
        // every result set must be read off the wire before the connection is reused
        let items: Vec<Either<_, MySqlRow>> = (&mut *conn)
            .fetch_many(build_query(statement))
            .try_collect()
            .await
            .map_err(translate_error)?;
        Ok(first_result_set(items))
    }

    /// Column metadata for a statement that returned no rows
    async fn describe_columns(conn: &mut sqlx::MySqlConnection, sql: &str) -> Vec<ResultColumn> {
        match (&mut *conn).prepare(sql).await {
            Ok(prepared) => Self::result_columns(prepared.columns()),
            Err(e) => {
                tracing::debug!(error = %e, "could not describe empty result set");
                Vec::new()
            }
        }
    }
}

/// Rows received before the first end-of-result-set marker
fn first_result_set<D, R>(items: impl IntoIterator<Item = Either<D, R>>) -> Vec<R> {
    items
        .into_iter()
        .take_while(|item| matches!(item, Either::Right(_)))
        .filter_map(|item| match item {
            Either::Right(row) => Some(row),
            Either::Left(_) => None,
        })
        .collect()
}

/// BIGINT UNSIGNED values above i64::MAX keep their exact digits as text
fn unsigned_cell(v: u64) -> CellValue {
    i64::try_from(v)
        .map(CellValue::Int)
        .unwrap_or_else(|_| CellValue::String(v.to_string()))
}

#[async_trait::async_trait]
impl DatabaseDriver for MysqlDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mysql
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, DatabaseError> {
        let connection_string = self.provider.connection_string()?;
        let conn = open_mysql(&connection_string).await?;
        Ok(Box::new(MysqlConnection { conn }))
    }

    async fn resolve_routine(
        &self,
        conn: &mut dyn Connection,
        name: &RoutineName,
        schema_hint: Option<&str>,
    ) -> Result<RoutineDescriptor, DatabaseError> {
        let conn = Self::connection(conn)?;

        // the current database plays the role of the default schema
        let current: Option<String> = sqlx::query_scalar("SELECT DATABASE()")
            .fetch_one(&mut *conn)
            .await
            .map_err(translate_error)?;

        let rows = sqlx::query(ROUTINE_CATALOG_QUERY)
            .bind(name.name.as_str())
            .fetch_all(&mut *conn)
            .await
            .map_err(translate_error)?;

        let matches: Vec<CatalogMatch> = rows
            .iter()
            .map(|row| {
                let text = |idx: usize| row.try_get::<Option<String>, _>(idx).ok().flatten();
                CatalogMatch {
                    schema: text(0).unwrap_or_default(),
                    name: text(1).unwrap_or_default(),
                    routine_type: text(2).unwrap_or_default(),
                    detail: text(3),
                }
            })
            .collect();

        let found = select_match(&matches, name, schema_hint, current.as_deref())
            .ok_or_else(|| DatabaseError::RoutineNotFound(name.to_string()))?
            .clone();

        let rows = sqlx::query(PARAMETER_CATALOG_QUERY)
            .bind(found.schema.as_str())
            .bind(found.name.as_str())
            .fetch_all(&mut *conn)
            .await
            .map_err(translate_error)?;

        Ok(RoutineDescriptor {
            schema: Some(found.schema),
            name: found.name,
            kind: RoutineKind::from_catalog(&found.routine_type),
            returns_table: false,
            parameters: rows.iter().map(Self::parameter_from_row).collect(),
        })
    }

    fn bind_query(&self, sql: &str, params: &ParameterSet) -> Result<CallPlan, DatabaseError> {
        let (sql, bound) = rewrite_placeholders(sql, params, PlaceholderStyle::Question);
        Ok(CallPlan::single(sql, bound, FetchMode::Rows))
    }

    fn bind_routine(
        &self,
        routine: &RoutineDescriptor,
        params: &ParameterSet,
    ) -> Result<CallPlan, DatabaseError> {
        Ok(match routine.kind {
            RoutineKind::Function => Self::bind_function(routine, params),
            RoutineKind::Procedure => Self::bind_procedure(routine, params),
        })
    }

    async fn invoke(
        &self,
        conn: &mut dyn Connection,
        plan: &CallPlan,
    ) -> Result<TabularResult, DatabaseError> {
        let conn = Self::connection(conn)?;
        let start = std::time::Instant::now();

        for statement in &plan.setup {
            build_query(statement)
                .execute(&mut *conn)
                .await
                .map_err(translate_error)?;
        }

        let mut result = match plan.fetch {
            FetchMode::Execute => {
                let done = build_query(&plan.call)
                    .execute(&mut *conn)
                    .await
                    .map_err(translate_error)?;
                let mut result = TabularResult::new(String::new());
                result.rows_affected = Some(done.rows_affected());
                result
            }
            FetchMode::Rows => {
                let rows = Self::fetch_first_result_set(conn, &plan.call).await?;
                let columns = match rows.first() {
                    Some(row) => Self::result_columns(row.columns()),
                    None => Self::describe_columns(conn, &plan.call.sql).await,
                };
                let (columns, values) = Self::materialize(columns, &rows);
                TabularResult::with_rows(columns, values)
            }
        };

        if let Some(harvest) = &plan.harvest {
            let rows = build_query(harvest)
                .fetch_all(&mut *conn)
                .await
                .map_err(translate_error)?;
            let columns = rows
                .first()
                .map(|row| Self::result_columns(row.columns()))
                .unwrap_or_default();
            let (columns, mut values) = Self::materialize(columns, &rows);
            if let Some(row) = values.pop() {
                result.merge_outputs(columns, row);
            }
        }

        result.execution_time_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }
}

fn build_query(statement: &PlannedStatement) -> MySqlQuery<'_> {
    statement
        .parameters
        .iter()
        .fold(sqlx::query(&statement.sql), bind_parameter)
}

/// Bind one value; nulls carry a type matching the declared family
fn bind_parameter<'q>(query: MySqlQuery<'q>, param: &'q BoundParameter) -> MySqlQuery<'q> {
    match &param.value {
        ParameterValue::Null => match param.family {
            Some(TypeFamily::Integer) => query.bind(Option::<i64>::None),
            Some(TypeFamily::Decimal) => query.bind(Option::<Decimal>::None),
            Some(TypeFamily::Float) => query.bind(Option::<f64>::None),
            Some(TypeFamily::Boolean) => query.bind(Option::<bool>::None),
            Some(TypeFamily::Date) => query.bind(Option::<NaiveDate>::None),
            Some(TypeFamily::DateTime) => query.bind(Option::<NaiveDateTime>::None),
            Some(TypeFamily::Binary) => query.bind(Option::<Vec<u8>>::None),
            _ => query.bind(Option::<String>::None),
        },
        ParameterValue::Bool(b) => query.bind(*b),
        ParameterValue::Int(v) => query.bind(*v),
        ParameterValue::BigInt(v) => query.bind(*v),
        ParameterValue::Float(v) => query.bind(*v),
        ParameterValue::Decimal(d) => query.bind(*d),
        ParameterValue::DateTime(dt) => query.bind(*dt),
        ParameterValue::Date(d) => query.bind(*d),
        // CHAR(36) is the common column type for UUIDs in MySQL
        ParameterValue::Uuid(u) => query.bind(u.to_string()),
        ParameterValue::Text(s) | ParameterValue::Json(s) => query.bind(s.as_str()),
    }
}

/// Wrap a driver error, keeping the MySQL error number
pub fn translate_error(err: sqlx::Error) -> DatabaseError {
    match &err {
        sqlx::Error::Database(db) => DatabaseError::EngineExecution {
            engine: DatabaseType::Mysql,
            code: db
                .try_downcast_ref::<MySqlDatabaseError>()
                .map(|e| e.number() as i64),
            message: db.message().to_string(),
        },
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
            DatabaseError::ConnectionFailed(err.to_string())
        }
        _ => DatabaseError::EngineExecution {
            engine: DatabaseType::Mysql,
            code: None,
            message: err.to_string(),
        },
    }
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn qualified(routine: &RoutineDescriptor) -> String {
    match &routine.schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&routine.name)),
        None => quote_ident(&routine.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::normalize_json;
    use serde_json::json;

    fn driver() -> MysqlDriver {
        MysqlDriver::new(Arc::new("mysql://root@localhost/tienda".to_string()))
    }

    fn descriptor(kind: RoutineKind, parameters: Vec<RoutineParameter>) -> RoutineDescriptor {
        RoutineDescriptor {
            schema: Some("tienda".to_string()),
            name: "sp_registrar".to_string(),
            kind,
            returns_table: false,
            parameters,
        }
    }

    #[test]
    fn test_driver_type() {
        assert_eq!(driver().database_type(), DatabaseType::Mysql);
    }

    #[test]
    fn test_procedure_plan_with_outputs() {
        let routine = descriptor(
            RoutineKind::Procedure,
            vec![
                RoutineParameter::new("p_maestro", ParameterDirection::In, "json", 1),
                RoutineParameter::new("p_contador", ParameterDirection::InOut, "int", 2),
                RoutineParameter::new("p_id", ParameterDirection::Out, "bigint", 3),
            ],
        );
        let params = normalize_json(json!({"p_maestro": {"nombre": "x"}, "p_contador": 4})).unwrap();
        let plan = driver().bind_routine(&routine, &params).unwrap();

        assert_eq!(plan.call.sql, "CALL `tienda`.`sp_registrar`(?, @__out_p_contador, @__out_p_id)");
        assert_eq!(plan.call.parameters.len(), 1);
        assert_eq!(
            plan.call.parameters[0].value,
            ParameterValue::Json(r#"{"nombre":"x"}"#.to_string())
        );

        assert_eq!(plan.setup.len(), 2);
        assert_eq!(plan.setup[0].sql, "SET @__out_p_contador = ?");
        assert_eq!(plan.setup[0].parameters[0].value, ParameterValue::Int(4));
        assert_eq!(plan.setup[1].sql, "SET @__out_p_id = NULL");
        assert!(plan.setup[1].parameters.is_empty());

        let harvest = plan.harvest.unwrap();
        assert_eq!(harvest.sql, "SELECT @__out_p_contador AS `p_contador`, @__out_p_id AS `p_id`");
    }

    #[test]
    fn test_procedure_without_outputs() {
        let routine = descriptor(
            RoutineKind::Procedure,
            vec![RoutineParameter::new("p_email", ParameterDirection::In, "varchar", 1)],
        );
        let params = normalize_json(json!({"p_email": "a@b.com"})).unwrap();
        let plan = driver().bind_routine(&routine, &params).unwrap();

        assert_eq!(plan.call.sql, "CALL `tienda`.`sp_registrar`(?)");
        assert!(plan.setup.is_empty());
        assert!(plan.harvest.is_none());
    }

    #[test]
    fn test_function_plan() {
        let routine = descriptor(
            RoutineKind::Function,
            vec![RoutineParameter::new("p_total", ParameterDirection::In, "decimal", 1)],
        );
        let params = normalize_json(json!({"p_total": "10.50"})).unwrap();
        let plan = driver().bind_routine(&routine, &params).unwrap();

        assert_eq!(plan.call.sql, "SELECT `tienda`.`sp_registrar`(?) AS result");
        assert_eq!(
            plan.call.parameters[0].value,
            ParameterValue::Decimal(Decimal::new(1050, 2))
        );
    }

    #[test]
    fn test_adhoc_query_repeats_values() {
        let params = normalize_json(json!({"q": "abc"})).unwrap();
        let plan = driver()
            .bind_query("SELECT * FROM t WHERE a = @q OR b = @q", &params)
            .unwrap();
        assert_eq!(plan.call.sql, "SELECT * FROM t WHERE a = ? OR b = ?");
        assert_eq!(plan.call.parameters.len(), 2);
    }

    #[test]
    fn test_first_result_set_stops_at_boundary() {
        // CALL: two SELECTs, then the procedure status
        let items: Vec<Either<u64, &str>> = vec![
            Either::Right("a1"),
            Either::Right("a2"),
            Either::Left(0),
            Either::Right("b1"),
            Either::Left(0),
            Either::Left(1),
        ];
        assert_eq!(first_result_set(items), vec!["a1", "a2"]);
    }

    #[test]
    fn test_empty_first_result_set_hides_later_rows() {
        let items: Vec<Either<u64, &str>> = vec![Either::Left(0), Either::Right("b1"), Either::Left(0)];
        assert!(first_result_set(items).is_empty());
    }

    #[test]
    fn test_zero_rows_keep_described_columns() {
        let columns = vec![ResultColumn::new("id", "INT"), ResultColumn::new("nombre", "VARCHAR")];
        let (columns, values) = MysqlDriver::materialize(columns, &[]);
        assert_eq!(columns.len(), 2);
        assert!(values.is_empty());
    }

    #[test]
    fn test_unsigned_cells() {
        assert_eq!(unsigned_cell(42), CellValue::Int(42));
        assert_eq!(unsigned_cell(i64::MAX as u64), CellValue::Int(i64::MAX));
        assert_eq!(unsigned_cell(u64::MAX), CellValue::String("18446744073709551615".to_string()));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }
}

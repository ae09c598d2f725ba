// PostgreSQL Driver
// Implements DatabaseDriver for PostgreSQL using tokio-postgres

use crate::db::binding::{
    bind_declared, rewrite_placeholders, CallPlan, FetchMode, PlaceholderStyle, PlannedStatement,
};
use crate::db::connection::{open_postgres, ConnectionProvider};
use crate::db::routine::{
    select_match, CatalogMatch, ParameterDirection, RoutineDescriptor, RoutineKind, RoutineName,
    RoutineParameter,
};
use crate::db::traits::{
    CellValue, Connection, DatabaseDriver, DatabaseError, DatabaseType, ResultColumn, TabularResult,
};
use crate::params::infer::parse_datetime;
use crate::params::{ParameterSet, ParameterValue};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::error::Error as StdError;
use std::str::FromStr;
use std::sync::Arc;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Row;
use uuid::Uuid;

type BoxError = Box<dyn StdError + Sync + Send>;

// information_schema columns are domain types; cast to plain text/int for the driver
const ROUTINE_CATALOG_QUERY: &str = r#"
    SELECT routine_schema::text, routine_name::text, routine_type::text, specific_name::text
    FROM information_schema.routines
    WHERE routine_name::text IN ($1, lower($1))
"#;

const PARAMETER_CATALOG_QUERY: &str = r#"
    SELECT
        parameter_name::text,
        parameter_mode::text,
        data_type::text,
        udt_name::text,
        character_maximum_length::bigint,
        numeric_precision::bigint,
        numeric_scale::bigint,
        ordinal_position::int
    FROM information_schema.parameters
    WHERE specific_schema::text = $1 AND specific_name::text = $2
    ORDER BY ordinal_position
"#;

/// PostgreSQL specific connection wrapper
pub struct PostgresConnection {
    pub client: tokio_postgres::Client,
}

impl Connection for PostgresConnection {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// PostgreSQL driver implementation
pub struct PostgresDriver {
    provider: Arc<dyn ConnectionProvider>,
}

impl PostgresDriver {
    /// Create a new PostgreSQL driver
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self { provider }
    }

    fn client<'a>(conn: &'a mut dyn Connection) -> Result<&'a mut tokio_postgres::Client, DatabaseError> {
        conn.as_any_mut()
            .downcast_mut::<PostgresConnection>()
            .map(|c| &mut c.client)
            .ok_or(DatabaseError::InvalidConnection)
    }

    fn parameter_from_row(row: &Row) -> RoutineParameter {
        let ordinal: i32 = row.get::<_, Option<i32>>(7).unwrap_or(0);
        let name = row
            .get::<_, Option<String>>(0)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("arg{}", ordinal));

        // arrays and user-defined types report their real name in udt_name
        let data_type = match row.get::<_, Option<String>>(2) {
            Some(t) if t != "USER-DEFINED" && t != "ARRAY" => t,
            _ => row.get::<_, Option<String>>(3).unwrap_or_default(),
        };

        let mode = row.get::<_, Option<String>>(1);
        let mut param = RoutineParameter::new(
            &name,
            ParameterDirection::from_catalog(mode.as_deref()),
            &data_type,
            ordinal,
        );
        param.max_length = row.get::<_, Option<i64>>(4);
        param.precision = row.get::<_, Option<i64>>(5);
        param.scale = row.get::<_, Option<i64>>(6);
        param
    }

    fn bind_function(routine: &RoutineDescriptor, params: &ParameterSet) -> CallPlan {
        let bound: Vec<_> = routine
            .ordered_parameters()
            .into_iter()
            .filter(|p| p.direction.is_input())
            .map(|p| bind_declared(p, params.entry(&p.name)))
            .collect();

        let placeholders: Vec<String> = (1..=bound.len())
            .map(|i| PlaceholderStyle::Dollar.render(i))
            .collect();
        let sql = format!("SELECT * FROM {}({})", qualified(routine), placeholders.join(", "));

        CallPlan::single(sql, bound, FetchMode::Rows)
    }

    fn bind_procedure(routine: &RoutineDescriptor, params: &ParameterSet) -> CallPlan {
        let mut bound = Vec::new();
        let mut arguments = Vec::new();

        for param in routine.ordered_parameters() {
            if param.direction.is_input() {
                bound.push(bind_declared(param, params.entry(&param.name)));
                arguments.push(PlaceholderStyle::Dollar.render(bound.len()));
            } else {
                arguments.push("NULL".to_string());
            }
        }

        let sql = format!("CALL {}({})", qualified(routine), arguments.join(", "));
        // INOUT/OUT values come back as the row returned by CALL
        let fetch = if routine.has_outputs() {
            FetchMode::Rows
        } else {
            FetchMode::Execute
        };

        CallPlan {
            setup: Vec::new(),
            call: PlannedStatement::new(sql, bound),
            harvest: None,
            outputs: Vec::new(),
            fetch,
        }
    }

    /// Extract cell value based on the column's type
    fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> CellValue {
        match *pg_type {
            Type::BOOL => row
                .try_get::<_, Option<bool>>(idx)
                .ok()
                .flatten()
                .map(CellValue::Bool)
                .unwrap_or(CellValue::Null),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(idx)
                .ok()
                .flatten()
                .map(|v| CellValue::Int(v as i64))
                .unwrap_or(CellValue::Null),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(idx)
                .ok()
                .flatten()
                .map(|v| CellValue::Int(v as i64))
                .unwrap_or(CellValue::Null),
            Type::INT8 => row
                .try_get::<_, Option<i64>>(idx)
                .ok()
                .flatten()
                .map(CellValue::Int)
                .unwrap_or(CellValue::Null),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)
                .ok()
                .flatten()
                .map(|v| CellValue::Float(v as f64))
                .unwrap_or(CellValue::Null),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(idx)
                .ok()
                .flatten()
                .map(CellValue::Float)
                .unwrap_or(CellValue::Null),
            Type::NUMERIC => row
                .try_get::<_, Option<Decimal>>(idx)
                .ok()
                .flatten()
                .map(|d| CellValue::String(d.to_string()))
                .unwrap_or(CellValue::Null),
            Type::BYTEA => row
                .try_get::<_, Option<Vec<u8>>>(idx)
                .ok()
                .flatten()
                .map(CellValue::Binary)
                .unwrap_or(CellValue::Null),
            Type::DATE => row
                .try_get::<_, Option<NaiveDate>>(idx)
                .ok()
                .flatten()
                .map(|d| CellValue::DateTime(d.to_string()))
                .unwrap_or(CellValue::Null),
            Type::TIME => row
                .try_get::<_, Option<NaiveTime>>(idx)
                .ok()
                .flatten()
                .map(|t| CellValue::DateTime(t.to_string()))
                .unwrap_or(CellValue::Null),
            Type::TIMESTAMP => row
                .try_get::<_, Option<NaiveDateTime>>(idx)
                .ok()
                .flatten()
                .map(|dt| CellValue::DateTime(dt.to_string()))
                .unwrap_or(CellValue::Null),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<DateTime<Utc>>>(idx)
                .ok()
                .flatten()
                .map(|dt| CellValue::DateTime(dt.to_rfc3339()))
                .unwrap_or(CellValue::Null),
            Type::UUID => row
                .try_get::<_, Option<Uuid>>(idx)
                .ok()
                .flatten()
                .map(|u| CellValue::String(u.to_string()))
                .unwrap_or(CellValue::Null),
            Type::JSON | Type::JSONB => row
                .try_get::<_, Option<serde_json::Value>>(idx)
                .ok()
                .flatten()
                .map(|v| CellValue::String(v.to_string()))
                .unwrap_or(CellValue::Null),
            _ => row
                .try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(CellValue::String)
                .unwrap_or(CellValue::Null),
        }
    }
}

#[async_trait::async_trait]
impl DatabaseDriver for PostgresDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgresql
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, DatabaseError> {
        let connection_string = self.provider.connection_string()?;
        let client = open_postgres(&connection_string).await?;
        Ok(Box::new(PostgresConnection { client }))
    }

    async fn resolve_routine(
        &self,
        conn: &mut dyn Connection,
        name: &RoutineName,
        schema_hint: Option<&str>,
    ) -> Result<RoutineDescriptor, DatabaseError> {
        let client = Self::client(conn)?;

        let rows = client
            .query(ROUTINE_CATALOG_QUERY, &[&name.name])
            .await
            .map_err(translate_error)?;

        let matches: Vec<CatalogMatch> = rows
            .iter()
            .map(|row| CatalogMatch {
                schema: row.get::<_, Option<String>>(0).unwrap_or_default(),
                name: row.get::<_, Option<String>>(1).unwrap_or_default(),
                routine_type: row.get::<_, Option<String>>(2).unwrap_or_default(),
                detail: row.get::<_, Option<String>>(3),
            })
            .collect();

        let found = select_match(&matches, name, schema_hint, self.database_type().default_schema())
            .ok_or_else(|| DatabaseError::RoutineNotFound(name.to_string()))?
            .clone();

        let specific_name = found.detail.clone().unwrap_or_else(|| found.name.clone());
        let rows = client
            .query(PARAMETER_CATALOG_QUERY, &[&found.schema, &specific_name])
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
        let (sql, bound) = rewrite_placeholders(sql, params, PlaceholderStyle::Dollar);
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
        let client = Self::client(conn)?;
        let start = std::time::Instant::now();

        // preparing first lets the server report the type of each placeholder
        let statement = client.prepare(&plan.call.sql).await.map_err(translate_error)?;
        let values: Vec<PgParam<'_>> = plan.call.parameters.iter().map(|p| PgParam(&p.value)).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();

        let mut result = match plan.fetch {
            FetchMode::Execute => {
                let affected = client.execute(&statement, &refs).await.map_err(translate_error)?;
                let mut result = TabularResult::new(String::new());
                result.rows_affected = Some(affected);
                result
            }
            FetchMode::Rows => {
                let rows = client.query(&statement, &refs).await.map_err(translate_error)?;
                let columns: Vec<ResultColumn> = statement
                    .columns()
                    .iter()
                    .map(|c| ResultColumn::new(c.name(), c.type_().name()))
                    .collect();
                let values = rows
                    .iter()
                    .map(|row| {
                        statement
                            .columns()
                            .iter()
                            .enumerate()
                            .map(|(idx, col)| Self::extract_value(row, idx, col.type_()))
                            .collect()
                    })
                    .collect();
                TabularResult::with_rows(columns, values)
            }
        };

        result.execution_time_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }
}

/// Parameter adapter converting a ParameterValue to whatever type the server expects
#[derive(Debug)]
struct PgParam<'a>(&'a ParameterValue);

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        let value = self.0;
        if value.is_null() {
            return Ok(IsNull::Yes);
        }

        match *ty {
            Type::BOOL => as_bool(value)?.to_sql(ty, out),
            Type::INT2 => i16::try_from(as_i64(value)?)?.to_sql(ty, out),
            Type::INT4 => i32::try_from(as_i64(value)?)?.to_sql(ty, out),
            Type::INT8 => as_i64(value)?.to_sql(ty, out),
            Type::FLOAT4 => (as_f64(value)? as f32).to_sql(ty, out),
            Type::FLOAT8 => as_f64(value)?.to_sql(ty, out),
            Type::NUMERIC => as_decimal(value)?.to_sql(ty, out),
            Type::DATE => as_date(value)?.to_sql(ty, out),
            Type::TIMESTAMP => as_datetime(value)?.to_sql(ty, out),
            Type::TIMESTAMPTZ => Utc.from_utc_datetime(&as_datetime(value)?).to_sql(ty, out),
            Type::UUID => as_uuid(value)?.to_sql(ty, out),
            Type::JSON | Type::JSONB => serde_json::to_value(value)?.to_sql(ty, out),
            // text, varchar, enums and anything else that takes its text form
            _ => value.to_text().unwrap_or_default().as_str().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn mismatch(value: &ParameterValue, target: &str) -> BoxError {
    Box::new(DatabaseError::Conversion(format!(
        "cannot bind {} value as {}",
        value.kind(),
        target
    )))
}

fn as_bool(value: &ParameterValue) -> Result<bool, BoxError> {
    match value {
        ParameterValue::Bool(b) => Ok(*b),
        ParameterValue::Int(v) => Ok(*v != 0),
        ParameterValue::BigInt(v) => Ok(*v != 0),
        ParameterValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(mismatch(value, "boolean")),
        },
        _ => Err(mismatch(value, "boolean")),
    }
}

fn as_i64(value: &ParameterValue) -> Result<i64, BoxError> {
    match value {
        ParameterValue::Int(v) => Ok(*v as i64),
        ParameterValue::BigInt(v) => Ok(*v),
        ParameterValue::Bool(b) => Ok(*b as i64),
        ParameterValue::Float(f) if f.fract() == 0.0 => f.to_i64().ok_or_else(|| mismatch(value, "integer")),
        ParameterValue::Decimal(d) if d.fract().is_zero() => d.to_i64().ok_or_else(|| mismatch(value, "integer")),
        ParameterValue::Text(s) => s.trim().parse::<i64>().map_err(|_| mismatch(value, "integer")),
        _ => Err(mismatch(value, "integer")),
    }
}

fn as_f64(value: &ParameterValue) -> Result<f64, BoxError> {
    match value {
        ParameterValue::Int(v) => Ok(*v as f64),
        ParameterValue::BigInt(v) => Ok(*v as f64),
        ParameterValue::Float(f) => Ok(*f),
        ParameterValue::Decimal(d) => d.to_f64().ok_or_else(|| mismatch(value, "float")),
        ParameterValue::Text(s) => s.trim().parse::<f64>().map_err(|_| mismatch(value, "float")),
        _ => Err(mismatch(value, "float")),
    }
}

fn as_decimal(value: &ParameterValue) -> Result<Decimal, BoxError> {
    match value {
        ParameterValue::Decimal(d) => Ok(*d),
        ParameterValue::Int(v) => Ok(Decimal::from(*v)),
        ParameterValue::BigInt(v) => Ok(Decimal::from(*v)),
        ParameterValue::Float(f) => Decimal::from_f64(*f).ok_or_else(|| mismatch(value, "numeric")),
        ParameterValue::Text(s) => Decimal::from_str(s.trim()).map_err(|_| mismatch(value, "numeric")),
        _ => Err(mismatch(value, "numeric")),
    }
}

fn as_datetime(value: &ParameterValue) -> Result<NaiveDateTime, BoxError> {
    match value {
        ParameterValue::DateTime(dt) => Ok(*dt),
        ParameterValue::Date(d) => Ok(d.and_time(NaiveTime::MIN)),
        ParameterValue::Text(s) => parse_datetime(s).ok_or_else(|| mismatch(value, "timestamp")),
        _ => Err(mismatch(value, "timestamp")),
    }
}

fn as_date(value: &ParameterValue) -> Result<NaiveDate, BoxError> {
    match value {
        ParameterValue::Date(d) => Ok(*d),
        other => as_datetime(other).map(|dt| dt.date()),
    }
}

fn as_uuid(value: &ParameterValue) -> Result<Uuid, BoxError> {
    match value {
        ParameterValue::Uuid(u) => Ok(*u),
        ParameterValue::Text(s) => Uuid::parse_str(s.trim()).map_err(|_| mismatch(value, "uuid")),
        _ => Err(mismatch(value, "uuid")),
    }
}

/// Wrap a driver error, keeping SQLSTATE and hint from the server
pub fn translate_error(err: tokio_postgres::Error) -> DatabaseError {
    if let Some(db) = err.as_db_error() {
        let mut message = format!("{} (SQLSTATE {})", db.message(), db.code().code());
        if let Some(hint) = db.hint() {
            message.push_str(&format!("; hint: {}", hint));
        }
        return DatabaseError::EngineExecution {
            engine: DatabaseType::Postgresql,
            code: None,
            message,
        };
    }
    if err.is_closed() {
        return DatabaseError::ConnectionFailed(err.to_string());
    }
    DatabaseError::EngineExecution {
        engine: DatabaseType::Postgresql,
        code: None,
        message: err.to_string(),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn qualified(routine: &RoutineDescriptor) -> String {
    match &routine.schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&routine.name)),
        None => quote_ident(&routine.name),
    }
}

// MS-SQL Driver
// Implements DatabaseDriver for SQL Server using tiberius

use crate::db::binding::{
    bind_declared, output_variable, rewrite_placeholders, BoundParameter, CallPlan, FetchMode,
    OutputBinding, PlaceholderStyle, PlannedStatement, TypeFamily,
};
use crate::db::connection::{open_mssql, ConnectionProvider, MssqlClient};
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
use std::sync::Arc;
use tiberius::numeric::Numeric;
use tiberius::{Column, ColumnType, Query, QueryItem, QueryStream, Row};
use uuid::Uuid;

const ROUTINE_CATALOG_QUERY: &str = r#"
    SELECT ROUTINE_SCHEMA, ROUTINE_NAME, ROUTINE_TYPE, DATA_TYPE
    FROM INFORMATION_SCHEMA.ROUTINES
    WHERE ROUTINE_NAME = @P1
"#;

const PARAMETER_CATALOG_QUERY: &str = r#"
    SELECT
        PARAMETER_NAME,
        PARAMETER_MODE,
        DATA_TYPE,
        CAST(CHARACTER_MAXIMUM_LENGTH AS BIGINT),
        CAST(NUMERIC_PRECISION AS BIGINT),
        CAST(NUMERIC_SCALE AS BIGINT),
        CAST(ORDINAL_POSITION AS INT)
    FROM INFORMATION_SCHEMA.PARAMETERS
    WHERE SPECIFIC_SCHEMA = @P1 AND SPECIFIC_NAME = @P2 AND ORDINAL_POSITION > 0
    ORDER BY ORDINAL_POSITION
"#;

/// MS-SQL specific connection wrapper
pub struct MssqlConnection {
    pub client: MssqlClient,
}

impl Connection for MssqlConnection {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// MS-SQL driver implementation
pub struct MssqlDriver {
    provider: Arc<dyn ConnectionProvider>,
}

impl MssqlDriver {
    /// Create a new MS-SQL driver
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self { provider }
    }

    fn client<'a>(conn: &'a mut dyn Connection) -> Result<&'a mut MssqlClient, DatabaseError> {
        conn.as_any_mut()
            .downcast_mut::<MssqlConnection>()
            .map(|c| &mut c.client)
            .ok_or(DatabaseError::InvalidConnection)
    }

    fn bind_function(routine: &RoutineDescriptor, params: &ParameterSet) -> CallPlan {
        let bound: Vec<BoundParameter> = routine
            .ordered_parameters()
            .into_iter()
            .filter(|p| p.direction.is_input())
            .map(|p| bind_declared(p, params.entry(&p.name)))
            .collect();

        let placeholders: Vec<String> = (1..=bound.len())
            .map(|i| PlaceholderStyle::AtPositional.render(i))
            .collect();
        let target = format!("{}({})", qualified(routine), placeholders.join(", "));

        let sql = if routine.returns_table {
            format!("SELECT * FROM {}", target)
        } else {
            format!("SELECT {} AS [result]", target)
        };

        CallPlan::single(sql, bound, FetchMode::Rows)
    }

    fn bind_procedure(routine: &RoutineDescriptor, params: &ParameterSet) -> CallPlan {
        let mut declarations = Vec::new();
        let mut arguments = Vec::new();
        let mut bound = Vec::new();
        let mut outputs = Vec::new();

        for param in routine.ordered_parameters() {
            let binding = bind_declared(param, params.entry(&param.name));

            if param.direction.is_output() {
                let variable = output_variable(&param.name);
                let declared = declared_type_sql(param);
                if param.direction.is_input() {
                    bound.push(binding);
                    declarations.push(format!(
                        "DECLARE @{} {} = {};",
                        variable,
                        declared,
                        PlaceholderStyle::AtPositional.render(bound.len())
                    ));
                } else {
                    declarations.push(format!("DECLARE @{} {};", variable, declared));
                }
                arguments.push(format!("@{} = @{} OUTPUT", param.name, variable));
                outputs.push(OutputBinding {
                    parameter: param.name.clone(),
                    variable,
                    data_type: param.data_type.clone(),
                });
            } else {
                bound.push(binding);
                arguments.push(format!(
                    "@{} = {}",
                    param.name,
                    PlaceholderStyle::AtPositional.render(bound.len())
                ));
            }
        }

        let mut sql = String::new();
        for declaration in &declarations {
            sql.push_str(declaration);
            sql.push('\n');
        }
        sql.push_str(&format!("EXEC {}", qualified(routine)));
        if !arguments.is_empty() {
            sql.push(' ');
            sql.push_str(&arguments.join(", "));
        }
        sql.push(';');

        if !outputs.is_empty() {
            let selected: Vec<String> = outputs
                .iter()
                .map(|o| format!("@{} AS {}", o.variable, quote_ident(&o.parameter)))
                .collect();
            sql.push_str(&format!("\nSELECT {};", selected.join(", ")));
        }

        CallPlan {
            setup: Vec::new(),
            call: PlannedStatement::new(sql, bound),
            harvest: None,
            outputs,
            fetch: FetchMode::Rows,
        }
    }

    /// Convert Tiberius ColumnType to string
    fn column_type_to_string(col_type: &ColumnType) -> String {
        match col_type {
            ColumnType::Int1 => "tinyint".to_string(),
            ColumnType::Int2 => "smallint".to_string(),
            ColumnType::Int4 => "int".to_string(),
            ColumnType::Int8 => "bigint".to_string(),
            ColumnType::Intn => "int".to_string(),
            ColumnType::Float4 => "real".to_string(),
            ColumnType::Float8 => "float".to_string(),
            ColumnType::Floatn => "float".to_string(),
            ColumnType::Decimaln | ColumnType::Numericn => "decimal".to_string(),
            ColumnType::Money | ColumnType::Money4 => "money".to_string(),
            ColumnType::Bit | ColumnType::Bitn => "bit".to_string(),
            ColumnType::BigVarChar | ColumnType::BigChar | ColumnType::NVarchar | ColumnType::NChar
            | ColumnType::Text | ColumnType::NText => "nvarchar".to_string(),
            ColumnType::Datetime | ColumnType::Datetime2 | ColumnType::Datetimen => "datetime".to_string(),
            ColumnType::Datetime4 => "smalldatetime".to_string(),
            ColumnType::Daten => "date".to_string(),
            ColumnType::Timen => "time".to_string(),
            ColumnType::DatetimeOffsetn => "datetimeoffset".to_string(),
            ColumnType::Guid => "uniqueidentifier".to_string(),
            ColumnType::Xml => "xml".to_string(),
            ColumnType::Null => "null".to_string(),
            _ => format!("{:?}", col_type).to_lowercase(),
        }
    }

    /// Extract cell value from row
    fn cell_value_from_row(row: &Row, idx: usize) -> CellValue {
        let col_type = row
            .columns()
            .get(idx)
            .map(|c| c.column_type())
            .unwrap_or(ColumnType::Null);

        match col_type {
            ColumnType::Null => CellValue::Null,

            // Integer types
            ColumnType::Int1 => row
                .try_get::<u8, _>(idx)
                .ok()
                .flatten()
                .map(|v| CellValue::Int(v as i64))
                .unwrap_or(CellValue::Null),
            ColumnType::Int2 => row
                .try_get::<i16, _>(idx)
                .ok()
                .flatten()
                .map(|v| CellValue::Int(v as i64))
                .unwrap_or(CellValue::Null),
            ColumnType::Int4 => row
                .try_get::<i32, _>(idx)
                .ok()
                .flatten()
                .map(|v| CellValue::Int(v as i64))
                .unwrap_or(CellValue::Null),
            ColumnType::Int8 => row
                .try_get::<i64, _>(idx)
                .ok()
                .flatten()
                .map(CellValue::Int)
                .unwrap_or(CellValue::Null),
            ColumnType::Intn => row
                .try_get::<i64, _>(idx)
                .ok()
                .flatten()
                .map(CellValue::Int)
                .or_else(|| row.try_get::<i32, _>(idx).ok().flatten().map(|v| CellValue::Int(v as i64)))
                .or_else(|| row.try_get::<i16, _>(idx).ok().flatten().map(|v| CellValue::Int(v as i64)))
                .or_else(|| row.try_get::<u8, _>(idx).ok().flatten().map(|v| CellValue::Int(v as i64)))
                .unwrap_or(CellValue::Null),

            // Float types
            ColumnType::Float4 => row
                .try_get::<f32, _>(idx)
                .ok()
                .flatten()
                .map(|v| CellValue::Float(v as f64))
                .unwrap_or(CellValue::Null),
            ColumnType::Float8 | ColumnType::Money | ColumnType::Money4 => row
                .try_get::<f64, _>(idx)
                .ok()
                .flatten()
                .map(CellValue::Float)
                .unwrap_or(CellValue::Null),
            ColumnType::Floatn => row
                .try_get::<f64, _>(idx)
                .ok()
                .flatten()
                .map(CellValue::Float)
                .or_else(|| row.try_get::<f32, _>(idx).ok().flatten().map(|v| CellValue::Float(v as f64)))
                .unwrap_or(CellValue::Null),

            // Decimal/Numeric types keep their exact text
            ColumnType::Decimaln | ColumnType::Numericn => row
                .try_get::<Decimal, _>(idx)
                .ok()
                .flatten()
                .map(|d| CellValue::String(d.to_string()))
                .unwrap_or(CellValue::Null),

            // Boolean
            ColumnType::Bit | ColumnType::Bitn => row
                .try_get::<bool, _>(idx)
                .ok()
                .flatten()
                .map(CellValue::Bool)
                .unwrap_or(CellValue::Null),

            // String types
            ColumnType::BigVarChar | ColumnType::BigChar | ColumnType::NVarchar | ColumnType::NChar
            | ColumnType::Text | ColumnType::NText => row
                .try_get::<&str, _>(idx)
                .ok()
                .flatten()
                .map(|s| CellValue::String(s.to_string()))
                .unwrap_or(CellValue::Null),

            // Date/Time types
            ColumnType::Datetime | ColumnType::Datetime2 | ColumnType::Datetimen | ColumnType::Datetime4 => row
                .try_get::<NaiveDateTime, _>(idx)
                .ok()
                .flatten()
                .map(|dt| CellValue::DateTime(dt.to_string()))
                .unwrap_or(CellValue::Null),
            ColumnType::DatetimeOffsetn => row
                .try_get::<DateTime<Utc>, _>(idx)
                .ok()
                .flatten()
                .map(|dt| CellValue::DateTime(dt.to_rfc3339()))
                .unwrap_or(CellValue::Null),
            ColumnType::Daten => row
                .try_get::<NaiveDate, _>(idx)
                .ok()
                .flatten()
                .map(|d| CellValue::DateTime(d.to_string()))
                .unwrap_or(CellValue::Null),
            ColumnType::Timen => row
                .try_get::<NaiveTime, _>(idx)
                .ok()
                .flatten()
                .map(|t| CellValue::DateTime(t.to_string()))
                .unwrap_or(CellValue::Null),

            // Binary types
            ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => row
                .try_get::<&[u8], _>(idx)
                .ok()
                .flatten()
                .map(|b| CellValue::Binary(b.to_vec()))
                .unwrap_or(CellValue::Null),

            // GUID
            ColumnType::Guid => row
                .try_get::<Uuid, _>(idx)
                .ok()
                .flatten()
                .map(|u| CellValue::String(u.to_string()))
                .unwrap_or(CellValue::Null),

            // XML
            ColumnType::Xml => row
                .try_get::<&tiberius::xml::XmlData, _>(idx)
                .ok()
                .flatten()
                .map(|xml| CellValue::String(xml.to_owned().into_string()))
                .unwrap_or(CellValue::Null),

            _ => CellValue::Null,
        }
    }

    fn result_columns(columns: &[Column]) -> Vec<ResultColumn> {
        columns
            .iter()
            .map(|col| ResultColumn::new(col.name(), Self::column_type_to_string(&col.column_type())))
            .collect()
    }

    fn materialize(set: &ResultSet) -> (Vec<ResultColumn>, Vec<Vec<CellValue>>) {
        let values = set
            .rows
            .iter()
            .map(|row| {
                (0..row.columns().len())
                    .map(|idx| Self::cell_value_from_row(row, idx))
                    .collect()
            })
            .collect();

        (Self::result_columns(&set.columns), values)
    }
}

/// One result set with its column metadata, kept even when it has no rows
struct ResultSet {
    columns: Vec<Column>,
    rows: Vec<Row>,
}

async fn collect_result_sets(mut stream: QueryStream<'_>) -> Result<Vec<ResultSet>, DatabaseError> {
    let mut sets: Vec<ResultSet> = Vec::new();

    while let Some(item) = stream.try_next().await.map_err(translate_error)? {
        match item {
            QueryItem::Metadata(meta) => sets.push(ResultSet {
                columns: meta.columns().to_vec(),
                rows: Vec::new(),
            }),
            QueryItem::Row(row) => match sets.last_mut() {
                Some(set) => set.rows.push(row),
                None => sets.push(ResultSet {
                    columns: row.columns().to_vec(),
                    rows: vec![row],
                }),
            },
        }
    }

    Ok(sets)
}

#[async_trait::async_trait]
impl DatabaseDriver for MssqlDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mssql
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, DatabaseError> {
        let connection_string = self.provider.connection_string()?;
        let client = open_mssql(&connection_string).await?;
        Ok(Box::new(MssqlConnection { client }))
    }

    async fn resolve_routine(
        &self,
        conn: &mut dyn Connection,
        name: &RoutineName,
        schema_hint: Option<&str>,
    ) -> Result<RoutineDescriptor, DatabaseError> {
        let client = Self::client(conn)?;

        let rows = client
            .query(ROUTINE_CATALOG_QUERY, &[&name.name.as_str()])
            .await
            .map_err(translate_error)?
            .into_first_result()
            .await
            .map_err(translate_error)?;

        let matches: Vec<CatalogMatch> = rows
            .iter()
            .map(|row| CatalogMatch {
                schema: row.get::<&str, _>(0).unwrap_or("").to_string(),
                name: row.get::<&str, _>(1).unwrap_or("").to_string(),
                routine_type: row.get::<&str, _>(2).unwrap_or("").to_string(),
                detail: row.get::<&str, _>(3).map(|s| s.to_string()),
            })
            .collect();

        let found = select_match(&matches, name, schema_hint, self.database_type().default_schema())
            .ok_or_else(|| DatabaseError::RoutineNotFound(name.to_string()))?
            .clone();

        let rows = client
            .query(PARAMETER_CATALOG_QUERY, &[&found.schema.as_str(), &found.name.as_str()])
            .await
            .map_err(translate_error)?
            .into_first_result()
            .await
            .map_err(translate_error)?;

        let parameters = rows
            .iter()
            .map(|row| {
                let mut param = RoutineParameter::new(
                    row.get::<&str, _>(0).unwrap_or(""),
                    ParameterDirection::from_catalog(row.get::<&str, _>(1)),
                    row.get::<&str, _>(2).unwrap_or(""),
                    row.get::<i32, _>(6).unwrap_or(0),
                );
                param.max_length = row.get::<i64, _>(3);
                param.precision = row.get::<i64, _>(4);
                param.scale = row.get::<i64, _>(5);
                param
            })
            .collect();

        Ok(RoutineDescriptor {
            schema: Some(found.schema),
            name: found.name,
            kind: RoutineKind::from_catalog(&found.routine_type),
            returns_table: found.detail.as_deref().map(|d| d.eq_ignore_ascii_case("TABLE")).unwrap_or(false),
            parameters,
        })
    }

    fn bind_query(&self, sql: &str, params: &ParameterSet) -> Result<CallPlan, DatabaseError> {
        let (sql, bound) = rewrite_placeholders(sql, params, PlaceholderStyle::AtPositional);
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

        let mut query = Query::new(plan.call.sql.clone());
        for param in &plan.call.parameters {
            bind_parameter(&mut query, param);
        }

        let mut result = match plan.fetch {
            FetchMode::Execute => {
                let executed = query.execute(client).await.map_err(translate_error)?;
                let mut result = TabularResult::new(String::new());
                result.rows_affected = Some(executed.total());
                result
            }
            FetchMode::Rows => {
                let stream = query.query(client).await.map_err(translate_error)?;
                let mut result_sets = collect_result_sets(stream).await?;

                // output values arrive as the trailing single-row result set
                let harvested = if plan.outputs.is_empty() {
                    None
                } else {
                    result_sets.pop()
                };

                let mut result = match result_sets.first() {
                    Some(set) => {
                        let (columns, rows) = Self::materialize(set);
                        TabularResult::with_rows(columns, rows)
                    }
                    None => TabularResult::with_rows(Vec::new(), Vec::new()),
                };

                if let Some(harvested) = harvested {
                    let (columns, mut rows) = Self::materialize(&harvested);
                    if let Some(values) = rows.pop() {
                        result.merge_outputs(columns, values);
                    }
                }
                result
            }
        };

        result.execution_time_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }
}

/// Bind one value; nulls carry a type matching the declared family
fn bind_parameter(query: &mut Query<'_>, param: &BoundParameter) {
    match &param.value {
        ParameterValue::Null => match param.family {
            Some(TypeFamily::Integer) => query.bind(Option::<i64>::None),
            Some(TypeFamily::Decimal) => query.bind(Option::<Numeric>::None),
            Some(TypeFamily::Float) => query.bind(Option::<f64>::None),
            Some(TypeFamily::Boolean) => query.bind(Option::<bool>::None),
            Some(TypeFamily::Date) => query.bind(Option::<NaiveDate>::None),
            Some(TypeFamily::DateTime) => query.bind(Option::<NaiveDateTime>::None),
            Some(TypeFamily::Uuid) => query.bind(Option::<Uuid>::None),
            Some(TypeFamily::Binary) => query.bind(Option::<Vec<u8>>::None),
            _ => query.bind(Option::<String>::None),
        },
        ParameterValue::Bool(b) => query.bind(*b),
        ParameterValue::Int(v) => query.bind(*v),
        ParameterValue::BigInt(v) => query.bind(*v),
        ParameterValue::Float(v) => query.bind(*v),
        ParameterValue::Decimal(d) => query.bind(to_numeric(d)),
        ParameterValue::DateTime(dt) => query.bind(*dt),
        ParameterValue::Date(d) => query.bind(*d),
        ParameterValue::Uuid(u) => query.bind(*u),
        ParameterValue::Text(s) | ParameterValue::Json(s) => query.bind(s.clone()),
    }
}

/// Same digits and scale as a tiberius `Numeric`, which is what `Query::bind` accepts
fn to_numeric(d: &Decimal) -> Numeric {
    Numeric::new_with_scale(d.mantissa(), d.scale() as u8)
}

/// Wrap a driver error, prefixing known server error numbers with an explanation
pub fn translate_error(err: tiberius::error::Error) -> DatabaseError {
    match &err {
        tiberius::error::Error::Server(token) => {
            let code = token.code();
            let message = match describe_error_code(code) {
                Some(hint) => format!("{}: {}", hint, token.message()),
                None => token.message().to_string(),
            };
            DatabaseError::EngineExecution {
                engine: DatabaseType::Mssql,
                code: Some(code as i64),
                message,
            }
        }
        tiberius::error::Error::Io { .. } => DatabaseError::ConnectionFailed(err.to_string()),
        _ => DatabaseError::EngineExecution {
            engine: DatabaseType::Mssql,
            code: None,
            message: err.to_string(),
        },
    }
}

/// Human-readable explanation for common SQL Server error numbers
pub fn describe_error_code(code: u32) -> Option<&'static str> {
    match code {
        102 => Some("Syntax error near a symbol or identifier"),
        156 => Some("Syntax error near a reserved keyword"),
        170 => Some("Syntax error in statement"),
        207 => Some("Invalid column name; check the column exists in the referenced table"),
        208 => Some("Invalid object name; the table, view or function does not exist"),
        2812 => Some("Stored procedure not found"),
        18488 => Some("Password expired; change it with another tool"),
        _ => None,
    }
}

/// Type declaration usable in `DECLARE`, e.g. `nvarchar(max)` or `decimal(10,2)`
fn declared_type_sql(param: &RoutineParameter) -> String {
    let base = param.data_type.to_ascii_lowercase();
    match base.as_str() {
        "char" | "varchar" | "nchar" | "nvarchar" | "binary" | "varbinary" => match param.max_length {
            Some(-1) => format!("{}(max)", base),
            Some(len) if len > 0 => format!("{}({})", base, len),
            _ => base,
        },
        "decimal" | "numeric" => match (param.precision, param.scale) {
            (Some(p), Some(s)) => format!("{}({},{})", base, p, s),
            (Some(p), None) => format!("{}({})", base, p),
            _ => base,
        },
        _ => base,
    }
}

fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn qualified(routine: &RoutineDescriptor) -> String {
    match &routine.schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&routine.name)),
        None => quote_ident(&routine.name),
    }
}

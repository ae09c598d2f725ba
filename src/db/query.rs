// Query Execution Engine
// Stateless facade running ad-hoc queries and routines end-to-end

use crate::db::routine::RoutineName;
use crate::db::safety::{self, ForbiddenTablePolicy};
use crate::db::traits::{DatabaseDriver, DatabaseError, DatabaseType, TabularResult};
use crate::params::{apply_hashing, normalize_json, BcryptScheme, HashScheme, ParameterSet, SensitiveFieldSpec};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Executes calls against the configured engine.
///
/// Every call opens its own connection and drops it when the call ends, so a
/// single engine can serve any number of concurrent callers.
pub struct QueryEngine {
    driver: Arc<dyn DatabaseDriver>,
    forbidden: Arc<dyn ForbiddenTablePolicy>,
    hash_scheme: Arc<dyn HashScheme>,
    schema_hint: Option<String>,
    command_timeout: Option<Duration>,
}

impl QueryEngine {
    pub fn new(driver: Arc<dyn DatabaseDriver>, forbidden: Arc<dyn ForbiddenTablePolicy>) -> Self {
        Self {
            driver,
            forbidden,
            hash_scheme: Arc::new(BcryptScheme::default()),
            schema_hint: None,
            command_timeout: None,
        }
    }

    pub fn with_hash_scheme(mut self, scheme: Arc<dyn HashScheme>) -> Self {
        self.hash_scheme = scheme;
        self
    }

    /// Schema tried first for unqualified routine names
    pub fn with_schema_hint(mut self, schema: Option<String>) -> Self {
        self.schema_hint = schema.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn database_type(&self) -> DatabaseType {
        self.driver.database_type()
    }

    /// Check an ad-hoc query against the read-only policy without executing it
    pub fn validate_query(&self, sql: &str) -> (bool, Option<String>) {
        safety::validate_query(sql, self.forbidden.forbidden_tables())
    }

    /// Run a read-only ad-hoc query with `@name` placeholders
    pub async fn execute_query(&self, sql: &str, params: ParameterSet) -> Result<TabularResult, DatabaseError> {
        safety::validate(sql, self.forbidden.forbidden_tables())?;
        self.run_query(sql, params).await
    }

    /// Same as [`execute_query`](Self::execute_query) with parameters given as a JSON object.
    ///
    /// The query is validated before the parameters are normalized.
    pub async fn execute_query_json(&self, sql: &str, body: Value) -> Result<TabularResult, DatabaseError> {
        safety::validate(sql, self.forbidden.forbidden_tables())?;
        let params = normalize_json(body)?;
        self.run_query(sql, params).await
    }

    /// Run a stored function or procedure, hashing the designated fields first
    pub async fn execute_routine(
        &self,
        name: &str,
        params: ParameterSet,
        sensitive: Option<&SensitiveFieldSpec>,
    ) -> Result<TabularResult, DatabaseError> {
        let routine = RoutineName::parse(name)?;
        let query_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "execute_routine",
            query_id = %query_id,
            engine = %self.database_type(),
            routine = %routine
        );

        async move {
            let params = match sensitive.filter(|spec| !spec.is_empty()) {
                Some(spec) => self.hash_parameters(params, spec.clone()).await?,
                None => params,
            };
            debug!(parameters = ?params.names(), "executing routine");

            let driver = &self.driver;
            let schema_hint = self.schema_hint.as_deref();
            let execution = async {
                let mut conn = driver.connect().await?;
                let descriptor = driver.resolve_routine(conn.as_mut(), &routine, schema_hint).await?;
                debug!(
                    resolved = %descriptor.qualified_name(),
                    kind = ?descriptor.kind,
                    declared = descriptor.parameters.len(),
                    "resolved routine"
                );
                let plan = driver.bind_routine(&descriptor, &params)?;
                driver.invoke(conn.as_mut(), &plan).await
            };

            let result = self.run_with_timeout(execution).await;
            Self::finish(result, query_id)
        }
        .instrument(span)
        .await
    }

    /// Same as [`execute_routine`](Self::execute_routine) with parameters given as a JSON object
    pub async fn execute_routine_json(
        &self,
        name: &str,
        body: Value,
        sensitive: Option<&SensitiveFieldSpec>,
    ) -> Result<TabularResult, DatabaseError> {
        let params = normalize_json(body)?;
        self.execute_routine(name, params, sensitive).await
    }

    async fn run_query(&self, sql: &str, params: ParameterSet) -> Result<TabularResult, DatabaseError> {
        let query_id = Uuid::new_v4().to_string();
        let span = info_span!("execute_query", query_id = %query_id, engine = %self.database_type());

        async move {
            debug!(parameters = ?params.names(), "executing ad-hoc query");
            let plan = self.driver.bind_query(sql, &params)?;

            let driver = &self.driver;
            let execution = async {
                let mut conn = driver.connect().await?;
                driver.invoke(conn.as_mut(), &plan).await
            };

            let result = self.run_with_timeout(execution).await;
            Self::finish(result, query_id)
        }
        .instrument(span)
        .await
    }

    /// bcrypt is CPU bound, keep it off the async workers
    async fn hash_parameters(
        &self,
        params: ParameterSet,
        spec: SensitiveFieldSpec,
    ) -> Result<ParameterSet, DatabaseError> {
        let scheme = Arc::clone(&self.hash_scheme);
        tokio::task::spawn_blocking(move || apply_hashing(params, &spec, scheme.as_ref()))
            .await
            .map_err(|e| DatabaseError::Hashing(e.to_string()))?
    }

    async fn run_with_timeout<T>(
        &self,
        work: impl Future<Output = Result<T, DatabaseError>>,
    ) -> Result<T, DatabaseError> {
        match self.command_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "command timed out");
                    Err(DatabaseError::Timeout)
                }
            },
            None => work.await,
        }
    }

    fn finish(
        result: Result<TabularResult, DatabaseError>,
        query_id: String,
    ) -> Result<TabularResult, DatabaseError> {
        match result {
            Ok(mut result) => {
                result.query_id = query_id;
                info!(
                    rows = result.row_count,
                    rows_affected = ?result.rows_affected,
                    elapsed_ms = result.execution_time_ms,
                    "execution completed"
                );
                Ok(result)
            }
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "execution failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::binding::{bind_declared, rewrite_placeholders, CallPlan, FetchMode, PlaceholderStyle};
    use crate::db::routine::{ParameterDirection, RoutineDescriptor, RoutineKind, RoutineParameter};
    use crate::db::traits::{CellValue, Connection, ResultColumn};
    use crate::params::ParameterValue;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockConnection;

    impl Connection for MockConnection {
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    /// In-memory driver: echoes bound parameter values back as a single row
    #[derive(Default)]
    struct MockDriver {
        routine: Option<RoutineDescriptor>,
        delay: Option<Duration>,
        connects: AtomicUsize,
        plans: Mutex<Vec<CallPlan>>,
    }

    impl MockDriver {
        fn with_routine(routine: RoutineDescriptor) -> Self {
            Self {
                routine: Some(routine),
                ..Default::default()
            }
        }

        fn last_plan(&self) -> CallPlan {
            self.plans.lock().unwrap().last().cloned().expect("no plan executed")
        }
    }

    #[async_trait::async_trait]
    impl DatabaseDriver for MockDriver {
        fn database_type(&self) -> DatabaseType {
            DatabaseType::Mssql
        }

        async fn connect(&self) -> Result<Box<dyn Connection>, DatabaseError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockConnection))
        }

        async fn resolve_routine(
            &self,
            _conn: &mut dyn Connection,
            name: &RoutineName,
            _schema_hint: Option<&str>,
        ) -> Result<RoutineDescriptor, DatabaseError> {
            self.routine
                .clone()
                .filter(|r| r.name.eq_ignore_ascii_case(&name.name))
                .ok_or_else(|| DatabaseError::RoutineNotFound(name.to_string()))
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
            let bound = routine
                .ordered_parameters()
                .into_iter()
                .map(|p| bind_declared(p, params.entry(&p.name)))
                .collect();
            Ok(CallPlan::single(format!("EXEC {}", routine.name), bound, FetchMode::Rows))
        }

        async fn invoke(
            &self,
            _conn: &mut dyn Connection,
            plan: &CallPlan,
        ) -> Result<TabularResult, DatabaseError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.plans.lock().unwrap().push(plan.clone());

            let columns = plan
                .call
                .parameters
                .iter()
                .map(|p| ResultColumn::new(p.name.clone(), p.value.kind()))
                .collect();
            let row = plan
                .call
                .parameters
                .iter()
                .map(|p| p.value.to_text().map(CellValue::String).unwrap_or(CellValue::Null))
                .collect();
            Ok(TabularResult::with_rows(columns, vec![row]))
        }
    }

    fn login_routine() -> RoutineDescriptor {
        let mut email = RoutineParameter::new("@email", ParameterDirection::In, "nvarchar", 1);
        email.max_length = Some(100);
        let mut password = RoutineParameter::new("@password", ParameterDirection::In, "nvarchar", 2);
        password.max_length = Some(200);
        RoutineDescriptor {
            schema: Some("dbo".to_string()),
            name: "usp_login".to_string(),
            kind: RoutineKind::Procedure,
            returns_table: false,
            parameters: vec![email, password],
        }
    }

    fn engine(driver: Arc<MockDriver>) -> QueryEngine {
        let forbidden: Arc<dyn ForbiddenTablePolicy> = Arc::new(vec!["usuarios".to_string()]);
        QueryEngine::new(driver, forbidden).with_hash_scheme(Arc::new(BcryptScheme::new(4)))
    }

    #[tokio::test]
    async fn test_rejected_query_never_connects() {
        let driver = Arc::new(MockDriver::default());
        let engine = engine(driver.clone());

        let result = engine.execute_query("DELETE FROM productos", ParameterSet::new()).await;
        assert!(matches!(result, Err(DatabaseError::StatementNotAllowed)));

        let result = engine
            .execute_query_json("SELECT * FROM Usuarios WHERE id=@id", json!({"id": 1}))
            .await;
        assert!(matches!(result, Err(DatabaseError::ForbiddenTable(_))));

        assert_eq!(driver.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_parameter_name_fails_before_connect() {
        let driver = Arc::new(MockDriver::default());
        let engine = engine(driver.clone());

        let result = engine.execute_query_json("SELECT 1", json!({"bad name": 1})).await;
        assert!(matches!(result, Err(DatabaseError::InvalidParameterName(_))));
        assert_eq!(driver.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_query_binds_placeholders() {
        let driver = Arc::new(MockDriver::default());
        let engine = engine(driver.clone());

        let result = engine
            .execute_query_json(
                "SELECT * FROM productos WHERE id = @id OR parent = @id",
                json!({"@id": "42"}),
            )
            .await
            .unwrap();

        let plan = driver.last_plan();
        assert_eq!(plan.call.sql, "SELECT * FROM productos WHERE id = @P1 OR parent = @P1");
        assert_eq!(plan.call.parameters.len(), 1);
        assert_eq!(plan.call.parameters[0].value, ParameterValue::Int(42));

        assert!(Uuid::parse_str(&result.query_id).is_ok());
        assert_eq!(result.row_count, 1);
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_routine_hashes_sensitive_fields() {
        let driver = Arc::new(MockDriver::with_routine(login_routine()));
        let engine = engine(driver.clone());
        let spec = SensitiveFieldSpec::new(["password"]);

        engine
            .execute_routine_json(
                "dbo.usp_login",
                json!({"@email": "a@b.com", "@password": 123456}),
                Some(&spec),
            )
            .await
            .unwrap();

        let plan = driver.last_plan();
        assert_eq!(plan.call.parameters[0].value, ParameterValue::Text("a@b.com".to_string()));
        match &plan.call.parameters[1].value {
            ParameterValue::Text(hash) => assert!(hash.starts_with("$2")),
            other => panic!("expected hashed text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_routine_without_spec_keeps_values() {
        let driver = Arc::new(MockDriver::with_routine(login_routine()));
        let engine = engine(driver.clone());

        engine
            .execute_routine_json("usp_login", json!({"password": "secret"}), None)
            .await
            .unwrap();

        let plan = driver.last_plan();
        // absent email binds as null
        assert_eq!(plan.call.parameters[0].value, ParameterValue::Null);
        assert_eq!(plan.call.parameters[1].value, ParameterValue::Text("secret".to_string()));
    }

    #[tokio::test]
    async fn test_routine_with_no_declared_parameters() {
        let routine = RoutineDescriptor {
            parameters: Vec::new(),
            ..login_routine()
        };
        let driver = Arc::new(MockDriver::with_routine(routine));
        let engine = engine(driver.clone());

        let result = engine
            .execute_routine_json("usp_login", json!({"unused": 1}), None)
            .await
            .unwrap();
        assert!(driver.last_plan().call.parameters.is_empty());
        assert_eq!(result.columns.len(), 0);
    }

    #[tokio::test]
    async fn test_routine_not_found() {
        let driver = Arc::new(MockDriver::with_routine(login_routine()));
        let engine = engine(driver);

        let result = engine.execute_routine("usp_missing", ParameterSet::new(), None).await;
        assert!(matches!(result, Err(DatabaseError::RoutineNotFound(_))));
    }

    #[tokio::test]
    async fn test_timeout_aborts_call() {
        let driver = Arc::new(MockDriver {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        let engine = engine(driver.clone()).with_timeout(Some(Duration::from_millis(10)));

        let result = engine.execute_query("SELECT 1", ParameterSet::new()).await;
        assert!(matches!(result, Err(DatabaseError::Timeout)));
        assert!(driver.plans.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_applies_to_routines() {
        let driver = Arc::new(MockDriver {
            routine: Some(login_routine()),
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        let engine = engine(driver).with_timeout(Some(Duration::from_millis(10)));

        let result = engine.execute_routine_json("usp_login", json!({}), None).await;
        assert!(matches!(result, Err(DatabaseError::Timeout)));
    }

    #[tokio::test]
    async fn test_no_timeout_waits_for_call() {
        let driver = Arc::new(MockDriver {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let engine = engine(driver.clone()).with_timeout(None);

        let result = engine.execute_query("SELECT 1", ParameterSet::new()).await;
        assert!(result.is_ok());
        assert_eq!(driver.plans.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_routine_hashes_and_binds_caller_strings() {
        let driver = Arc::new(MockDriver::with_routine(login_routine()));
        let engine = engine(driver.clone());
        let spec = SensitiveFieldSpec::new(["password"]);

        engine
            .execute_routine_json("usp_login", json!({"email": "007", "password": "0123"}), Some(&spec))
            .await
            .unwrap();

        let plan = driver.last_plan();
        assert_eq!(plan.call.parameters[0].value, ParameterValue::Text("007".to_string()));
        let hashed = plan.call.parameters[1].value.as_str().unwrap();
        assert!(bcrypt::verify("0123", hashed).unwrap());
    }

    #[test]
    fn test_validate_query_uses_policy() {
        let engine = engine(Arc::new(MockDriver::default()));
        assert_eq!(engine.validate_query("SELECT 1"), (true, None));
        assert!(!engine.validate_query("select * from USUARIOS").0);
    }

    #[test]
    fn test_blank_schema_hint_ignored() {
        let engine = engine(Arc::new(MockDriver::default())).with_schema_hint(Some("  ".to_string()));
        assert!(engine.schema_hint.is_none());
    }
}

// Bridge Configuration
// TOML settings selecting the engine, the read-only policy and the hashing setup

use crate::db::connection::ConnectionProvider;
use crate::db::drivers::create_driver;
use crate::db::query::QueryEngine;
use crate::db::safety::ForbiddenTablePolicy;
use crate::db::traits::{DatabaseError, DatabaseType};
use crate::params::hashing::DEFAULT_BCRYPT_COST;
use crate::params::{BcryptScheme, SensitiveFieldSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const ENV_PROVIDER: &str = "SQL_BRIDGE_PROVIDER";
pub const ENV_CONNECTION_STRING: &str = "SQL_BRIDGE_CONNECTION_STRING";

/// Range accepted by bcrypt
const BCRYPT_COST_RANGE: std::ops::RangeInclusive<u32> = 4..=31;

#[derive(Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub provider: DatabaseType,
    #[serde(default, skip_serializing)]
    pub connection_string: String,
    #[serde(default)]
    pub forbidden_tables: Vec<String>,
    #[serde(default)]
    pub sensitive_fields: Vec<String>,
    #[serde(default)]
    pub default_schema: Option<String>,
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
}

fn default_bcrypt_cost() -> u32 {
    DEFAULT_BCRYPT_COST
}

// Connection strings carry credentials
impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("provider", &self.provider)
            .field("connection_string", &"<redacted>")
            .field("forbidden_tables", &self.forbidden_tables)
            .field("sensitive_fields", &self.sensitive_fields)
            .field("default_schema", &self.default_schema)
            .field("bcrypt_cost", &self.bcrypt_cost)
            .field("command_timeout_secs", &self.command_timeout_secs)
            .finish()
    }
}

impl BridgeConfig {
    /// Load from a TOML file, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self, DatabaseError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DatabaseError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        tracing::debug!(provider = %config.provider, path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, DatabaseError> {
        toml::from_str(content).map_err(|e| DatabaseError::InvalidConfig(e.to_string()))
    }

    /// Override provider and connection string from the environment
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), DatabaseError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provider) = lookup(ENV_PROVIDER).filter(|v| !v.trim().is_empty()) {
            self.provider = provider.parse()?;
        }
        if let Some(connection_string) = lookup(ENV_CONNECTION_STRING).filter(|v| !v.trim().is_empty()) {
            self.connection_string = connection_string;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DatabaseError> {
        if self.connection_string.trim().is_empty() {
            return Err(DatabaseError::InvalidConfig(format!(
                "connection_string is required (or set {})",
                ENV_CONNECTION_STRING
            )));
        }
        if !BCRYPT_COST_RANGE.contains(&self.bcrypt_cost) {
            return Err(DatabaseError::InvalidConfig(format!(
                "bcrypt_cost must be between {} and {}, got {}",
                BCRYPT_COST_RANGE.start(),
                BCRYPT_COST_RANGE.end(),
                self.bcrypt_cost
            )));
        }
        Ok(())
    }

    pub fn sensitive_field_spec(&self) -> SensitiveFieldSpec {
        SensitiveFieldSpec::new(&self.sensitive_fields)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    /// Build the execution engine for the configured provider
    pub fn into_engine(self) -> Result<QueryEngine, DatabaseError> {
        self.validate()?;
        let config = Arc::new(self);

        let driver = create_driver(config.provider, config.clone());
        let engine = QueryEngine::new(driver, config.clone())
            .with_hash_scheme(Arc::new(BcryptScheme::new(config.bcrypt_cost)))
            .with_schema_hint(config.default_schema.clone())
            .with_timeout(config.command_timeout());
        Ok(engine)
    }
}

impl ConnectionProvider for BridgeConfig {
    fn connection_string(&self) -> Result<String, DatabaseError> {
        self.connection_string.connection_string()
    }
}

impl ForbiddenTablePolicy for BridgeConfig {
    fn forbidden_tables(&self) -> &[String] {
        &self.forbidden_tables
    }
}

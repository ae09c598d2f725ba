// Database Drivers
// SQL Server, PostgreSQL and MySQL implementations of DatabaseDriver

pub mod mssql;
pub mod mysql;
pub mod postgres;

// Re-export drivers
pub use mssql::MssqlDriver;
pub use mysql::MysqlDriver;
pub use postgres::PostgresDriver;

use crate::db::connection::ConnectionProvider;
use crate::db::traits::{DatabaseDriver, DatabaseType};
use std::sync::Arc;

/// Build the driver for the configured provider
pub fn create_driver(
    database_type: DatabaseType,
    provider: Arc<dyn ConnectionProvider>,
) -> Arc<dyn DatabaseDriver> {
    tracing::debug!(provider = %database_type, "creating database driver");
    match database_type {
        DatabaseType::Mssql => Arc::new(MssqlDriver::new(provider)),
        DatabaseType::Postgresql => Arc::new(PostgresDriver::new(provider)),
        DatabaseType::Mysql => Arc::new(MysqlDriver::new(provider)),
    }
}

// Database Module
// Routine resolution, parameter binding and execution across SQL Server, PostgreSQL and MySQL

pub mod binding;
pub mod connection;
pub mod drivers;
pub mod query;
pub mod routine;
pub mod safety;
pub mod traits;

pub use binding::{BoundParameter, CallPlan, FetchMode, TypeFamily};
pub use connection::ConnectionProvider;
pub use drivers::{create_driver, MssqlDriver, MysqlDriver, PostgresDriver};
pub use query::QueryEngine;
pub use routine::{RoutineDescriptor, RoutineKind, RoutineName, RoutineParameter};
pub use safety::{validate_query, ForbiddenTablePolicy};
pub use traits::{
    CellValue, Connection, DatabaseDriver, DatabaseError, DatabaseType, ResultColumn, TabularResult,
};

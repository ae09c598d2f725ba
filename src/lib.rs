// Engine-agnostic parameter marshalling and routine dispatch

// Module declarations
pub mod config;
pub mod db;
pub mod params;

pub use config::BridgeConfig;
pub use db::{DatabaseError, DatabaseType, QueryEngine, TabularResult};
pub use params::{ParameterSet, ParameterValue, SensitiveFieldSpec};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use sql_bridge::{BridgeConfig, SensitiveFieldSpec, TabularResult};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Run parametrized queries and stored routines against SQL Server, PostgreSQL or MySQL
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, default_value = "sql-bridge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a query against the read-only policy without running it
    Validate {
        sql: String,
    },
    /// Run a read-only query with @name placeholders
    Query {
        sql: String,
        /// Parameters as a JSON object, e.g. '{"@id": 1}'
        #[arg(long)]
        params: Option<String>,
    },
    /// Run a stored function or procedure
    Routine {
        /// Routine name, optionally schema-qualified
        name: String,
        /// Parameters as a JSON object
        #[arg(long)]
        params: Option<String>,
        /// Field to hash before the call (repeatable); defaults to the configured sensitive_fields
        #[arg(long = "hash")]
        hash: Vec<String>,
    },
}

fn parse_params(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(text) => {
            let value: Value = serde_json::from_str(text).context("--params is not valid JSON")?;
            if !value.is_object() {
                bail!("--params must be a JSON object");
            }
            Ok(value)
        }
        None => Ok(Value::Null),
    }
}

fn print_result(result: &TabularResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = BridgeConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Validate { sql } => {
            let engine = config.into_engine()?;
            let (valid, message) = engine.validate_query(&sql);
            println!("{}", serde_json::json!({ "valid": valid, "message": message }));
            if !valid {
                std::process::exit(1);
            }
        }
        Command::Query { sql, params } => {
            let body = parse_params(params.as_deref())?;
            let engine = config.into_engine()?;
            let result = engine.execute_query_json(&sql, body).await?;
            print_result(&result)?;
        }
        Command::Routine { name, params, hash } => {
            let body = parse_params(params.as_deref())?;
            let spec = if hash.is_empty() {
                config.sensitive_field_spec()
            } else {
                SensitiveFieldSpec::new(&hash)
            };
            let engine = config.into_engine()?;
            let result = engine.execute_routine_json(&name, body, Some(&spec)).await?;
            print_result(&result)?;
        }
    }

    Ok(())
}

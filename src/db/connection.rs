// Connection Opening
// Every execution opens its own connection from the configured connection string

use crate::db::traits::DatabaseError;
use sqlx::Connection as _;
use tiberius::{Client, Config};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

/// Source of the connection string for the configured provider
pub trait ConnectionProvider: Send + Sync {
    fn connection_string(&self) -> Result<String, DatabaseError>;
}

impl ConnectionProvider for String {
    fn connection_string(&self) -> Result<String, DatabaseError> {
        if self.trim().is_empty() {
            return Err(DatabaseError::InvalidConfig("connection string is empty".to_string()));
        }
        Ok(self.clone())
    }
}

/// Type alias for a tiberius client over a tokio TCP stream
pub type MssqlClient = Client<Compat<TcpStream>>;

/// Open a SQL Server connection from an ADO.NET style connection string
pub async fn open_mssql(connection_string: &str) -> Result<MssqlClient, DatabaseError> {
    let config = Config::from_ado_string(connection_string)
        .map_err(|e| DatabaseError::InvalidConfig(e.to_string()))?;

    match connect_tiberius(config.clone()).await {
        // Azure SQL gateways redirect to the actual node
        Err(tiberius::error::Error::Routing { host, port }) => {
            tracing::debug!(%host, port, "following SQL Server routing redirect");
            let mut routed = config;
            routed.host(&host);
            routed.port(port);
            connect_tiberius(routed).await.map_err(connection_error)
        }
        other => other.map_err(connection_error),
    }
}

async fn connect_tiberius(config: Config) -> Result<MssqlClient, tiberius::error::Error> {
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;
    Client::connect(config, tcp.compat_write()).await
}

fn connection_error(err: tiberius::error::Error) -> DatabaseError {
    // Password expired is reported at login (18488)
    if let tiberius::error::Error::Server(e) = &err {
        if e.code() == 18488 {
            return DatabaseError::ConnectionFailed(
                "Password expired. Please change your password using another tool".to_string(),
            );
        }
    }
    DatabaseError::ConnectionFailed(err.to_string())
}

/// Open a PostgreSQL connection; the connection task runs until the client drops
pub async fn open_postgres(connection_string: &str) -> Result<tokio_postgres::Client, DatabaseError> {
    let (client, connection) = tokio_postgres::connect(connection_string, tokio_postgres::NoTls)
        .await
        .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "PostgreSQL connection error");
        }
    });

    Ok(client)
}

/// Open a MySQL/MariaDB connection from a `mysql://` URL
pub async fn open_mysql(connection_string: &str) -> Result<sqlx::MySqlConnection, DatabaseError> {
    sqlx::MySqlConnection::connect(connection_string)
        .await
        .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_provider() {
        let provider = "server=tcp:localhost,1433".to_string();
        assert_eq!(provider.connection_string().unwrap(), "server=tcp:localhost,1433");
        assert!(matches!(
            "  ".to_string().connection_string(),
            Err(DatabaseError::InvalidConfig(_))
        ));
    }
}

//! Database layer
//!
//! This module owns the live connection pools and everything that runs on them.
//!
//! # Modules
//!
//! - `pool`: pool construction, ping and pool statistics
//! - `service`: one connection per logical database, with IAM credential hot-swap
//! - `manager`: the named set of services and the default connection
//! - `migrations`: transactional, tracked schema migrations
//! - `health`: per-connection health classification
//!
//! # Example
//!
//! ```no_run
//! use credswap_db::config::ConnectionConfig;
//! use credswap_db::db::service::DatabaseService;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::new("postgres", std::env::var("DATABASE_URL")?);
//!
//!     let service = DatabaseService::new("primary", config)?;
//!     service.connect().await?;
//!     service.execute("SELECT 1").await?;
//!     service.close().await;
//!     Ok(())
//! }
//! ```

pub mod health;
pub mod manager;
pub mod migrations;
pub mod pool;
pub mod service;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::dsn::DsnError;
use std::time::Duration;
use thiserror::Error;

/// Errors from connection management and query execution
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Connection settings are invalid
    #[error("Invalid configuration for connection '{name}': {source}")]
    Config {
        name: String,
        #[source]
        source: ConfigError,
    },

    /// The DSN could not be parsed or rewritten
    #[error("Invalid DSN for connection '{name}': {source}")]
    Dsn {
        name: String,
        #[source]
        source: DsnError,
    },

    /// IAM token could not be obtained
    #[error("IAM authentication failed for connection '{name}': {source}")]
    Auth {
        name: String,
        #[source]
        source: AuthError,
    },

    /// The driver rejected the connection settings
    #[error("Failed to open connection '{name}': {source}")]
    OpenFailed {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// The server did not answer a ping
    #[error("Ping failed for connection '{name}': {source}")]
    PingFailed {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// The server did not answer a ping in time
    #[error("Ping timed out for connection '{name}' after {timeout:?}")]
    PingTimeout { name: String, timeout: Duration },

    /// No pool is open
    #[error("Connection '{0}' is not connected")]
    NotConnected(String),

    /// The service was closed and cannot be reconnected
    #[error("Connection '{0}' is closed")]
    Closed(String),

    /// A statement or transaction failed
    #[error("Query failed on connection '{name}': {source}")]
    Query {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// No connection with this name is configured
    #[error("Connection '{0}' is not configured")]
    UnknownConnection(String),
}

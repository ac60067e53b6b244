//! # Credswap Database Library
//!
//! Database connections whose password is a short-lived AWS IAM token. Tokens
//! are refreshed in the background and the connection pool is hot-swapped
//! with fresh credentials without interrupting callers.
//!
//! ## Module Organization
//!
//! - `config`: connection, IAM and database configuration
//! - `dsn`: connection string parsing and password substitution
//! - `auth`: IAM token source, cache and refresh loop
//! - `events`: lifecycle events and the emitter seam
//! - `db`: pools, connection services, migrations and health checks

pub mod auth;
pub mod config;
pub mod db;
pub mod dsn;
pub mod events;

/// Current version of the credswap database library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}

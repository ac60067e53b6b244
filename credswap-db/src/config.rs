//! Database connection configuration
//!
//! Configuration is a map of named connections plus the name of the default
//! one. Every instance is loaded explicitly (no process-wide registry), so
//! several managers can coexist in one process or test binary.
//!
//! # File Format
//!
//! ```yaml
//! default: primary
//! connections:
//!   primary:
//!     driver: postgres
//!     dsn: "postgres://app@db.example.com:5432/app"
//!     max_open_connections: 20
//!     max_idle_connections: 5
//!     connection_max_lifetime_seconds: 1800
//!     aws_iam_auth:
//!       enabled: true
//!       region: us-east-1
//!       db_user: app
//!       token_refresh_interval: 600
//! ```
//!
//! # Environment Overrides
//!
//! Any key can be overridden with `CREDSWAP_DATABASE_` followed by the key
//! path joined with `__`, e.g. `CREDSWAP_DATABASE_CONNECTIONS__PRIMARY__DSN`.
//! A `.env` file is loaded first when present.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "CREDSWAP_DATABASE";

/// Default IAM token refresh interval (seconds)
///
/// RDS tokens are valid for 15 minutes; refreshing every 10 leaves headroom.
pub const DEFAULT_TOKEN_REFRESH_INTERVAL_SECONDS: u64 = 600;

/// Upper bound for the refresh interval (token lifetime upstream)
pub const MAX_TOKEN_REFRESH_INTERVAL_SECONDS: u64 = 900;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Sources could not be read or deserialized
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    /// A field failed validation
    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// Driver name is not one of the supported drivers
    #[error("Unsupported database driver: {0}")]
    UnsupportedDriver(String),

    /// `default` names a connection that is not configured
    #[error("Default connection '{0}' is not configured")]
    UnknownDefault(String),
}

/// Database driver behind a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// PostgreSQL (`postgres`, `postgresql`, `pgx`)
    Postgres,

    /// MySQL (`mysql`)
    MySql,

    /// SQLite (`sqlite`, `sqlite3`)
    Sqlite,
}

impl Driver {
    /// URL scheme understood by the driver
    pub fn url_scheme(&self) -> &'static str {
        match self {
            Driver::Postgres => "postgres",
            Driver::MySql => "mysql",
            Driver::Sqlite => "sqlite",
        }
    }

    /// Bind placeholder for the `n`-th (1-based) parameter
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Driver::Postgres => format!("${n}"),
            Driver::MySql | Driver::Sqlite => "?".to_string(),
        }
    }

    /// Canonical driver name
    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::Postgres => "postgres",
            Driver::MySql => "mysql",
            Driver::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Driver {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pgx" => Ok(Driver::Postgres),
            "mysql" => Ok(Driver::MySql),
            "sqlite" | "sqlite3" => Ok(Driver::Sqlite),
            other => Err(ConfigError::UnsupportedDriver(other.to_string())),
        }
    }
}

/// AWS IAM database authentication settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_auth_config"))]
pub struct AuthConfig {
    /// Whether IAM tokens replace the DSN password
    pub enabled: bool,

    /// AWS region of the database (e.g. `us-east-1`)
    pub region: String,

    /// Database user the token is issued for
    pub db_user: String,

    /// How often the token is refreshed (seconds)
    ///
    /// Default: 600. Must stay below the 900 second token lifetime.
    #[validate(range(min = 1, max = 900))]
    pub token_refresh_interval: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            region: String::new(),
            db_user: String::new(),
            token_refresh_interval: DEFAULT_TOKEN_REFRESH_INTERVAL_SECONDS,
        }
    }
}

impl AuthConfig {
    /// Token refresh interval as a [`Duration`]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_interval)
    }
}

fn validate_auth_config(config: &AuthConfig) -> Result<(), ValidationError> {
    if !config.enabled {
        return Ok(());
    }

    let missing = if config.region.trim().is_empty() {
        Some("region is required when IAM auth is enabled")
    } else if config.db_user.trim().is_empty() {
        Some("db_user is required when IAM auth is enabled")
    } else {
        None
    };

    match missing {
        Some(message) => {
            let mut error = ValidationError::new("iam_auth_incomplete");
            error.message = Some(message.into());
            Err(error)
        }
        None => Ok(()),
    }
}

/// Configuration for a single named connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Driver name (`postgres`, `mysql`, `sqlite`)
    #[validate(length(min = 1, message = "driver is required"))]
    pub driver: String,

    /// Connection string, URL or key-value style
    #[validate(length(min = 1, message = "dsn is required"))]
    pub dsn: String,

    /// Maximum open connections (0 = driver default, unbounded for health purposes)
    pub max_open_connections: u32,

    /// Connections kept warm in the pool
    pub max_idle_connections: u32,

    /// Maximum lifetime of a pooled connection (seconds)
    pub connection_max_lifetime_seconds: Option<u64>,

    /// Idle time before a pooled connection is closed (seconds)
    pub connection_max_idle_time_seconds: Option<u64>,

    /// Timeout for acquiring a connection from the pool (seconds)
    pub acquire_timeout_seconds: u64,

    /// Optional IAM authentication
    pub aws_iam_auth: Option<AuthConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            driver: String::new(),
            dsn: String::new(),
            max_open_connections: 10,
            max_idle_connections: 2,
            connection_max_lifetime_seconds: Some(1800),
            connection_max_idle_time_seconds: Some(600),
            acquire_timeout_seconds: 30,
            aws_iam_auth: None,
        }
    }
}

impl ConnectionConfig {
    /// Creates a config for `driver` and `dsn` with default pool settings
    pub fn new(driver: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            dsn: dsn.into(),
            ..Default::default()
        }
    }

    /// Validates the config and returns the parsed driver
    ///
    /// # Errors
    ///
    /// - Missing driver or DSN
    /// - Enabled IAM auth without region or database user
    /// - Unsupported driver name
    pub fn check(&self) -> Result<Driver, ConfigError> {
        self.validate()?;
        if let Some(auth) = &self.aws_iam_auth {
            auth.validate()?;
        }
        self.driver.parse()
    }

    /// IAM settings, only when enabled
    pub fn iam_auth(&self) -> Option<&AuthConfig> {
        self.aws_iam_auth.as_ref().filter(|auth| auth.enabled)
    }
}

/// Named connections plus the default connection name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection used when callers do not name one
    pub default: String,

    /// Connections by name
    pub connections: HashMap<String, ConnectionConfig>,
}

impl DatabaseConfig {
    /// Loads configuration from a file (format by extension) plus environment overrides
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: DatabaseConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from an in-memory document
    pub fn parse(contents: &str, format: ::config::FileFormat) -> Result<Self, ConfigError> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from_str(contents, format))
            .build()?;

        let config: DatabaseConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every connection and the default name
    pub fn validate(&self) -> Result<(), ConfigError> {
        for connection in self.connections.values() {
            connection.check()?;
        }

        if !self.default.is_empty() && !self.connections.contains_key(&self.default) {
            return Err(ConfigError::UnknownDefault(self.default.clone()));
        }

        Ok(())
    }

    /// Name of the default connection
    ///
    /// The configured `default`, or the only connection when exactly one exists.
    pub fn default_connection_name(&self) -> Option<&str> {
        if !self.default.is_empty() {
            return Some(self.default.as_str());
        }

        if self.connections.len() == 1 {
            return self.connections.keys().next().map(String::as_str);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::config::FileFormat;

    const SAMPLE: &str = r#"
default: primary
connections:
  primary:
    driver: postgres
    dsn: "postgres://app@db.example.com:5432/app"
    max_open_connections: 20
    aws_iam_auth:
      enabled: true
      region: us-east-1
      db_user: app
  reporting:
    driver: sqlite
    dsn: "sqlite::memory:"
"#;

    #[test]
    fn test_parse_yaml() {
        let config = DatabaseConfig::parse(SAMPLE, FileFormat::Yaml).unwrap();
        assert_eq!(config.default, "primary");
        assert_eq!(config.connections.len(), 2);

        let primary = &config.connections["primary"];
        assert_eq!(primary.max_open_connections, 20);
        assert_eq!(primary.max_idle_connections, 2);

        let auth = primary.iam_auth().unwrap();
        assert_eq!(auth.region, "us-east-1");
        assert_eq!(auth.token_refresh_interval, 600);
        assert_eq!(auth.refresh_interval(), Duration::from_secs(600));

        assert!(config.connections["reporting"].iam_auth().is_none());
    }

    #[test]
    fn test_missing_dsn_is_rejected() {
        let config = ConnectionConfig::new("postgres", "");
        assert!(matches!(config.check(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_missing_driver_is_rejected() {
        let config = ConnectionConfig::new("", "postgres://db.example.com/app");
        assert!(matches!(config.check(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_enabled_iam_requires_region_and_user() {
        let mut config = ConnectionConfig::new("postgres", "postgres://app@db.example.com/app");
        config.aws_iam_auth = Some(AuthConfig {
            enabled: true,
            region: "us-east-1".to_string(),
            db_user: String::new(),
            ..Default::default()
        });
        assert!(matches!(config.check(), Err(ConfigError::Validation(_))));

        config.aws_iam_auth = Some(AuthConfig {
            enabled: true,
            region: String::new(),
            db_user: "app".to_string(),
            ..Default::default()
        });
        assert!(matches!(config.check(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_disabled_iam_needs_nothing() {
        let mut config = ConnectionConfig::new("postgres", "postgres://app@db.example.com/app");
        config.aws_iam_auth = Some(AuthConfig::default());
        assert_eq!(config.check().unwrap(), Driver::Postgres);
        assert!(config.iam_auth().is_none());
    }

    #[test]
    fn test_refresh_interval_bounded_by_token_lifetime() {
        let mut config = ConnectionConfig::new("postgres", "postgres://app@db.example.com/app");
        config.aws_iam_auth = Some(AuthConfig {
            enabled: true,
            region: "us-east-1".to_string(),
            db_user: "app".to_string(),
            token_refresh_interval: MAX_TOKEN_REFRESH_INTERVAL_SECONDS + 1,
        });
        assert!(matches!(config.check(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_unknown_driver() {
        let config = ConnectionConfig::new("oracle", "oracle://db.example.com/app");
        assert!(matches!(
            config.check(),
            Err(ConfigError::UnsupportedDriver(name)) if name == "oracle"
        ));
    }

    #[test]
    fn test_driver_aliases() {
        assert_eq!("pgx".parse::<Driver>().unwrap(), Driver::Postgres);
        assert_eq!("PostgreSQL".parse::<Driver>().unwrap(), Driver::Postgres);
        assert_eq!("sqlite3".parse::<Driver>().unwrap(), Driver::Sqlite);
        assert_eq!("mysql".parse::<Driver>().unwrap(), Driver::MySql);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Driver::Postgres.placeholder(2), "$2");
        assert_eq!(Driver::Sqlite.placeholder(2), "?");
    }

    #[test]
    fn test_unknown_default_rejected() {
        let mut config = DatabaseConfig::default();
        config.default = "missing".to_string();
        config.connections.insert(
            "primary".to_string(),
            ConnectionConfig::new("sqlite", "sqlite::memory:"),
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownDefault(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_default_connection_name_single_connection() {
        let mut config = DatabaseConfig::default();
        assert_eq!(config.default_connection_name(), None);

        config.connections.insert(
            "only".to_string(),
            ConnectionConfig::new("sqlite", "sqlite::memory:"),
        );
        assert_eq!(config.default_connection_name(), Some("only"));
    }
}

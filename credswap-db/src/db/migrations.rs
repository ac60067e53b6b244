//! Transactional schema migrations
//!
//! Migrations are plain SQL strings tracked by ID in a table
//! (`schema_migrations` by default). Each migration runs in its own
//! transaction together with its tracking-row write, so a failure never leaves
//! a half-applied migration recorded.
//!
//! # Tracking Table
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS schema_migrations (
//!     id         VARCHAR(255) PRIMARY KEY,
//!     version    VARCHAR(255) NOT NULL,
//!     applied_at VARCHAR(64)  NOT NULL  -- RFC 3339, UTC, nanoseconds
//! )
//! ```
//!
//! # Example
//!
//! ```no_run
//! use credswap_db::config::ConnectionConfig;
//! use credswap_db::db::migrations::{Migration, MigrationRunner};
//! use credswap_db::db::service::DatabaseService;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = DatabaseService::new(
//!     "primary",
//!     ConnectionConfig::new("sqlite", "sqlite://app.db?mode=rwc"),
//! )?;
//! service.connect().await?;
//!
//! let runner = MigrationRunner::new(service.clone());
//! let applied = runner
//!     .run_migrations(&[
//!         Migration::up("001_users", "001", "CREATE TABLE users (id INTEGER PRIMARY KEY)"),
//!         Migration::up("002_email", "002", "ALTER TABLE users ADD COLUMN email TEXT"),
//!     ])
//!     .await?;
//! println!("Applied: {:?}", applied);
//! # Ok(())
//! # }
//! ```

use super::service::DatabaseService;
use super::DatabaseError;
use crate::events::EventKind;
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{Any, Executor, Row, Transaction};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info};

/// Tracking table used unless overridden
pub const DEFAULT_MIGRATIONS_TABLE: &str = "schema_migrations";

fn table_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex is valid"))
}

/// Migration errors
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Tracking table name is not a plain SQL identifier
    #[error("Invalid migrations table name: {0:?}")]
    InvalidTableName(String),

    /// Connection unavailable or transaction could not be started
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// The migration's own SQL failed
    #[error("Migration '{id}' failed: {source}")]
    Execution {
        id: String,
        #[source]
        source: sqlx::Error,
    },

    /// Writing or deleting the tracking row failed
    #[error("Failed to record migration '{id}': {source}")]
    Tracking {
        id: String,
        #[source]
        source: sqlx::Error,
    },

    /// The transaction could not be committed
    #[error("Failed to commit migration '{id}': {source}")]
    Commit {
        id: String,
        #[source]
        source: DatabaseError,
    },

    /// A tracking-table row could not be decoded
    #[error("Failed to read applied migrations: {0}")]
    Decode(#[source] sqlx::Error),
}

/// Whether a migration applies or reverts a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    Up,
    Down,
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MigrationDirection::Up => "up",
            MigrationDirection::Down => "down",
        })
    }
}

/// A single schema change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    /// Unique ID; the tracking table's key
    pub id: String,

    /// Sort key within a batch (compared as a string)
    pub version: String,

    /// SQL to execute; may contain several statements
    pub sql: String,

    pub direction: MigrationDirection,
}

impl Migration {
    /// A migration that applies a change and records `id`
    pub fn up(id: impl Into<String>, version: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            sql: sql.into(),
            direction: MigrationDirection::Up,
        }
    }

    /// A migration that reverts the change recorded as `id`
    pub fn down(id: impl Into<String>, version: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            sql: sql.into(),
            direction: MigrationDirection::Down,
        }
    }
}

/// Checks that `table` is a plain SQL identifier
pub fn validate_table_name(table: &str) -> Result<(), MigrationError> {
    if table_name_pattern().is_match(table) {
        Ok(())
    } else {
        Err(MigrationError::InvalidTableName(table.to_string()))
    }
}

/// Selects and orders the migrations a batch will run
///
/// Pending up migrations run first, by ascending version. Down migrations run
/// afterwards, by descending version, and only for IDs that are applied.
/// Ties are broken by ID.
pub fn plan<'a>(migrations: &'a [Migration], applied: &HashSet<String>) -> Vec<&'a Migration> {
    let mut ups: Vec<&Migration> = migrations
        .iter()
        .filter(|m| m.direction == MigrationDirection::Up)
        .collect();
    ups.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.id.cmp(&b.id)));

    let mut downs: Vec<&Migration> = migrations
        .iter()
        .filter(|m| m.direction == MigrationDirection::Down)
        .collect();
    downs.sort_by(|a, b| b.version.cmp(&a.version).then_with(|| b.id.cmp(&a.id)));

    let mut state = applied.clone();
    let mut planned = Vec::new();

    for migration in ups.into_iter().chain(downs) {
        let is_applied = state.contains(&migration.id);
        match migration.direction {
            MigrationDirection::Up if !is_applied => {
                state.insert(migration.id.clone());
                planned.push(migration);
            }
            MigrationDirection::Down if is_applied => {
                state.remove(&migration.id);
                planned.push(migration);
            }
            _ => {}
        }
    }

    planned
}

/// Runs migrations against one connection
#[derive(Clone)]
pub struct MigrationRunner {
    service: DatabaseService,
    table: String,
}

impl MigrationRunner {
    /// Creates a runner tracking into [`DEFAULT_MIGRATIONS_TABLE`]
    pub fn new(service: DatabaseService) -> Self {
        Self {
            service,
            table: DEFAULT_MIGRATIONS_TABLE.to_string(),
        }
    }

    /// Uses a different tracking table
    ///
    /// The name is validated when the runner is used.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Tracking table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Creates the tracking table if it does not exist
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::InvalidTableName`] before issuing any SQL if
    /// the table name is not a plain identifier.
    pub async fn create_migrations_table(&self) -> Result<(), MigrationError> {
        validate_table_name(&self.table)?;

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id VARCHAR(255) PRIMARY KEY, \
             version VARCHAR(255) NOT NULL, \
             applied_at VARCHAR(64) NOT NULL)",
            self.table
        );
        self.service.execute(&sql).await?;

        debug!(
            connection = %self.service.name(),
            table = %self.table,
            "Migrations table ready"
        );
        Ok(())
    }

    /// IDs of applied migrations, oldest first
    pub async fn get_applied_migrations(&self) -> Result<Vec<String>, MigrationError> {
        validate_table_name(&self.table)?;

        let sql = format!("SELECT id FROM {} ORDER BY applied_at, id", self.table);
        let rows = self.service.fetch_all(&sql).await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<Result<Vec<_>, _>>()
            .map_err(MigrationError::Decode)
    }

    /// Runs one migration and updates the tracking table in the same transaction
    ///
    /// Emits `migration.started` before the transaction opens,
    /// `migration.completed` after commit and `migration.failed` on any error.
    /// The transaction is rolled back on every failure path.
    pub async fn run_migration(&self, migration: &Migration) -> Result<(), MigrationError> {
        validate_table_name(&self.table)?;

        let started = Instant::now();
        info!(
            connection = %self.service.name(),
            migration_id = %migration.id,
            version = %migration.version,
            direction = %migration.direction,
            "Running migration"
        );
        self.service
            .emit(
                self.service
                    .event(EventKind::MigrationStarted)
                    .with("migration_id", migration.id.as_str())
                    .with("version", migration.version.as_str())
                    .with("direction", migration.direction.to_string()),
            )
            .await;

        match self.apply(migration).await {
            Ok(()) => {
                info!(
                    connection = %self.service.name(),
                    migration_id = %migration.id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Migration completed"
                );
                self.service
                    .emit(
                        self.service
                            .event(EventKind::MigrationCompleted)
                            .with("migration_id", migration.id.as_str())
                            .with("direction", migration.direction.to_string())
                            .with_duration(started.elapsed()),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                error!(
                    connection = %self.service.name(),
                    migration_id = %migration.id,
                    error = %e,
                    "Migration failed"
                );
                self.service
                    .emit(
                        self.service
                            .event(EventKind::MigrationFailed)
                            .with("migration_id", migration.id.as_str())
                            .with("direction", migration.direction.to_string())
                            .with_error(&e)
                            .with_duration(started.elapsed()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn apply(&self, migration: &Migration) -> Result<(), MigrationError> {
        let mut tx = self.service.begin().await?;

        if let Err(e) = self.apply_in(&mut tx, migration).await {
            self.service.rollback(tx).await;
            return Err(e);
        }

        self.service
            .commit(tx)
            .await
            .map_err(|source| MigrationError::Commit {
                id: migration.id.clone(),
                source,
            })
    }

    async fn apply_in(
        &self,
        tx: &mut Transaction<'static, Any>,
        migration: &Migration,
    ) -> Result<(), MigrationError> {
        (&mut **tx)
            .execute(migration.sql.as_str())
            .await
            .map_err(|source| MigrationError::Execution {
                id: migration.id.clone(),
                source,
            })?;

        let driver = self.service.driver();
        let tracking = match migration.direction {
            MigrationDirection::Up => {
                let sql = format!(
                    "INSERT INTO {} (id, version, applied_at) VALUES ({}, {}, {})",
                    self.table,
                    driver.placeholder(1),
                    driver.placeholder(2),
                    driver.placeholder(3)
                );
                sqlx::query::<Any>(&sql)
                    .bind(migration.id.clone())
                    .bind(migration.version.clone())
                    .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true))
                    .execute(&mut **tx)
                    .await
            }
            MigrationDirection::Down => {
                let sql = format!(
                    "DELETE FROM {} WHERE id = {}",
                    self.table,
                    driver.placeholder(1)
                );
                sqlx::query::<Any>(&sql)
                    .bind(migration.id.clone())
                    .execute(&mut **tx)
                    .await
            }
        };

        tracking.map_err(|source| MigrationError::Tracking {
            id: migration.id.clone(),
            source,
        })?;

        Ok(())
    }

    /// Runs every pending migration in `migrations`
    ///
    /// Ensures the tracking table exists, skips applied up migrations and
    /// unapplied down migrations, and stops at the first failure. Migrations
    /// applied before the failure stay recorded.
    ///
    /// Returns the IDs that were run, in order.
    pub async fn run_migrations(
        &self,
        migrations: &[Migration],
    ) -> Result<Vec<String>, MigrationError> {
        self.create_migrations_table().await?;

        let applied: HashSet<String> = self.get_applied_migrations().await?.into_iter().collect();
        let planned = plan(migrations, &applied);

        if planned.is_empty() {
            debug!(connection = %self.service.name(), "No pending migrations");
            return Ok(Vec::new());
        }

        let mut ran = Vec::with_capacity(planned.len());
        for migration in planned {
            self.run_migration(migration).await?;
            ran.push(migration.id.clone());
        }

        info!(
            connection = %self.service.name(),
            count = ran.len(),
            "Migrations applied"
        );
        Ok(ran)
    }
}

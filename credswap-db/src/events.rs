//! Lifecycle events
//!
//! The database layer reports what it does (connects, queries, transactions,
//! migrations, credential rotation) as [`DatabaseEvent`] values handed to an
//! externally supplied [`EventEmitter`]. Routing and persistence are the
//! emitter's business.
//!
//! Emission is best-effort telemetry: a failing emitter is logged and never
//! fails the operation that produced the event.
//!
//! # Example
//!
//! ```
//! use credswap_db::events::{ChannelEmitter, DatabaseEvent, EventEmitter, EventKind};
//!
//! # async fn example() {
//! let (emitter, mut rx) = ChannelEmitter::new();
//! emitter
//!     .emit_event(DatabaseEvent::new(EventKind::ConnectionConnected, "primary", "postgres"))
//!     .await
//!     .unwrap();
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.kind.as_str(), "connection.connected");
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Event emission error
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    /// The emitter could not accept the event
    #[error("Failed to emit event: {0}")]
    Failed(String),

    /// The receiving side is gone
    #[error("Event receiver closed")]
    Closed,
}

/// Event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "connection.connected")]
    ConnectionConnected,

    #[serde(rename = "connection.disconnected")]
    ConnectionDisconnected,

    #[serde(rename = "connection.error")]
    ConnectionError,

    /// New pool with fresh IAM credentials swapped in
    #[serde(rename = "connection.credentials_rotated")]
    CredentialsRotated,

    #[serde(rename = "query.executed")]
    QueryExecuted,

    #[serde(rename = "query.error")]
    QueryError,

    #[serde(rename = "transaction.started")]
    TransactionStarted,

    #[serde(rename = "transaction.committed")]
    TransactionCommitted,

    #[serde(rename = "transaction.rolled_back")]
    TransactionRolledBack,

    #[serde(rename = "migration.started")]
    MigrationStarted,

    #[serde(rename = "migration.completed")]
    MigrationCompleted,

    #[serde(rename = "migration.failed")]
    MigrationFailed,

    #[serde(rename = "config.loaded")]
    ConfigLoaded,
}

impl EventKind {
    /// Dotted event name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ConnectionConnected => "connection.connected",
            EventKind::ConnectionDisconnected => "connection.disconnected",
            EventKind::ConnectionError => "connection.error",
            EventKind::CredentialsRotated => "connection.credentials_rotated",
            EventKind::QueryExecuted => "query.executed",
            EventKind::QueryError => "query.error",
            EventKind::TransactionStarted => "transaction.started",
            EventKind::TransactionCommitted => "transaction.committed",
            EventKind::TransactionRolledBack => "transaction.rolled_back",
            EventKind::MigrationStarted => "migration.started",
            EventKind::MigrationCompleted => "migration.completed",
            EventKind::MigrationFailed => "migration.failed",
            EventKind::ConfigLoaded => "config.loaded",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event from the database layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseEvent {
    /// Event kind
    pub kind: EventKind,

    /// Logical connection name
    pub connection: String,

    /// Driver name
    pub driver: String,

    /// Structured details (`duration_ms`, `error`, `migration_id`, ...)
    pub payload: Map<String, JsonValue>,

    /// When the event was created
    pub timestamp: DateTime<Utc>,
}

impl DatabaseEvent {
    /// Creates an event with an empty payload
    pub fn new(kind: EventKind, connection: impl Into<String>, driver: impl Into<String>) -> Self {
        DatabaseEvent {
            kind,
            connection: connection.into(),
            driver: driver.into(),
            payload: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Adds a payload field
    pub fn with(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Adds `duration_ms`
    pub fn with_duration(self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.with("duration_ms", millis)
    }

    /// Adds `error` with the error's display text
    pub fn with_error(self, error: &dyn fmt::Display) -> Self {
        self.with("error", error.to_string())
    }

    /// Payload field lookup
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.payload.get(key)
    }
}

/// Receiver of lifecycle events
///
/// Implemented by the application's observer bus.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    /// Hands an event to the bus
    async fn emit_event(&self, event: DatabaseEvent) -> Result<(), EmitError>;
}

/// Emitter that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEmitter;

#[async_trait]
impl EventEmitter for NoopEmitter {
    async fn emit_event(&self, _event: DatabaseEvent) -> Result<(), EmitError> {
        Ok(())
    }
}

/// Emitter that forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<DatabaseEvent>,
}

impl ChannelEmitter {
    /// Creates an emitter and the receiving half
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DatabaseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelEmitter { tx }, rx)
    }
}

#[async_trait]
impl EventEmitter for ChannelEmitter {
    async fn emit_event(&self, event: DatabaseEvent) -> Result<(), EmitError> {
        self.tx.send(event).map_err(|_| EmitError::Closed)
    }
}

/// Emits an event, logging instead of propagating failures
pub async fn emit_best_effort(emitter: &dyn EventEmitter, event: DatabaseEvent) {
    let kind = event.kind;
    let connection = event.connection.clone();

    if let Err(e) = emitter.emit_event(event).await {
        tracing::warn!(
            event = %kind,
            connection = %connection,
            error = %e,
            "Failed to emit database event"
        );
    }
}

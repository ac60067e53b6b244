//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use credswap_db::auth::rds::TokenSource;
use credswap_db::auth::AuthError;
use credswap_db::config::{AuthConfig, ConnectionConfig};
use credswap_db::events::{DatabaseEvent, EventKind};
use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber once; controlled by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Postgres URL for tests that need a real server
pub fn postgres_url() -> Option<String> {
    env::var("CREDSWAP_TEST_POSTGRES_URL")
        .ok()
        .filter(|url| !url.is_empty())
}

/// A file-backed SQLite connection in `dir`
pub fn sqlite_config(dir: &Path, file: &str) -> ConnectionConfig {
    let path = dir.join(file);
    let mut config = ConnectionConfig::new("sqlite", format!("sqlite://{}?mode=rwc", path.display()));
    config.max_open_connections = 4;
    config.max_idle_connections = 1;
    config
}

/// IAM settings for tests
pub fn iam_auth(refresh_interval_seconds: u64) -> AuthConfig {
    AuthConfig {
        enabled: true,
        region: "us-east-1".to_string(),
        db_user: "app".to_string(),
        token_refresh_interval: refresh_interval_seconds,
    }
}

/// Token source returning a fixed token and counting fetches
pub struct StaticTokenSource {
    token: String,
    pub fetches: AtomicUsize,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch_token(
        &self,
        _endpoint: &str,
        _region: &str,
        _db_user: &str,
    ) -> Result<String, AuthError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.token.clone())
    }
}

/// Token source that always fails
pub struct FailingTokenSource;

#[async_trait]
impl TokenSource for FailingTokenSource {
    async fn fetch_token(
        &self,
        endpoint: &str,
        _region: &str,
        _db_user: &str,
    ) -> Result<String, AuthError> {
        Err(AuthError::TokenFetch {
            endpoint: endpoint.to_string(),
            message: "credential source unavailable".to_string(),
        })
    }
}

/// Drains every event currently buffered in `rx`
pub fn drain(rx: &mut mpsc::UnboundedReceiver<DatabaseEvent>) -> Vec<DatabaseEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Kinds of the events currently buffered in `rx`
pub fn drain_kinds(rx: &mut mpsc::UnboundedReceiver<DatabaseEvent>) -> Vec<EventKind> {
    drain(rx).into_iter().map(|event| event.kind).collect()
}

/// Waits for the first event of `kind`, giving up after `timeout`
pub async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<DatabaseEvent>,
    kind: EventKind,
    timeout: Duration,
) -> Option<DatabaseEvent> {
    tokio::time::timeout(timeout, async {
        while let Some(event) = rx.recv().await {
            if event.kind == kind {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

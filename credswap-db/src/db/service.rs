//! Connection service with IAM credential hot-swap
//!
//! A [`DatabaseService`] owns the pool for one logical database. When IAM
//! authentication is enabled, the pool is rebuilt whenever the token provider
//! refreshes the token, without callers ever observing a missing pool.
//!
//! # Hot-Swap Protocol
//!
//! ```text
//! refresh loop ──TokenRefreshed──▶ listener task
//!                                      │
//!                                      ├─ rebuild DSN with the new token
//!                                      ├─ open new pool, ping (bounded)
//!                                      ├─ write-lock: swap pool handle
//!                                      └─ close old pool in the background
//! ```
//!
//! The lock guards only the handle. Readers clone the handle under the read
//! lock and release it before running any I/O, so a swap never waits for
//! queries and queries never wait for a swap. If the new pool cannot be
//! opened or pinged the swap is abandoned and the current pool stays in place.

use super::pool::{self, PoolStats};
use super::DatabaseError;
use crate::auth::rds::{RdsTokenSource, TokenSource};
use crate::auth::token::{IamTokenProvider, TokenRefreshed};
use crate::config::{ConnectionConfig, Driver};
use crate::dsn;
use crate::events::{emit_best_effort, DatabaseEvent, EventEmitter, EventKind, NoopEmitter};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Executor, Transaction};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound for verifying a freshly opened pool
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

struct ServiceInner {
    name: String,
    config: ConnectionConfig,
    driver: Driver,
    endpoint: Option<String>,
    pool: RwLock<Option<AnyPool>>,
    token_provider: Option<Arc<IamTokenProvider>>,
    emitter: Arc<dyn EventEmitter>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to one logical database connection
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct DatabaseService {
    inner: Arc<ServiceInner>,
}

impl DatabaseService {
    /// Creates a service that emits no events and signs IAM tokens with
    /// credentials from the AWS default provider chain
    pub fn new(name: impl Into<String>, config: ConnectionConfig) -> Result<Self, DatabaseError> {
        Self::with_collaborators(
            name,
            config,
            Arc::new(NoopEmitter),
            Arc::new(RdsTokenSource::new()),
        )
    }

    /// Creates a service with an explicit event emitter and token source
    ///
    /// The token source is only used when IAM auth is enabled.
    ///
    /// # Errors
    ///
    /// - Invalid connection settings
    /// - IAM auth enabled but no endpoint can be extracted from the DSN
    pub fn with_collaborators(
        name: impl Into<String>,
        config: ConnectionConfig,
        emitter: Arc<dyn EventEmitter>,
        token_source: Arc<dyn TokenSource>,
    ) -> Result<Self, DatabaseError> {
        let name = name.into();
        let driver = config.check().map_err(|source| DatabaseError::Config {
            name: name.clone(),
            source,
        })?;

        let (endpoint, token_provider) = match config.iam_auth() {
            Some(auth) => {
                let endpoint =
                    dsn::extract_endpoint(&config.dsn).map_err(|source| DatabaseError::Dsn {
                        name: name.clone(),
                        source,
                    })?;
                let provider = IamTokenProvider::new(auth, token_source).map_err(|source| {
                    DatabaseError::Auth {
                        name: name.clone(),
                        source,
                    }
                })?;
                (Some(endpoint), Some(Arc::new(provider)))
            }
            None => (None, None),
        };

        Ok(Self {
            inner: Arc::new(ServiceInner {
                name,
                config,
                driver,
                endpoint,
                pool: RwLock::new(None),
                token_provider,
                emitter,
                cancel: CancellationToken::new(),
                listener: Mutex::new(None),
            }),
        })
    }

    /// Logical connection name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Driver behind this connection
    pub fn driver(&self) -> Driver {
        self.inner.driver
    }

    /// Connection settings
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Whether IAM tokens are used in place of the DSN password
    pub fn uses_iam_auth(&self) -> bool {
        self.inner.token_provider.is_some()
    }

    /// The IAM token provider, when IAM auth is enabled
    pub fn token_provider(&self) -> Option<&Arc<IamTokenProvider>> {
        self.inner.token_provider.as_ref()
    }

    /// Whether a pool is currently installed
    pub fn is_connected(&self) -> bool {
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn event(&self, kind: EventKind) -> DatabaseEvent {
        DatabaseEvent::new(kind, self.inner.name.as_str(), self.inner.driver.as_str())
    }

    pub(crate) async fn emit(&self, event: DatabaseEvent) {
        emit_best_effort(self.inner.emitter.as_ref(), event).await;
    }

    /// Opens the pool, verifies it and, with IAM auth, starts token rotation
    ///
    /// # Errors
    ///
    /// - [`DatabaseError::Dsn`] / [`DatabaseError::Auth`] if the DSN cannot be built
    /// - [`DatabaseError::OpenFailed`] if the driver rejects the settings
    /// - [`DatabaseError::PingFailed`] / [`DatabaseError::PingTimeout`] if the server is unreachable
    pub async fn connect(&self) -> Result<(), DatabaseError> {
        if self.inner.cancel.is_cancelled() {
            return Err(DatabaseError::Closed(self.inner.name.clone()));
        }

        let started = Instant::now();
        info!(
            connection = %self.inner.name,
            driver = %self.inner.driver,
            iam_auth = self.uses_iam_auth(),
            "Connecting to database"
        );

        let pool = match self.open_initial_pool().await {
            Ok(pool) => pool,
            Err(e) => {
                error!(connection = %self.inner.name, error = %e, "Database connection failed");
                self.emit(
                    self.event(EventKind::ConnectionError)
                        .with("stage", "connect")
                        .with_error(&e),
                )
                .await;
                return Err(e);
            }
        };

        match self.swap_pool(pool) {
            Ok(Some(previous)) => {
                tokio::spawn(pool::close_pool(previous));
            }
            Ok(None) => {}
            Err(pool) => {
                pool::close_pool(pool).await;
                return Err(DatabaseError::Closed(self.inner.name.clone()));
            }
        }

        if let (Some(provider), Some(endpoint)) =
            (&self.inner.token_provider, &self.inner.endpoint)
        {
            self.spawn_refresh_listener(provider.subscribe());
            provider.start_token_refresh(&self.inner.cancel, endpoint);
        }

        info!(
            connection = %self.inner.name,
            duration_ms = started.elapsed().as_millis() as u64,
            "Database connected"
        );
        self.emit(
            self.event(EventKind::ConnectionConnected)
                .with_duration(started.elapsed()),
        )
        .await;

        Ok(())
    }

    async fn open_initial_pool(&self) -> Result<AnyPool, DatabaseError> {
        let dsn = match &self.inner.token_provider {
            Some(provider) => provider
                .build_dsn_with_iam_token(&self.inner.config.dsn)
                .await
                .map_err(|source| DatabaseError::Auth {
                    name: self.inner.name.clone(),
                    source,
                })?,
            None => self.inner.config.dsn.clone(),
        };

        let url = dsn::to_driver_url(&dsn, self.inner.driver).map_err(|source| {
            DatabaseError::Dsn {
                name: self.inner.name.clone(),
                source,
            }
        })?;

        self.open_verified(&url).await
    }

    async fn open_verified(&self, url: &str) -> Result<AnyPool, DatabaseError> {
        let name = &self.inner.name;
        let pool = pool::open_pool(url, &self.inner.config).map_err(|source| {
            DatabaseError::OpenFailed {
                name: name.clone(),
                source,
            }
        })?;

        match tokio::time::timeout(PING_TIMEOUT, pool::ping(&pool)).await {
            Ok(Ok(())) => Ok(pool),
            Ok(Err(source)) => {
                pool.close().await;
                Err(DatabaseError::PingFailed {
                    name: name.clone(),
                    source,
                })
            }
            Err(_) => {
                pool.close().await;
                Err(DatabaseError::PingTimeout {
                    name: name.clone(),
                    timeout: PING_TIMEOUT,
                })
            }
        }
    }

    /// Installs `new_pool`, returning the previous one
    ///
    /// Refuses (handing the pool back) once the service is closed.
    fn swap_pool(&self, new_pool: AnyPool) -> Result<Option<AnyPool>, AnyPool> {
        let mut slot = self
            .inner
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if self.inner.cancel.is_cancelled() {
            return Err(new_pool);
        }

        Ok(slot.replace(new_pool))
    }

    fn spawn_refresh_listener(&self, mut rx: mpsc::UnboundedReceiver<TokenRefreshed>) {
        let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let refreshed = tokio::select! {
                    _ = cancel.cancelled() => break,
                    refreshed = rx.recv() => match refreshed {
                        Some(refreshed) => refreshed,
                        None => break,
                    },
                };

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let service = DatabaseService { inner };

                if let Err(e) = service.on_token_refresh(refreshed).await {
                    warn!(
                        connection = %service.name(),
                        error = %e,
                        "Credential rotation failed, keeping existing pool"
                    );
                    service
                        .emit(
                            service
                                .event(EventKind::ConnectionError)
                                .with("stage", "credential_rotation")
                                .with_error(&e),
                        )
                        .await;
                }
            }
        });

        let previous = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Rebuilds the pool with a freshly issued token
    ///
    /// Called for every [`TokenRefreshed`] message. On any failure the
    /// current pool is left untouched and the error is returned for logging.
    pub async fn on_token_refresh(&self, refreshed: TokenRefreshed) -> Result<(), DatabaseError> {
        let started = Instant::now();
        debug!(
            connection = %self.inner.name,
            endpoint = %refreshed.endpoint,
            "Rotating database credentials"
        );

        let url = dsn::replace_password(&self.inner.config.dsn, &refreshed.token)
            .and_then(|dsn| dsn::to_driver_url(&dsn, self.inner.driver))
            .map_err(|source| DatabaseError::Dsn {
                name: self.inner.name.clone(),
                source,
            })?;

        let new_pool = self.open_verified(&url).await?;

        match self.swap_pool(new_pool) {
            Ok(previous) => {
                if let Some(previous) = previous {
                    tokio::spawn(pool::close_pool(previous));
                }
            }
            Err(new_pool) => {
                debug!(connection = %self.inner.name, "Service closed during rotation");
                pool::close_pool(new_pool).await;
                return Ok(());
            }
        }

        info!(
            connection = %self.inner.name,
            duration_ms = started.elapsed().as_millis() as u64,
            "Swapped connection pool with rotated credentials"
        );
        self.emit(
            self.event(EventKind::CredentialsRotated)
                .with("endpoint", refreshed.endpoint)
                .with_duration(started.elapsed()),
        )
        .await;

        Ok(())
    }

    /// Current pool handle
    ///
    /// The handle is cloned under the read lock; the lock is released before
    /// the caller uses it.
    pub fn pool(&self) -> Result<AnyPool, DatabaseError> {
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| DatabaseError::NotConnected(self.inner.name.clone()))
    }

    fn query_error(&self, source: sqlx::Error) -> DatabaseError {
        DatabaseError::Query {
            name: self.inner.name.clone(),
            source,
        }
    }

    async fn record_query<T>(
        &self,
        started: Instant,
        result: Result<T, sqlx::Error>,
    ) -> Result<T, DatabaseError> {
        match result {
            Ok(value) => {
                self.emit(
                    self.event(EventKind::QueryExecuted)
                        .with_duration(started.elapsed()),
                )
                .await;
                Ok(value)
            }
            Err(source) => {
                debug!(connection = %self.inner.name, error = %source, "Query failed");
                self.emit(
                    self.event(EventKind::QueryError)
                        .with_duration(started.elapsed())
                        .with_error(&source),
                )
                .await;
                Err(self.query_error(source))
            }
        }
    }

    /// Executes raw SQL (may contain several statements) and returns rows affected
    pub async fn execute(&self, sql: &str) -> Result<u64, DatabaseError> {
        let pool = self.pool()?;
        let started = Instant::now();
        let result = pool.execute(sql).await.map(|done| done.rows_affected());
        self.record_query(started, result).await
    }

    /// Executes a query with bound arguments and returns rows affected
    pub async fn execute_query<'q>(
        &self,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> Result<u64, DatabaseError> {
        let pool = self.pool()?;
        let started = Instant::now();
        let result = query.execute(&pool).await.map(|done| done.rows_affected());
        self.record_query(started, result).await
    }

    /// Runs raw SQL and returns every row
    pub async fn fetch_all(&self, sql: &str) -> Result<Vec<AnyRow>, DatabaseError> {
        let pool = self.pool()?;
        let started = Instant::now();
        let result = pool.fetch_all(sql).await;
        self.record_query(started, result).await
    }

    /// Runs a query with bound arguments and returns every row
    pub async fn fetch_all_query<'q>(
        &self,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> Result<Vec<AnyRow>, DatabaseError> {
        let pool = self.pool()?;
        let started = Instant::now();
        let result = query.fetch_all(&pool).await;
        self.record_query(started, result).await
    }

    /// Begins a transaction on the current pool
    ///
    /// The transaction keeps its connection even if the pool is swapped
    /// while it is open.
    pub async fn begin(&self) -> Result<Transaction<'static, Any>, DatabaseError> {
        let pool = self.pool()?;
        let tx = pool.begin().await.map_err(|e| self.query_error(e))?;
        self.emit(self.event(EventKind::TransactionStarted)).await;
        Ok(tx)
    }

    /// Commits a transaction started with [`begin`](DatabaseService::begin)
    pub async fn commit(&self, tx: Transaction<'static, Any>) -> Result<(), DatabaseError> {
        match tx.commit().await {
            Ok(()) => {
                self.emit(self.event(EventKind::TransactionCommitted)).await;
                Ok(())
            }
            Err(source) => {
                self.emit(
                    self.event(EventKind::QueryError)
                        .with("stage", "commit")
                        .with_error(&source),
                )
                .await;
                Err(self.query_error(source))
            }
        }
    }

    /// Rolls back a transaction, logging rather than returning failures
    pub async fn rollback(&self, tx: Transaction<'static, Any>) {
        if let Err(e) = tx.rollback().await {
            warn!(connection = %self.inner.name, error = %e, "Transaction rollback failed");
        }
        self.emit(self.event(EventKind::TransactionRolledBack)).await;
    }

    /// Pings the server through the current pool
    pub async fn ping(&self) -> Result<(), DatabaseError> {
        let pool = self.pool()?;
        pool::ping(&pool)
            .await
            .map_err(|source| DatabaseError::PingFailed {
                name: self.inner.name.clone(),
                source,
            })
    }

    /// Statistics for the current pool
    pub fn stats(&self) -> Result<PoolStats, DatabaseError> {
        let pool = self.pool()?;
        Ok(pool::pool_stats(&pool, self.inner.config.max_open_connections))
    }

    /// Stops token rotation and closes the pool
    ///
    /// The service cannot be reconnected afterwards.
    pub async fn close(&self) {
        if let Some(provider) = &self.inner.token_provider {
            provider.stop_token_refresh().await;
        }

        self.inner.cancel.cancel();

        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                if !e.is_cancelled() {
                    warn!(connection = %self.inner.name, error = %e, "Refresh listener ended abnormally");
                }
            }
        }

        let pool = self
            .inner
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(pool) = pool {
            pool::close_pool(pool).await;
            info!(connection = %self.inner.name, "Database disconnected");
            self.emit(self.event(EventKind::ConnectionDisconnected)).await;
        }
    }
}

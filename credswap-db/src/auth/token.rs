//! IAM token provider
//!
//! Caches one token per endpoint and keeps it fresh, either on demand or from
//! a background loop.
//!
//! # Token Lifecycle
//!
//! ```text
//! Idle ──get_token──▶ Cached ──expiry──▶ Stale
//!                       ▲                  │
//!                       └─────refresh──────┘
//! ```
//!
//! A token is considered fresh for `token_refresh_interval` after it was
//! fetched (default 600s, below the 900s upstream lifetime). The refresh loop
//! fetches a new token on the same period.
//!
//! # Notifications
//!
//! Every successful refresh is published as a [`TokenRefreshed`] message on
//! the channel returned by [`IamTokenProvider::subscribe`]. There is a single
//! subscriber; subscribing again replaces it.
//!
//! # Failures
//!
//! A failed refresh leaves the cached token untouched. The loop logs the
//! failure and tries again on the next tick. Empty tokens are never cached.

use super::rds::TokenSource;
use super::AuthError;
use crate::config::AuthConfig;
use crate::dsn;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A cached token and the instant it stops being served
#[derive(Debug, Clone)]
pub struct CachedToken {
    /// Token value
    pub value: String,

    /// When the token goes stale
    pub expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Published after every successful refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRefreshed {
    /// The new token
    pub token: String,

    /// Endpoint the token is valid for
    pub endpoint: String,
}

struct RefreshLoop {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-endpoint IAM token cache with background refresh
pub struct IamTokenProvider {
    region: String,
    db_user: String,
    refresh_interval: Duration,
    source: Arc<dyn TokenSource>,
    cache: RwLock<HashMap<String, CachedToken>>,
    subscriber: Mutex<Option<mpsc::UnboundedSender<TokenRefreshed>>>,
    refresh_loop: Mutex<Option<RefreshLoop>>,
}

impl IamTokenProvider {
    /// Creates a provider for the given IAM settings
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if region or database user is empty
    /// or the refresh interval is zero.
    pub fn new(config: &AuthConfig, source: Arc<dyn TokenSource>) -> Result<Self, AuthError> {
        if config.region.trim().is_empty() {
            return Err(AuthError::InvalidConfig("region is required".into()));
        }
        if config.db_user.trim().is_empty() {
            return Err(AuthError::InvalidConfig("db_user is required".into()));
        }
        if config.token_refresh_interval == 0 {
            return Err(AuthError::InvalidConfig(
                "token_refresh_interval must be positive".into(),
            ));
        }

        Ok(Self {
            region: config.region.clone(),
            db_user: config.db_user.clone(),
            refresh_interval: config.refresh_interval(),
            source,
            cache: RwLock::new(HashMap::new()),
            subscriber: Mutex::new(None),
            refresh_loop: Mutex::new(None),
        })
    }

    /// Refresh period and freshness window
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Returns the cached token for `endpoint`, fetching one if missing or stale
    ///
    /// Concurrent callers racing on a stale token trigger a single upstream
    /// fetch: the freshness check is repeated after taking the write lock.
    pub async fn get_token(&self, endpoint: &str) -> Result<String, AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some(token) = cache.get(endpoint).filter(|token| token.is_fresh()) {
                return Ok(token.value.clone());
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(token) = cache.get(endpoint).filter(|token| token.is_fresh()) {
            debug!(endpoint = %endpoint, "IAM token refreshed by a concurrent caller");
            return Ok(token.value.clone());
        }

        self.refresh_locked(&mut cache, endpoint).await
    }

    /// Fetches a new token for `endpoint` regardless of the cached one
    pub async fn refresh_token(&self, endpoint: &str) -> Result<String, AuthError> {
        let mut cache = self.cache.write().await;
        self.refresh_locked(&mut cache, endpoint).await
    }

    async fn refresh_locked(
        &self,
        cache: &mut HashMap<String, CachedToken>,
        endpoint: &str,
    ) -> Result<String, AuthError> {
        let value = self
            .source
            .fetch_token(endpoint, &self.region, &self.db_user)
            .await?;

        if value.is_empty() {
            return Err(AuthError::TokenFetch {
                endpoint: endpoint.to_string(),
                message: "credential source returned an empty token".into(),
            });
        }

        cache.insert(
            endpoint.to_string(),
            CachedToken {
                value: value.clone(),
                expires_at: Instant::now() + self.refresh_interval,
            },
        );
        debug!(endpoint = %endpoint, "Cached new IAM token");

        self.notify(TokenRefreshed {
            token: value.clone(),
            endpoint: endpoint.to_string(),
        });

        Ok(value)
    }

    fn notify(&self, event: TokenRefreshed) {
        let mut subscriber = lock(&self.subscriber);
        if let Some(tx) = subscriber.as_ref() {
            if tx.send(event).is_err() {
                debug!("Token refresh subscriber dropped");
                *subscriber = None;
            }
        }
    }

    /// Subscribes to refresh notifications, replacing any previous subscriber
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TokenRefreshed> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.subscriber) = Some(tx);
        rx
    }

    /// Builds a DSN whose password is the current token for its endpoint
    ///
    /// # Errors
    ///
    /// Wraps failures from endpoint extraction, token fetch and password
    /// replacement.
    pub async fn build_dsn_with_iam_token(&self, dsn: &str) -> Result<String, AuthError> {
        let endpoint = dsn::extract_endpoint(dsn)?;
        let token = self.get_token(&endpoint).await?;
        Ok(dsn::replace_password(dsn, &token)?)
    }

    /// Starts the periodic refresh loop for `endpoint`
    ///
    /// Only one loop runs per provider; calls while it is running are no-ops.
    /// The loop stops when `cancel` fires or [`stop_token_refresh`] is called.
    ///
    /// [`stop_token_refresh`]: IamTokenProvider::stop_token_refresh
    pub fn start_token_refresh(self: &Arc<Self>, cancel: &CancellationToken, endpoint: &str) {
        let mut running = lock(&self.refresh_loop);
        if running.is_some() {
            debug!(endpoint = %endpoint, "IAM token refresh loop already running");
            return;
        }

        let stop = cancel.child_token();
        let provider = Arc::clone(self);
        let loop_stop = stop.clone();
        let endpoint = endpoint.to_string();

        info!(
            endpoint = %endpoint,
            interval_seconds = self.refresh_interval.as_secs(),
            "Starting IAM token refresh loop"
        );

        let handle = tokio::spawn(async move {
            provider.run_refresh_loop(endpoint, loop_stop).await;
        });

        *running = Some(RefreshLoop { handle, stop });
    }

    async fn run_refresh_loop(&self, endpoint: String, stop: CancellationToken) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.refresh_interval, self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                result = self.refresh_token(&endpoint) => match result {
                    Ok(_) => info!(endpoint = %endpoint, "Refreshed IAM token"),
                    Err(e) => warn!(
                        endpoint = %endpoint,
                        error = %e,
                        "IAM token refresh failed, keeping cached token"
                    ),
                },
            }
        }

        debug!(endpoint = %endpoint, "IAM token refresh loop stopped");
    }

    /// Stops the refresh loop and waits for it to exit
    ///
    /// Returns immediately if the loop was never started.
    pub async fn stop_token_refresh(&self) {
        let running = lock(&self.refresh_loop).take();
        let Some(RefreshLoop { handle, stop }) = running else {
            debug!("IAM token refresh loop not running");
            return;
        };

        stop.cancel();
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "IAM token refresh loop ended abnormally");
            }
        }
    }

    /// Whether the refresh loop is running
    pub fn is_refreshing(&self) -> bool {
        lock(&self.refresh_loop)
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }
}

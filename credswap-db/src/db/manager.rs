//! Named set of database connections
//!
//! The manager owns one [`DatabaseService`] per configured connection and
//! resolves the default connection. Services are created on construction and
//! opened by [`DatabaseManager::connect_all`].

use super::health::{HealthEvaluator, HealthReport};
use super::service::DatabaseService;
use super::DatabaseError;
use crate::auth::rds::TokenSource;
use crate::config::DatabaseConfig;
use crate::events::{emit_best_effort, DatabaseEvent, EventEmitter, EventKind};
use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// All configured connections
pub struct DatabaseManager {
    services: HashMap<String, DatabaseService>,
    default: Option<String>,
    emitter: Arc<dyn EventEmitter>,
    health: HealthEvaluator,
}

impl DatabaseManager {
    /// Validates `config`, builds a service per connection and emits `config.loaded`
    ///
    /// # Errors
    ///
    /// Returns the first configuration error, tagged with the connection name.
    pub async fn new(
        config: DatabaseConfig,
        emitter: Arc<dyn EventEmitter>,
        token_source: Arc<dyn TokenSource>,
    ) -> Result<Self, DatabaseError> {
        config.validate().map_err(|source| DatabaseError::Config {
            name: config.default.clone(),
            source,
        })?;

        let default = config.default_connection_name().map(str::to_string);

        let mut services = HashMap::with_capacity(config.connections.len());
        for (name, connection) in config.connections {
            let service = DatabaseService::with_collaborators(
                name.clone(),
                connection,
                Arc::clone(&emitter),
                Arc::clone(&token_source),
            )?;
            services.insert(name, service);
        }

        let mut names: Vec<&str> = services.keys().map(String::as_str).collect();
        names.sort_unstable();

        info!(
            connections = services.len(),
            default = default.as_deref().unwrap_or(""),
            "Database configuration loaded"
        );
        emit_best_effort(
            emitter.as_ref(),
            DatabaseEvent::new(EventKind::ConfigLoaded, default.as_deref().unwrap_or(""), "")
                .with("connections", json!(names)),
        )
        .await;

        Ok(Self {
            services,
            default,
            emitter,
            health: HealthEvaluator::default(),
        })
    }

    /// Replaces the health evaluator
    pub fn with_health_evaluator(mut self, health: HealthEvaluator) -> Self {
        self.health = health;
        self
    }

    /// Connects every service concurrently
    ///
    /// Every connect attempt runs to completion. Returns the first failure in
    /// name order; services that did connect stay connected.
    pub async fn connect_all(&self) -> Result<(), DatabaseError> {
        let results = join_all(self.services().into_iter().map(|service| service.connect())).await;
        results.into_iter().collect()
    }

    /// Service by name
    pub fn get(&self, name: &str) -> Result<&DatabaseService, DatabaseError> {
        self.services
            .get(name)
            .ok_or_else(|| DatabaseError::UnknownConnection(name.to_string()))
    }

    /// The default service
    pub fn default_service(&self) -> Result<&DatabaseService, DatabaseError> {
        match &self.default {
            Some(name) => self.get(name),
            None => Err(DatabaseError::UnknownConnection("default".to_string())),
        }
    }

    /// Name of the default connection, if one is resolved
    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// All services, sorted by name
    pub fn services(&self) -> Vec<&DatabaseService> {
        let mut services: Vec<&DatabaseService> = self.services.values().collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }

    /// Health report for every service
    pub async fn check_health(&self) -> Vec<HealthReport> {
        let services: Vec<DatabaseService> = self.services().into_iter().cloned().collect();
        self.health.check(&services).await
    }

    /// Closes every service
    pub async fn close_all(&self) {
        join_all(self.services().into_iter().map(|service| service.close())).await;
        info!("All database connections closed");
    }

    /// The emitter shared by every service
    pub fn emitter(&self) -> &Arc<dyn EventEmitter> {
        &self.emitter
    }
}

impl Drop for DatabaseManager {
    fn drop(&mut self) {
        let open = self.services.values().filter(|s| s.is_connected()).count();
        if open > 0 {
            warn!(open, "Database manager dropped with open connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::rds::RdsTokenSource;
    use crate::config::ConnectionConfig;
    use crate::events::{ChannelEmitter, NoopEmitter};

    fn config(names: &[&str], default: &str) -> DatabaseConfig {
        DatabaseConfig {
            default: default.to_string(),
            connections: names
                .iter()
                .map(|name| {
                    (
                        name.to_string(),
                        ConnectionConfig::new("sqlite", "sqlite::memory:"),
                    )
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_new_emits_config_loaded() {
        let (emitter, mut rx) = ChannelEmitter::new();
        let manager = DatabaseManager::new(
            config(&["reporting", "primary"], "primary"),
            Arc::new(emitter),
            Arc::new(RdsTokenSource::new()),
        )
        .await
        .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::ConfigLoaded);
        assert_eq!(event.get("connections"), Some(&json!(["primary", "reporting"])));

        assert_eq!(manager.default_service().unwrap().name(), "primary");
        let names: Vec<&str> = manager.services().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["primary", "reporting"]);
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let manager = DatabaseManager::new(
            config(&["a", "b"], ""),
            Arc::new(NoopEmitter),
            Arc::new(RdsTokenSource::new()),
        )
        .await
        .unwrap();

        assert!(matches!(
            manager.get("missing"),
            Err(DatabaseError::UnknownConnection(_))
        ));
        assert!(matches!(
            manager.default_service(),
            Err(DatabaseError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_single_connection_is_default() {
        let manager = DatabaseManager::new(
            config(&["only"], ""),
            Arc::new(NoopEmitter),
            Arc::new(RdsTokenSource::new()),
        )
        .await
        .unwrap();

        assert_eq!(manager.default_name(), Some("only"));
    }

    #[tokio::test]
    async fn test_invalid_default_rejected() {
        let result = DatabaseManager::new(
            config(&["a"], "missing"),
            Arc::new(NoopEmitter),
            Arc::new(RdsTokenSource::new()),
        )
        .await;

        assert!(matches!(result, Err(DatabaseError::Config { .. })));
    }

    #[tokio::test]
    async fn test_connect_all_finishes_siblings_of_a_failure() {
        let mut config = config(&["alpha", "omega"], "alpha");
        config.connections.insert(
            "broken".to_string(),
            ConnectionConfig::new("sqlite", "sqlite:///nonexistent-credswap-dir/db.sqlite"),
        );
        let manager = DatabaseManager::new(
            config,
            Arc::new(NoopEmitter),
            Arc::new(RdsTokenSource::new()),
        )
        .await
        .unwrap();

        let result = manager.connect_all().await;

        assert!(matches!(result, Err(DatabaseError::PingFailed { .. })));
        assert!(!manager.get("broken").unwrap().is_connected());
        assert!(manager.get("alpha").unwrap().is_connected());
        assert!(manager.get("omega").unwrap().is_connected());
        manager.close_all().await;
    }
}

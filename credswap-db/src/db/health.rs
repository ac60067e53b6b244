//! Per-connection health classification
//!
//! Every check pings the connection and reads pool statistics:
//!
//! | Condition                                | Status    |
//! |------------------------------------------|-----------|
//! | ping fails or times out                  | unhealthy |
//! | zero open connections                    | unhealthy |
//! | open / max > 0.9 (bounded pools only)    | degraded  |
//! | otherwise                                | healthy   |
//!
//! Connections are checked one after another within an overall budget,
//! [`recommended_timeout`] by default. Each ping gets the smaller of the
//! per-ping timeout and what is left of the budget; connections reached after
//! the budget is spent are reported unhealthy without being pinged.
//!
//! The evaluator never decides overall readiness; it only produces one
//! report per connection for an external aggregator.

use super::pool::PoolStats;
use super::service::DatabaseService;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Component name used for every report
pub const HEALTH_COMPONENT: &str = "database";

/// Utilization above which a pool is reported as degraded
pub const DEGRADED_UTILIZATION: f64 = 0.9;

/// Default upper bound for a single ping
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

const BASE_TIMEOUT: Duration = Duration::from_secs(5);
const PER_CONNECTION_TIMEOUT: Duration = Duration::from_secs(2);

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

/// Result of checking one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Reporting module
    pub module: String,

    /// `database` or `database:<connection>`
    pub component: String,

    pub status: HealthStatus,

    /// Human-readable summary
    pub message: String,

    /// Pool statistics and error text
    pub details: Map<String, JsonValue>,

    pub checked_at: DateTime<Utc>,

    /// Whether an aggregator may ignore this component
    pub optional: bool,
}

impl HealthReport {
    fn new(module: &str, component: String, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            module: module.to_string(),
            component,
            status,
            message: message.into(),
            details: Map::new(),
            checked_at: Utc::now(),
            optional: false,
        }
    }

    fn with_stats(mut self, stats: &PoolStats) -> Self {
        self.details
            .insert("open_connections".into(), stats.open_connections.into());
        self.details.insert("in_use".into(), stats.in_use.into());
        self.details.insert("idle".into(), stats.idle.into());
        self.details
            .insert("max_open_connections".into(), stats.max_open_connections.into());
        if let Some(utilization) = stats.utilization() {
            self.details.insert("utilization".into(), utilization.into());
        }
        self
    }

    fn with_error(mut self, error: &dyn fmt::Display) -> Self {
        self.details
            .insert("error".into(), JsonValue::String(error.to_string()));
        self
    }

    /// True for [`HealthStatus::Healthy`]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Classifies a pool that answered its ping
pub fn classify(stats: &PoolStats) -> (HealthStatus, String) {
    if stats.open_connections == 0 {
        return (HealthStatus::Unhealthy, "no open connections".to_string());
    }

    match stats.utilization() {
        Some(utilization) if utilization > DEGRADED_UTILIZATION => (
            HealthStatus::Degraded,
            format!(
                "high connection utilization: {}/{}",
                stats.open_connections, stats.max_open_connections
            ),
        ),
        _ => (HealthStatus::Healthy, "connection healthy".to_string()),
    }
}

/// Time budget for checking `connections` connections serially
///
/// 5 s base plus 2 s for every connection beyond the first.
pub fn recommended_timeout(connections: usize) -> Duration {
    let extra = u32::try_from(connections.saturating_sub(1)).unwrap_or(u32::MAX);
    BASE_TIMEOUT.saturating_add(PER_CONNECTION_TIMEOUT.saturating_mul(extra))
}

/// Produces health reports for a set of connections
#[derive(Debug, Clone)]
pub struct HealthEvaluator {
    module: String,
    ping_timeout: Duration,
    budget: Option<Duration>,
}

impl Default for HealthEvaluator {
    fn default() -> Self {
        Self::new("credswap-db")
    }
}

impl HealthEvaluator {
    /// Creates an evaluator reporting as `module`
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ping_timeout: DEFAULT_PING_TIMEOUT,
            budget: None,
        }
    }

    /// Overrides the per-ping timeout
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Overrides the overall budget of [`check`](HealthEvaluator::check)
    ///
    /// Without an override the budget is [`recommended_timeout`] for the
    /// number of services checked.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Checks every service, returning at least one report
    ///
    /// With no services a single unhealthy "no connections available" report
    /// is returned.
    pub async fn check(&self, services: &[DatabaseService]) -> Vec<HealthReport> {
        if services.is_empty() {
            return vec![HealthReport::new(
                &self.module,
                HEALTH_COMPONENT.to_string(),
                HealthStatus::Unhealthy,
                "no connections available",
            )];
        }

        let budget = self
            .budget
            .unwrap_or_else(|| recommended_timeout(services.len()));
        let deadline = Instant::now() + budget;

        let mut reports = Vec::with_capacity(services.len());
        for service in services {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let report = if remaining.is_zero() {
                warn!(
                    connection = %service.name(),
                    budget = ?budget,
                    "Health check budget exhausted"
                );
                HealthReport::new(
                    &self.module,
                    format!("{HEALTH_COMPONENT}:{}", service.name()),
                    HealthStatus::Unhealthy,
                    format!("health check budget of {budget:?} exhausted"),
                )
            } else {
                self.check_within(service, self.ping_timeout.min(remaining))
                    .await
            };
            reports.push(report);
        }
        reports
    }

    /// Checks a single service
    pub async fn check_service(&self, service: &DatabaseService) -> HealthReport {
        self.check_within(service, self.ping_timeout).await
    }

    async fn check_within(&self, service: &DatabaseService, ping_timeout: Duration) -> HealthReport {
        let component = format!("{HEALTH_COMPONENT}:{}", service.name());

        let ping = tokio::time::timeout(ping_timeout, service.ping()).await;
        let report = match ping {
            Err(_) => HealthReport::new(
                &self.module,
                component,
                HealthStatus::Unhealthy,
                format!("ping timed out after {ping_timeout:?}"),
            ),
            Ok(Err(e)) => HealthReport::new(
                &self.module,
                component,
                HealthStatus::Unhealthy,
                "ping failed",
            )
            .with_error(&e),
            Ok(Ok(())) => match service.stats() {
                Ok(stats) => {
                    let (status, message) = classify(&stats);
                    HealthReport::new(&self.module, component, status, message).with_stats(&stats)
                }
                Err(e) => HealthReport::new(
                    &self.module,
                    component,
                    HealthStatus::Unhealthy,
                    "pool statistics unavailable",
                )
                .with_error(&e),
            },
        };

        if report.status == HealthStatus::Healthy {
            debug!(connection = %service.name(), "Database health check passed");
        } else {
            warn!(
                connection = %service.name(),
                status = %report.status,
                message = %report.message,
                "Database health check reported a problem"
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(open: u32, max: u32) -> PoolStats {
        PoolStats {
            open_connections: open,
            in_use: open,
            idle: 0,
            max_open_connections: max,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&stats(0, 10)).0, HealthStatus::Unhealthy);
        assert_eq!(classify(&stats(5, 10)).0, HealthStatus::Healthy);
        assert_eq!(classify(&stats(9, 10)).0, HealthStatus::Healthy);
        assert_eq!(classify(&stats(10, 10)).0, HealthStatus::Degraded);
        assert_eq!(classify(&stats(1, 1)).0, HealthStatus::Degraded);
        assert_eq!(classify(&stats(500, 0)).0, HealthStatus::Healthy);
    }

    #[test]
    fn test_recommended_timeout() {
        assert_eq!(recommended_timeout(0), Duration::from_secs(5));
        assert_eq!(recommended_timeout(1), Duration::from_secs(5));
        assert_eq!(recommended_timeout(3), Duration::from_secs(9));
    }

    #[test]
    fn test_report_serialization() {
        let report = HealthReport::new("m", "database:primary".into(), HealthStatus::Degraded, "busy")
            .with_stats(&stats(10, 10));
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["status"], "degraded");
        assert_eq!(json["details"]["max_open_connections"], 10);
        assert_eq!(json["details"]["utilization"], 1.0);
        assert_eq!(json["optional"], false);
    }

    #[tokio::test]
    async fn test_empty_set_yields_single_unhealthy_report() {
        let reports = HealthEvaluator::default().check(&[]).await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, HealthStatus::Unhealthy);
        assert_eq!(reports[0].message, "no connections available");
    }
}

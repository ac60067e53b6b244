/// Integration tests for configuration loading and the connection manager
mod common;

use common::{drain, init_tracing, StaticTokenSource};
use credswap_db::config::{DatabaseConfig, Driver};
use credswap_db::db::health::HealthStatus;
use credswap_db::db::manager::DatabaseManager;
use credswap_db::events::{ChannelEmitter, EventKind};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let primary = dir.path().join("primary.db");
    let reporting = dir.path().join("reporting.db");
    let contents = format!(
        r#"
default = "primary"

[connections.primary]
driver = "sqlite"
dsn = "sqlite://{}?mode=rwc"
max_open_connections = 5

[connections.reporting]
driver = "sqlite3"
dsn = "sqlite://{}?mode=rwc"
"#,
        primary.display(),
        reporting.display()
    );

    let path = dir.path().join("database.toml");
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_load_from_file_with_env_override() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir);

    std::env::set_var(
        "CREDSWAP_DATABASE_CONNECTIONS__REPORTING__MAX_IDLE_CONNECTIONS",
        "3",
    );
    let config = DatabaseConfig::load(&path).unwrap();
    std::env::remove_var("CREDSWAP_DATABASE_CONNECTIONS__REPORTING__MAX_IDLE_CONNECTIONS");

    assert_eq!(config.default_connection_name(), Some("primary"));
    let primary = &config.connections["primary"];
    assert_eq!(primary.max_open_connections, 5);
    assert_eq!(primary.check().unwrap(), Driver::Sqlite);

    let reporting = &config.connections["reporting"];
    assert_eq!(reporting.max_idle_connections, 3);
    assert_eq!(reporting.max_open_connections, 10);
    assert!(reporting.aws_iam_auth.is_none());
}

#[test]
fn test_load_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    assert!(DatabaseConfig::load(dir.path().join("missing.toml")).is_err());
}

#[tokio::test]
async fn test_manager_lifecycle() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let config = DatabaseConfig::load(write_config(&dir))?;
    let (emitter, mut rx) = ChannelEmitter::new();

    let manager = DatabaseManager::new(
        config,
        Arc::new(emitter),
        Arc::new(StaticTokenSource::new("unused")),
    )
    .await?;
    manager.connect_all().await?;

    let default = manager.default_service()?;
    assert_eq!(default.name(), "primary");
    default.execute("CREATE TABLE t (id INTEGER)").await?;

    let reporting = manager.get("reporting")?;
    assert!(reporting.is_connected());
    // Separate databases: the table only exists on the default connection.
    assert!(reporting.execute("SELECT * FROM t").await.is_err());

    let reports = manager.check_health().await;
    assert_eq!(reports.len(), 2);
    assert!(reports
        .iter()
        .all(|report| report.status == HealthStatus::Healthy));

    manager.close_all().await;
    assert!(manager.services().iter().all(|s| !s.is_connected()));

    let events = drain(&mut rx);
    assert_eq!(events[0].kind, EventKind::ConfigLoaded);
    assert_eq!(
        events
            .iter()
            .filter(|e| e.kind == EventKind::ConnectionConnected)
            .count(),
        2
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| e.kind == EventKind::ConnectionDisconnected)
            .count(),
        2
    );
    Ok(())
}

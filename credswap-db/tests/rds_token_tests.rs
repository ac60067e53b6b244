/// Integration tests for the RDS token source
///
/// Kept in their own binary: the default AWS provider chain reads process
/// environment variables, which these tests rewrite.
mod common;

use common::init_tracing;
use credswap_db::auth::rds::{RdsTokenSource, TokenSource};
use credswap_db::auth::token::IamTokenProvider;
use std::env;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

const CHAIN_OVERRIDES: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_WEB_IDENTITY_TOKEN_FILE",
    "AWS_ROLE_ARN",
    "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI",
    "AWS_CONTAINER_CREDENTIALS_FULL_URI",
];

#[tokio::test]
async fn test_credentials_resolved_from_shared_profile() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let credentials = dir.path().join("credentials");
    let config = dir.path().join("config");
    fs::write(
        &credentials,
        "[credswap]\naws_access_key_id = AKIDPROFILE\naws_secret_access_key = profilesecret\n",
    )?;
    fs::write(&config, "")?;

    for name in CHAIN_OVERRIDES {
        env::remove_var(name);
    }
    env::set_var("AWS_SHARED_CREDENTIALS_FILE", &credentials);
    env::set_var("AWS_CONFIG_FILE", &config);
    env::set_var("AWS_PROFILE", "credswap");
    env::set_var("AWS_EC2_METADATA_DISABLED", "true");

    let source = Arc::new(RdsTokenSource::new());
    let token = source
        .fetch_token("db.example.com:5432", "us-east-1", "app")
        .await?;

    assert!(token.starts_with("db.example.com:5432/?"), "{token}");
    assert!(token.contains("X-Amz-Credential=AKIDPROFILE%2F"));
    assert!(!token.contains("profilesecret"));

    let provider = IamTokenProvider::new(&common::iam_auth(600), source)?;
    let dsn = provider
        .build_dsn_with_iam_token("postgres://app@db.example.com:5432/app")
        .await?;
    assert!(dsn.starts_with("postgres://app:db.example.com%3A5432%2F%3FAction%3Dconnect"));
    assert!(dsn.ends_with("@db.example.com:5432/app"));
    Ok(())
}

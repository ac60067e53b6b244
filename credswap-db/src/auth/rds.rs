//! RDS IAM token generation
//!
//! An RDS IAM authentication token is a SigV4-presigned `connect` request for
//! the database endpoint, minus the scheme:
//!
//! ```text
//! db.example.com:5432/?Action=connect&DBUser=app&X-Amz-Algorithm=AWS4-HMAC-SHA256
//!     &X-Amz-Credential=AKID%2F20240115%2Fus-east-1%2Frds-db%2Faws4_request
//!     &X-Amz-Date=20240115T120000Z&X-Amz-Expires=900&X-Amz-SignedHeaders=host
//!     &X-Amz-Signature=...
//! ```
//!
//! Tokens are signed locally by the `aws-sdk-rds` token generator and stay
//! valid for 15 minutes. Credentials come from the AWS default provider chain
//! (environment, shared config and credentials files, SSO, web identity,
//! container and instance metadata), so temporary credentials are refreshed
//! by the chain's cache rather than read once.

use super::AuthError;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_rds::auth_token::{AuthTokenGenerator, Config as AuthTokenConfig};
use aws_sdk_rds::config::SharedCredentialsProvider;
use tokio::sync::OnceCell;
use tracing::debug;

/// SigV4 service name for RDS IAM authentication
pub const RDS_SERVICE: &str = "rds-db";

/// Lifetime of a generated token (seconds)
pub const TOKEN_EXPIRY_SECONDS: u64 = 900;

/// Upstream source of IAM database tokens
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Produces a fresh token for `db_user` at `endpoint` (`host:port`)
    async fn fetch_token(
        &self,
        endpoint: &str,
        region: &str,
        db_user: &str,
    ) -> Result<String, AuthError>;
}

/// Token source that signs RDS `connect` requests with AWS credentials
///
/// [`RdsTokenSource::new`] loads the default provider chain on the first
/// fetch and reuses it afterwards.
#[derive(Debug, Clone)]
pub struct RdsTokenSource {
    sdk_config: OnceCell<SdkConfig>,
    credentials: Option<SharedCredentialsProvider>,
}

impl Default for RdsTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RdsTokenSource {
    /// Resolves credentials through the AWS default provider chain
    pub fn new() -> Self {
        Self {
            sdk_config: OnceCell::new(),
            credentials: None,
        }
    }

    /// Uses an already loaded SDK configuration
    pub fn with_sdk_config(sdk_config: SdkConfig) -> Self {
        Self {
            sdk_config: OnceCell::from(sdk_config),
            credentials: None,
        }
    }

    /// Signs with an explicit credentials provider, bypassing the default chain
    pub fn with_credentials(credentials: SharedCredentialsProvider) -> Self {
        let sdk_config = SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials.clone())
            .build();

        Self {
            sdk_config: OnceCell::from(sdk_config),
            credentials: Some(credentials),
        }
    }

    async fn sdk_config(&self) -> &SdkConfig {
        self.sdk_config
            .get_or_init(|| async {
                debug!("Loading AWS credentials from the default provider chain");
                aws_config::defaults(BehaviorVersion::latest()).load().await
            })
            .await
    }
}

/// Splits `host:port`; RDS tokens are always scoped to an explicit port
fn split_endpoint(endpoint: &str) -> Result<(&str, u64), AuthError> {
    endpoint
        .rsplit_once(':')
        .and_then(|(host, port)| {
            let port = port.parse().ok()?;
            (!host.is_empty()).then_some((host, port))
        })
        .ok_or_else(|| {
            AuthError::InvalidConfig(format!("endpoint {endpoint} is not in host:port form"))
        })
}

#[async_trait]
impl TokenSource for RdsTokenSource {
    async fn fetch_token(
        &self,
        endpoint: &str,
        region: &str,
        db_user: &str,
    ) -> Result<String, AuthError> {
        let (hostname, port) = split_endpoint(endpoint)?;

        let mut config = AuthTokenConfig::builder()
            .hostname(hostname)
            .port(port)
            .username(db_user)
            .region(Region::new(region.to_string()));
        if let Some(credentials) = &self.credentials {
            config = config.credentials(credentials.clone());
        }
        let config = config
            .build()
            .map_err(|e| AuthError::InvalidConfig(e.to_string()))?;

        let token = AuthTokenGenerator::new(config)
            .auth_token(self.sdk_config().await)
            .await
            .map_err(|e| AuthError::TokenFetch {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;

        debug!(endpoint = %endpoint, region = %region, "Generated RDS IAM auth token");
        Ok(token.as_str().to_string())
    }
}

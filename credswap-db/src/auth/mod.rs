//! IAM database authentication
//!
//! Short-lived IAM tokens stand in for a static database password. This
//! module obtains them and keeps them fresh:
//!
//! # Modules
//!
//! - [`rds`]: the upstream credential source (`TokenSource`) and the RDS
//!   token source backed by the AWS default credentials chain
//! - [`token`]: per-endpoint token cache, background refresh loop and
//!   refresh notifications
//!
//! # Example
//!
//! ```no_run
//! use credswap_db::auth::rds::RdsTokenSource;
//! use credswap_db::auth::token::IamTokenProvider;
//! use credswap_db::config::AuthConfig;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let auth = AuthConfig {
//!     enabled: true,
//!     region: "us-east-1".to_string(),
//!     db_user: "app".to_string(),
//!     ..Default::default()
//! };
//!
//! let provider = IamTokenProvider::new(&auth, Arc::new(RdsTokenSource::new()))?;
//! let dsn = provider
//!     .build_dsn_with_iam_token("postgres://app@db.example.com:5432/app")
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod rds;
pub mod token;

use crate::dsn::DsnError;
use thiserror::Error;

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    /// IAM auth settings are incomplete
    #[error("Invalid IAM auth configuration: {0}")]
    InvalidConfig(String),

    /// The credential source failed to produce a token (including when no
    /// AWS credentials could be resolved)
    #[error("Failed to fetch IAM token for {endpoint}: {message}")]
    TokenFetch {
        /// Endpoint the token was requested for
        endpoint: String,

        /// Reason reported by the source
        message: String,
    },

    /// The DSN could not be parsed or rewritten
    #[error("DSN error: {0}")]
    Dsn(#[from] DsnError),
}

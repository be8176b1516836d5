//! Remote bearer token verification.

mod dev;
mod grpc;

use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;

pub use dev::{DEV_MODE_TOKEN_LIFETIME, DevModeAuthVerifier};
pub use grpc::{GrpcAuthVerifier, proto};

/// Where unauthenticated users are sent to sign in and out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfiguration {
    pub logon_url: String,
    pub logout_url: String,
}

/// What the verifier said about one token.
///
/// `expires_at` comes from the verifier and is authoritative; a result is
/// stale once `now >= expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub token: String,
    pub valid: bool,
    pub user_id: String,
    pub expires_at: SystemTime,
}

impl VerificationResult {
    /// Whether the result is still within its freshness window at `now`.
    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifierError {
    #[error("invalid verifier endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("verifier transport error: {0}")]
    Transport(String),

    #[error("verifier returned {code}: {message}")]
    Status { code: String, message: String },
}

impl From<tonic::Status> for VerifierError {
    fn from(status: tonic::Status) -> Self {
        VerifierError::Status {
            code: format!("{:?}", status.code()),
            message: status.message().to_string(),
        }
    }
}

/// The remote service that decides whether a bearer token is valid.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    /// Logon and logout URLs used for redirects.
    async fn configuration(&self) -> Result<AuthConfiguration, VerifierError>;

    async fn verify_token(&self, token: &str) -> Result<VerificationResult, VerifierError>;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn freshness_is_exclusive_of_expiry() {
        let now = SystemTime::now();
        let result = VerificationResult {
            token: "t".into(),
            valid: true,
            user_id: "u".into(),
            expires_at: now,
        };
        assert!(!result.is_fresh_at(now));
        assert!(result.is_fresh_at(now - Duration::from_secs(1)));
    }

    #[test]
    fn status_maps_code_and_message() {
        let err = VerifierError::from(tonic::Status::unavailable("down"));
        assert_eq!(
            err,
            VerifierError::Status {
                code: "Unavailable".into(),
                message: "down".into()
            }
        );
    }
}

use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use super::{AuthConfiguration, AuthVerifier, VerificationResult, VerifierError};

pub const DEV_MODE_TOKEN_LIFETIME: Duration = Duration::from_secs(15 * 60);

const DEV_LOGON_URL: &str = "http://localhost:9999/signin";
const DEV_LOGOUT_URL: &str = "http://localhost:9999/logout";

/// In-process verifier for development: every token is valid and names its
/// own user. Never enable it in front of a real CA.
#[derive(Debug, Clone, Default)]
pub struct DevModeAuthVerifier;

#[async_trait]
impl AuthVerifier for DevModeAuthVerifier {
    async fn configuration(&self) -> Result<AuthConfiguration, VerifierError> {
        Ok(AuthConfiguration {
            logon_url: DEV_LOGON_URL.to_string(),
            logout_url: DEV_LOGOUT_URL.to_string(),
        })
    }

    async fn verify_token(&self, token: &str) -> Result<VerificationResult, VerifierError> {
        Ok(VerificationResult {
            token: token.to_string(),
            valid: true,
            user_id: token.to_string(),
            expires_at: SystemTime::now() + DEV_MODE_TOKEN_LIFETIME,
        })
    }
}

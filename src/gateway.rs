//! Bearer token front door for the issuance API.
//!
//! Every request must carry `Authorization: Bearer <token>`. Tokens are
//! looked up in the [`TokenCache`] first and verified remotely on a miss,
//! through the circuit breaker named [`AUTH_VERIFIER_BREAKER`]. Any doubt
//! about a token denies the request: missing or invalid credentials redirect
//! to the logon page, and an unavailable verifier yields `503`.

use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakers};
use crate::token_cache::TokenCache;
use crate::verifier::{AuthConfiguration, AuthVerifier, VerificationResult};

/// Breaker guarding calls to the auth verifier.
pub const AUTH_VERIFIER_BREAKER: &str = "auth-verifier";

/// Header carrying the authenticated user id to the downstream handler.
pub const REMOTE_USER_HEADER: &str = "grpc-metadata-x-remoteuser";

const BEARER_PATTERN: &str = r"(?i)^\s*bearer\s+([[:alnum:]]+)";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unable to retrieve configuration URLs from the authentication service: {0}")]
    Configuration(String),
    #[error("invalid bearer token pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// The verified caller, attached to allowed requests as an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

/// Outcome of authorizing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(AuthenticatedUser),
    /// Send the caller to the logon page.
    Redirect(&'static str),
    /// The verifier could not be consulted; deny.
    Unavailable,
}

pub struct SecurityGateway {
    verifier: Arc<dyn AuthVerifier>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<TokenCache>,
    configuration: AuthConfiguration,
    bearer: Regex,
}

impl std::fmt::Debug for SecurityGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityGateway")
            .field("breaker", &self.breaker.name())
            .field("configuration", &self.configuration)
            .finish_non_exhaustive()
    }
}

impl SecurityGateway {
    /// Fetches the logon/logout URLs through the verifier breaker before
    /// any traffic is served.
    pub async fn new(
        verifier: Arc<dyn AuthVerifier>,
        breakers: &CircuitBreakers,
        cache: Arc<TokenCache>,
    ) -> Result<Self, GatewayError> {
        let breaker = breakers.get(AUTH_VERIFIER_BREAKER);
        let configuration = breaker
            .call(verifier.configuration())
            .await
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;
        debug!(logon_url = %configuration.logon_url, logout_url = %configuration.logout_url, "gateway configured");

        Ok(Self {
            verifier,
            breaker,
            cache,
            configuration,
            bearer: Regex::new(BEARER_PATTERN)?,
        })
    }

    pub fn configuration(&self) -> &AuthConfiguration {
        &self.configuration
    }

    /// Extracts the token from an `Authorization` header value.
    pub fn bearer_token<'a>(&self, authorization: &'a str) -> Option<&'a str> {
        self.bearer
            .captures(authorization)
            .and_then(|captures| captures.get(1))
            .map(|token| token.as_str())
    }

    /// Decides whether a request with `headers` may proceed.
    pub async fn check(&self, headers: &HeaderMap) -> Decision {
        let Some(authorization) = headers.get(header::AUTHORIZATION) else {
            return Decision::Redirect("missing authorization header");
        };
        let Some(token) = authorization
            .to_str()
            .ok()
            .and_then(|value| self.bearer_token(value))
        else {
            return Decision::Redirect("malformed bearer token");
        };

        // An open breaker denies cached tokens too.
        if self.breaker.is_open() {
            return Decision::Unavailable;
        }

        let now = SystemTime::now();
        match self.cache.get(token).await {
            Some(cached) if cached.valid && cached.is_fresh_at(now) => {
                return Decision::Allow(AuthenticatedUser {
                    user_id: cached.user_id,
                });
            }
            Some(_) => self.cache.delete(token).await,
            None => {}
        }

        let result = match self.breaker.call(self.verifier.verify_token(token)).await {
            Ok(result) => result,
            Err(err) => {
                warn!(breaker = AUTH_VERIFIER_BREAKER, error = %err, "token verification unavailable");
                return Decision::Unavailable;
            }
        };

        self.admit(token, result, SystemTime::now()).await
    }

    async fn admit(&self, token: &str, result: VerificationResult, now: SystemTime) -> Decision {
        if !result.valid {
            debug!("verifier rejected token");
            return Decision::Redirect("invalid token");
        }
        let Ok(ttl) = result.expires_at.duration_since(now) else {
            warn!(user_id = %result.user_id, "verifier returned an already expired result");
            return Decision::Redirect("stale verification");
        };
        if ttl.is_zero() {
            warn!(user_id = %result.user_id, "verifier returned an already expired result");
            return Decision::Redirect("stale verification");
        }

        let user = AuthenticatedUser {
            user_id: result.user_id.clone(),
        };
        self.cache.set(token, result, ttl).await;
        Decision::Allow(user)
    }

    fn redirect_to_logon(&self) -> Response {
        Redirect::temporary(&self.configuration.logon_url).into_response()
    }

    /// Axum middleware; install with `axum::middleware::from_fn_with_state`.
    pub async fn authorize(
        State(gateway): State<Arc<SecurityGateway>>,
        mut request: Request,
        next: Next,
    ) -> Response {
        match gateway.check(request.headers()).await {
            Decision::Allow(user) => {
                let headers = request.headers_mut();
                headers.remove(REMOTE_USER_HEADER);
                let Ok(value) = HeaderValue::from_str(&user.user_id) else {
                    error!(user_id = ?user.user_id, "verifier returned a user id that is not a valid header value");
                    return StatusCode::SERVICE_UNAVAILABLE.into_response();
                };
                headers.insert(REMOTE_USER_HEADER, value);
                request.extensions_mut().insert(user);
                next.run(request).await
            }
            Decision::Redirect(reason) => {
                debug!(reason, "redirecting to logon");
                gateway.redirect_to_logon()
            }
            Decision::Unavailable => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rstest::rstest;

    use super::*;
    use crate::verifier::{DEV_MODE_TOKEN_LIFETIME, DevModeAuthVerifier, VerifierError};

    /// Dev verifier that counts `verify_token` calls.
    #[derive(Default)]
    struct CountingVerifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AuthVerifier for CountingVerifier {
        async fn configuration(&self) -> Result<AuthConfiguration, VerifierError> {
            DevModeAuthVerifier.configuration().await
        }

        async fn verify_token(&self, token: &str) -> Result<VerificationResult, VerifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            DevModeAuthVerifier.verify_token(token).await
        }
    }

    async fn dev_gateway() -> SecurityGateway {
        SecurityGateway::new(
            Arc::new(DevModeAuthVerifier),
            &CircuitBreakers::default(),
            Arc::new(TokenCache::new(16)),
        )
        .await
        .unwrap()
    }

    async fn counting_gateway() -> (SecurityGateway, Arc<CountingVerifier>) {
        let verifier = Arc::new(CountingVerifier::default());
        let gateway = SecurityGateway::new(
            Arc::clone(&verifier) as Arc<dyn AuthVerifier>,
            &CircuitBreakers::default(),
            Arc::new(TokenCache::new(16)),
        )
        .await
        .unwrap();
        (gateway, verifier)
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[rstest]
    #[case("Bearer abc123", Some("abc123"))]
    #[case("bearer abc123", Some("abc123"))]
    #[case("  BEARER   Tok3n trailing", Some("Tok3n"))]
    #[case("Basic dXNlcjpwYXNz", None)]
    #[case("Bearer", None)]
    #[case("Bearer !!!", None)]
    #[tokio::test]
    async fn parses_bearer_header(#[case] header: &str, #[case] expected: Option<&str>) {
        let gateway = dev_gateway().await;
        assert_eq!(gateway.bearer_token(header), expected);
    }

    #[tokio::test]
    async fn stale_and_invalid_results_are_not_admitted() {
        let gateway = dev_gateway().await;
        let now = SystemTime::now();
        let stale = VerificationResult {
            token: "t".into(),
            valid: true,
            user_id: "u".into(),
            expires_at: now,
        };
        assert_eq!(
            gateway.admit("t", stale, now).await,
            Decision::Redirect("stale verification")
        );
        assert_eq!(gateway.cache.get("t").await, None);

        let invalid = VerificationResult {
            token: "t".into(),
            valid: false,
            user_id: String::new(),
            expires_at: now + Duration::from_secs(60),
        };
        assert_eq!(
            gateway.admit("t", invalid, now).await,
            Decision::Redirect("invalid token")
        );
    }

    #[tokio::test]
    async fn valid_result_is_cached_until_expiry() {
        let gateway = dev_gateway().await;
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer alice"));

        let decision = gateway.check(&headers).await;
        assert_eq!(
            decision,
            Decision::Allow(AuthenticatedUser {
                user_id: "alice".into()
            })
        );
        let cached = gateway.cache.get("alice").await.unwrap();
        assert_eq!(cached.user_id, "alice");
    }

    #[tokio::test]
    async fn open_breaker_still_redirects_requests_without_a_token() {
        let (gateway, verifier) = counting_gateway().await;
        assert!(matches!(gateway.check(&bearer("alice")).await, Decision::Allow(_)));

        gateway.breaker.trip();

        assert_eq!(
            gateway.check(&HeaderMap::new()).await,
            Decision::Redirect("missing authorization header")
        );
        let mut basic = HeaderMap::new();
        basic.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert_eq!(
            gateway.check(&basic).await,
            Decision::Redirect("malformed bearer token")
        );
        assert_eq!(gateway.check(&bearer("alice")).await, Decision::Unavailable);
        assert_eq!(gateway.check(&bearer("bob")).await, Decision::Unavailable);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_cache_entry_is_replaced_by_a_fresh_verification() {
        let (gateway, verifier) = counting_gateway().await;
        let now = SystemTime::now();
        let expired = VerificationResult {
            token: "alice".into(),
            valid: true,
            user_id: "stale-alice".into(),
            expires_at: now - Duration::from_secs(1),
        };
        // The cache ttl outlives the verifier's own expiry.
        gateway
            .cache
            .set("alice", expired, Duration::from_secs(3600))
            .await;
        assert!(gateway.cache.get("alice").await.is_some());

        let decision = gateway.check(&bearer("alice")).await;

        assert_eq!(
            decision,
            Decision::Allow(AuthenticatedUser {
                user_id: "alice".into()
            })
        );
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
        let refreshed = gateway.cache.get("alice").await.unwrap();
        assert_eq!(refreshed.user_id, "alice");
        assert!(refreshed.is_fresh_at(SystemTime::now()));
        assert!(refreshed.expires_at > now + DEV_MODE_TOKEN_LIFETIME - Duration::from_secs(60));

        // The fresh entry now serves from cache.
        assert!(matches!(gateway.check(&bearer("alice")).await, Decision::Allow(_)));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_cache_entry_is_reverified() {
        let (gateway, verifier) = counting_gateway().await;
        let rejected = VerificationResult {
            token: "alice".into(),
            valid: false,
            user_id: String::new(),
            expires_at: SystemTime::now() + Duration::from_secs(600),
        };
        gateway
            .cache
            .set("alice", rejected, Duration::from_secs(600))
            .await;

        assert!(matches!(gateway.check(&bearer("alice")).await, Decision::Allow(_)));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
        assert!(gateway.cache.get("alice").await.unwrap().valid);
    }
}

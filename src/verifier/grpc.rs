use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use super::{AuthConfiguration, AuthVerifier, VerificationResult, VerifierError};

/// Wire messages of the `service.AuthVerifier` gRPC service.
pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ConfigurationRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ConfigurationResponse {
        #[prost(string, tag = "1")]
        pub logon_url: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub logout_url: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VerificationRequest {
        #[prost(string, tag = "1")]
        pub token: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VerificationResponse {
        #[prost(bool, tag = "1")]
        pub valid: bool,
        #[prost(string, tag = "2")]
        pub user_id: ::prost::alloc::string::String,
        /// Unix seconds after which the result must be re-verified.
        #[prost(int64, tag = "3")]
        pub cache_expiration: i64,
    }
}

const CONFIGURATION_PATH: &str = "/service.AuthVerifier/Configuration";
const VERIFY_TOKEN_PATH: &str = "/service.AuthVerifier/VerifyToken";

/// gRPC client for a remote `AuthVerifier`.
///
/// The channel connects lazily and reconnects on its own, so constructing
/// the client never blocks on the network.
#[derive(Debug, Clone)]
pub struct GrpcAuthVerifier {
    channel: Channel,
}

impl GrpcAuthVerifier {
    pub fn connect(endpoint: &str, connect_timeout: Duration) -> Result<Self, VerifierError> {
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| VerifierError::InvalidEndpoint(e.to_string()))?
            .connect_timeout(connect_timeout)
            .connect_lazy();
        Ok(Self { channel })
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp, VerifierError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut client = tonic::client::Grpc::new(self.channel.clone());
        client
            .ready()
            .await
            .map_err(|e| VerifierError::Transport(e.to_string()))?;
        let response = client
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                ProstCodec::<Req, Resp>::default(),
            )
            .await?;
        Ok(response.into_inner())
    }
}

/// Converts the wire expiry to wall-clock time. Negative values are the epoch.
fn expiry_from_unix_seconds(seconds: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::try_from(seconds).unwrap_or(0))
}

impl From<proto::VerificationResponse> for VerificationResult {
    fn from(response: proto::VerificationResponse) -> Self {
        VerificationResult {
            token: String::new(),
            valid: response.valid,
            user_id: response.user_id,
            expires_at: expiry_from_unix_seconds(response.cache_expiration),
        }
    }
}

#[async_trait]
impl AuthVerifier for GrpcAuthVerifier {
    async fn configuration(&self) -> Result<AuthConfiguration, VerifierError> {
        let response: proto::ConfigurationResponse = self
            .unary(CONFIGURATION_PATH, proto::ConfigurationRequest {})
            .await?;
        Ok(AuthConfiguration {
            logon_url: response.logon_url,
            logout_url: response.logout_url,
        })
    }

    async fn verify_token(&self, token: &str) -> Result<VerificationResult, VerifierError> {
        let response: proto::VerificationResponse = self
            .unary(
                VERIFY_TOKEN_PATH,
                proto::VerificationRequest {
                    token: token.to_string(),
                },
            )
            .await?;
        debug!(valid = response.valid, user_id = %response.user_id, "token verified");
        Ok(VerificationResult {
            token: token.to_string(),
            ..VerificationResult::from(response)
        })
    }
}

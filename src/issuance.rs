//! The create-certificate operation and its HTTP/JSON binding.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, instrument, warn};

use crate::authority::CertificateAuthority;
use crate::error::IssuanceError;
use crate::gateway::REMOTE_USER_HEADER;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCertificateRequest {
    pub name: String,
    #[serde(default)]
    pub alternate_names: Vec<String>,
    /// Validity in days.
    pub duration: i32,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCertificateReply {
    pub certificate: String,
    pub key: String,
}

impl std::fmt::Debug for CreateCertificateReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateCertificateReply")
            .field("certificate", &self.certificate)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Wraps the CA with the caller authorization check.
#[derive(Debug, Clone)]
pub struct IssuanceService {
    ca: Arc<CertificateAuthority>,
    authorized_creators: Vec<String>,
}

impl IssuanceService {
    /// Blank entries in `authorized_creators` are ignored; a list with no
    /// named users lets any authenticated caller create certificates.
    pub fn new(ca: Arc<CertificateAuthority>, authorized_creators: Vec<String>) -> Self {
        let authorized_creators = authorized_creators
            .into_iter()
            .map(|user| user.trim().to_string())
            .filter(|user| !user.is_empty())
            .collect();
        Self {
            ca,
            authorized_creators,
        }
    }

    pub fn authority(&self) -> &CertificateAuthority {
        &self.ca
    }

    fn authorize(&self, caller: Option<&str>) -> Result<(), IssuanceError> {
        if self.authorized_creators.is_empty() {
            return Ok(());
        }
        match caller {
            Some(user) if self.authorized_creators.iter().any(|u| u == user) => Ok(()),
            other => Err(IssuanceError::NotAuthorized {
                user: other.unwrap_or_default().to_string(),
            }),
        }
    }

    #[instrument(skip(self, request), fields(name = %request.name, caller = caller.unwrap_or("-")))]
    pub fn create_certificate(
        &self,
        request: CreateCertificateRequest,
        caller: Option<&str>,
    ) -> Result<CreateCertificateReply, IssuanceError> {
        self.authorize(caller)
            .inspect_err(|err| warn!(error = %err, "caller rejected"))?;

        let duration = time::Duration::days(i64::from(request.duration));
        let issued = self
            .ca
            .create_certificate(&request.name, &request.alternate_names, duration)?;
        Ok(CreateCertificateReply {
            certificate: issued.certificate,
            key: issued.key,
        })
    }
}

impl IntoResponse for IssuanceError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            IssuanceError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            IssuanceError::NotAuthorized { .. } => (StatusCode::FORBIDDEN, self.to_string()),
            IssuanceError::SigningFailure(_) | IssuanceError::Encoding(_) => {
                error!(error = %self, "certificate creation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "unable to create certificate".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// `POST /api/v1/certificates`
pub async fn create_certificate_handler(
    State(service): State<Arc<IssuanceService>>,
    headers: HeaderMap,
    Json(request): Json<CreateCertificateRequest>,
) -> Result<Json<CreateCertificateReply>, IssuanceError> {
    let caller = headers
        .get(REMOTE_USER_HEADER)
        .and_then(|value| value.to_str().ok());
    service.create_certificate(request, caller).map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case_fields() {
        let request: CreateCertificateRequest = serde_json::from_value(json!({
            "name": "a.example.com",
            "alternateNames": ["b.example.com"],
            "duration": 30
        }))
        .unwrap();
        assert_eq!(request.alternate_names, vec!["b.example.com"]);
        assert_eq!(request.duration, 30);

        let without_alternates: CreateCertificateRequest =
            serde_json::from_value(json!({ "name": "a.example.com", "duration": 1 })).unwrap();
        assert!(without_alternates.alternate_names.is_empty());
    }

    #[test]
    fn error_statuses() {
        let validation = IssuanceError::Validation(crate::error::ValidationError::DomainNotPermitted {
            host: "evil.org".to_string(),
        });
        assert_eq!(validation.into_response().status(), StatusCode::BAD_REQUEST);

        let denied = IssuanceError::NotAuthorized {
            user: "mallory".to_string(),
        };
        assert_eq!(denied.into_response().status(), StatusCode::FORBIDDEN);

        let signing = IssuanceError::SigningFailure("hsm offline".to_string());
        assert_eq!(signing.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

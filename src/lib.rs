//! # certmgr - name-constrained certificate issuance
//!
//! certmgr is a small certificate authority service. Authenticated callers
//! ask for a leaf certificate for a host name; the service checks the request
//! against the signing CA's permitted DNS domains, generates a fresh ECDSA
//! P-256 key and returns the signed certificate and key as PEM.
//!
//! Every request passes through a [`gateway::SecurityGateway`] first. It
//! extracts the bearer token, consults a [`token_cache::TokenCache`], and
//! verifies unknown tokens against a remote [`verifier::AuthVerifier`] guarded
//! by a [`circuit_breaker::CircuitBreaker`]. Any doubt about a token denies
//! the request.
//!
//! ## Issuing directly
//!
//! ```rust,no_run
//! use certmgr::authority::{CaPolicy, CertificateAuthority};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ca = CertificateAuthority::from_files(
//!     "internal",
//!     "ca.pem".as_ref(),
//!     "ca-key.pem".as_ref(),
//!     None,
//!     CaPolicy::default(),
//! )?;
//!
//! let issued = ca.create_certificate(
//!     "api.example.com",
//!     &["api-v2.example.com".to_string()],
//!     time::Duration::days(30),
//! )?;
//! println!("{}", issued.certificate);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`authority`]: the signing CA, request validation and leaf issuance
//! - [`issuance`]: caller authorization and the HTTP/JSON binding
//! - [`gateway`]: bearer token authentication middleware
//! - [`verifier`]: remote token verification over gRPC, plus a dev-mode verifier
//! - [`token_cache`]: TTL cache of verification results
//! - [`circuit_breaker`]: failure isolation for remote calls
//! - [`key`], [`cert`], [`issuer`], [`tbs_certificate`]: X.509 building blocks
//! - [`config`], [`telemetry`], [`server`]: service plumbing

pub mod authority;
pub mod cert;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod issuance;
pub mod issuer;
pub mod key;
pub mod pem_utils;
pub mod server;
pub mod tbs_certificate;
pub mod telemetry;
pub mod token_cache;
pub mod verifier;

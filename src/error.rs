//! Error types shared by the certificate and issuance layers.
//!
//! ```
//! use certmgr::error::ValidationError;
//!
//! let err = ValidationError::SubjectMustNotBeIp { host: "192.0.2.1".into() };
//! assert!(err.to_string().contains("192.0.2.1"));
//! ```

use thiserror::Error;

/// Errors raised by the low-level X.509, key and PEM plumbing.
#[derive(Debug, Error, Clone)]
pub enum CertError {
    /// Error during data encoding.
    #[error("Failed to encode data: {0}")]
    EncodingError(String),

    /// Error during data decoding.
    #[error("Failed to decode data: {0}")]
    DecodingError(String),

    /// Error due to invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Error during key generation.
    #[error("Key generation error: {0}")]
    KeyGenerationError(String),

    /// The private key is protected by a passphrase.
    #[error("private key is encrypted; passphrase-protected keys are not supported")]
    EncryptedKey,

    /// The key algorithm cannot be used as a signing capability.
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// The signing operation itself failed.
    #[error("Signing error: {0}")]
    SigningError(String),
}

impl From<der::Error> for CertError {
    fn from(err: der::Error) -> Self {
        CertError::DecodingError(err.to_string())
    }
}

impl From<pkcs8::Error> for CertError {
    fn from(err: pkcs8::Error) -> Self {
        CertError::DecodingError(err.to_string())
    }
}

impl From<x509_cert::spki::Error> for CertError {
    fn from(err: x509_cert::spki::Error) -> Self {
        CertError::EncodingError(err.to_string())
    }
}

impl From<pem::PemError> for CertError {
    fn from(err: pem::PemError) -> Self {
        CertError::DecodingError(err.to_string())
    }
}

impl From<rsa::Error> for CertError {
    fn from(err: rsa::Error) -> Self {
        CertError::KeyGenerationError(err.to_string())
    }
}

impl From<rsa::pkcs1::Error> for CertError {
    fn from(err: rsa::pkcs1::Error) -> Self {
        CertError::EncodingError(err.to_string())
    }
}

/// The signing CA could not be constructed. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A configured input file could not be read.
    #[error("unable to read {description} from {path}: {source}")]
    Io {
        description: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Input was not valid PEM, or not the expected PEM block.
    #[error("unable to decode the {what} PEM: {reason}")]
    InvalidPem { what: &'static str, reason: String },

    /// The signing certificate could not be parsed.
    #[error("unable to parse the signing certificate: {0}")]
    InvalidCertificate(String),

    /// The signing key is passphrase-protected.
    #[error("signing key requires a passphrase; this is unsupported")]
    EncryptedKey,

    /// The signing key could not be parsed as unencrypted PKCS#8.
    #[error("unable to parse the signing key: {0}")]
    InvalidKey(String),

    /// The signing key algorithm is not usable for signing certificates.
    #[error("signing key is not a usable signer: {0}")]
    UnsupportedKeyType(String),

    /// The signing key does not correspond to the signing certificate.
    #[error("signing key does not match the public key of the signing certificate")]
    KeyMismatch,

    /// The intermediate bundle is not valid PEM.
    #[error("unable to decode the CA bundle: {0}")]
    InvalidBundle(String),

    /// The signing certificate carries no permitted DNS domains and the
    /// configuration demands them.
    #[error("signing certificate carries no permitted DNS domain constraints")]
    UnconstrainedCa,
}

/// A requested certificate was rejected before any key material was created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("host name {host:?} is not supported: {reason}")]
    UnsupportedHostFormat { host: String, reason: &'static str },

    #[error("subject name of certificate must NOT be an IP address ({host})")]
    SubjectMustNotBeIp { host: String },

    #[error("{host} is not a permitted domain")]
    DomainNotPermitted { host: String },

    #[error("requested validity of {requested_days} days is outside the permitted range of 1..={max_days} days")]
    DurationOutOfRange { requested_days: i64, max_days: i64 },
}

/// Failures of a create-certificate call.
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("certificate signing failed: {0}")]
    SigningFailure(String),

    #[error("unable to encode issued certificate: {0}")]
    Encoding(String),

    #[error("user {user:?} is not authorized to create certificates")]
    NotAuthorized { user: String },
}

impl From<CertError> for IssuanceError {
    fn from(err: CertError) -> Self {
        match err {
            CertError::SigningError(msg) => IssuanceError::SigningFailure(msg),
            other => IssuanceError::Encoding(other.to_string()),
        }
    }
}

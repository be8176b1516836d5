pub mod extensions;
pub mod params;

use der::{Decode, Encode, EncodePem};
use extensions::{NameConstraints, SubjectAltName, SubjectKeyIdentifier, ToAndFromX509Extension};
use params::{CertificationRequestInfo, DistinguishedName, Validity};
use x509_cert::certificate::CertificateInner;
use x509_cert::name::Name;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};

use crate::error::CertError;
use crate::issuer::Issuer;
use crate::key::KeyPair;
use crate::pem_utils;

pub type Result<T> = std::result::Result<T, CertError>;

/// Represents the supported signature algorithms for certificates.
///
/// This enum provides a mapping to the corresponding OIDs for each algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// SHA-256 with RSA encryption (PKCS#1 v1.5).
    Sha256WithRSA,
    /// SHA-256 with ECDSA.
    Sha256WithECDSA,
    /// SHA-384 with ECDSA.
    Sha384WithECDSA,
    /// Pure Ed25519.
    Ed25519,
}

impl From<SignatureAlgorithm> for AlgorithmIdentifierOwned {
    /// RSA carries explicit NULL parameters; ECDSA and Ed25519 carry none.
    fn from(value: SignatureAlgorithm) -> Self {
        match value {
            SignatureAlgorithm::Sha256WithRSA => AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc5912::SHA_256_WITH_RSA_ENCRYPTION,
                parameters: Some(der::Any::null()),
            },
            SignatureAlgorithm::Sha256WithECDSA => AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc5912::ECDSA_WITH_SHA_256,
                parameters: None,
            },
            SignatureAlgorithm::Sha384WithECDSA => AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc5912::ECDSA_WITH_SHA_384,
                parameters: None,
            },
            SignatureAlgorithm::Ed25519 => AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc8410::ID_ED_25519,
                parameters: None,
            },
        }
    }
}

impl TryFrom<&AlgorithmIdentifierOwned> for SignatureAlgorithm {
    type Error = CertError;

    fn try_from(value: &AlgorithmIdentifierOwned) -> Result<Self> {
        match value.oid {
            const_oid::db::rfc5912::SHA_256_WITH_RSA_ENCRYPTION => Ok(Self::Sha256WithRSA),
            const_oid::db::rfc5912::ECDSA_WITH_SHA_256 => Ok(Self::Sha256WithECDSA),
            const_oid::db::rfc5912::ECDSA_WITH_SHA_384 => Ok(Self::Sha384WithECDSA),
            const_oid::db::rfc8410::ID_ED_25519 => Ok(Self::Ed25519),
            other => Err(CertError::DecodingError(format!(
                "Unsupported signature algorithm {other}"
            ))),
        }
    }
}

/// Represents an X.509 certificate.
///
/// This struct provides methods to encode the certificate into DER or PEM
/// formats and to read back the fields the issuance policy depends on.
#[derive(Debug, Clone)]
pub struct Certificate {
    /// The inner representation of the certificate.
    pub inner: CertificateInner,
}

impl Certificate {
    /// Parses a single DER-encoded certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        Ok(Self {
            inner: CertificateInner::from_der(der)?,
        })
    }

    /// Parses the first PEM block, which must be a `CERTIFICATE`.
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let block = pem_utils::expect_block(pem_str, pem_utils::CERTIFICATE_LABEL)?;
        Self::from_der(block.contents())
    }

    /// Encodes the certificate into DER format.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        self.inner
            .to_der()
            .map_err(|e| CertError::EncodingError(e.to_string()))
    }

    /// Encodes the certificate into PEM format.
    pub fn to_pem(&self) -> Result<String> {
        self.inner
            .to_pem(pkcs8::LineEnding::LF)
            .map_err(|e| CertError::EncodingError(e.to_string()))
    }

    /// The subject name exactly as encoded in the certificate.
    pub fn subject_name(&self) -> &Name {
        &self.inner.tbs_certificate.subject
    }

    /// The subject name projected onto the attributes [`DistinguishedName`] models.
    pub fn subject(&self) -> DistinguishedName {
        DistinguishedName::from_x509_name(self.subject_name())
    }

    pub fn subject_public_key_info(&self) -> &SubjectPublicKeyInfoOwned {
        &self.inner.tbs_certificate.subject_public_key_info
    }

    /// Decodes the first extension with `E::OID`, if present.
    pub fn extension<E: ToAndFromX509Extension>(&self) -> Result<Option<E>> {
        self.inner
            .tbs_certificate
            .extensions
            .iter()
            .flatten()
            .find(|ext| ext.extn_id == E::OID)
            .map(|ext| E::from_x509_extension_value(ext.extn_value.as_bytes()))
            .transpose()
    }

    /// Whether the extension with `E::OID` is present and marked critical.
    pub fn is_critical<E: ToAndFromX509Extension>(&self) -> bool {
        self.inner
            .tbs_certificate
            .extensions
            .iter()
            .flatten()
            .any(|ext| ext.extn_id == E::OID && ext.critical)
    }

    pub fn subject_key_identifier(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.extension::<SubjectKeyIdentifier>()?.map(|ski| ski.0))
    }

    /// Permitted DNS domains from the Name Constraints extension; empty when absent.
    pub fn permitted_dns_domains(&self) -> Result<Vec<String>> {
        Ok(self
            .extension::<NameConstraints>()?
            .map(|nc| nc.permitted_dns_domains)
            .unwrap_or_default())
    }

    /// Subject alternative names; empty when absent.
    pub fn subject_alt_names(&self) -> Result<SubjectAltName> {
        Ok(self.extension::<SubjectAltName>()?.unwrap_or_default())
    }

    /// The validity window as encoded.
    pub fn validity(&self) -> Validity {
        let validity = &self.inner.tbs_certificate.validity;
        Validity {
            not_before: crate::tbs_certificate::from_x509_time(&validity.not_before),
            not_after: crate::tbs_certificate::from_x509_time(&validity.not_after),
        }
    }

    /// Creates a new self-signed certificate valid for `validity`.
    pub fn new_self_signed(
        cert_info: &CertificationRequestInfo,
        key: &KeyPair,
        validity: Validity,
    ) -> Result<Self> {
        let self_issuer = SelfIssuer {
            name: cert_info.subject.as_x509_name()?,
            key,
        };
        self_issuer.issue(cert_info, validity)
    }
}

// The issuer of a self-signed certificate is its own subject.
struct SelfIssuer<'a> {
    name: Name,
    key: &'a KeyPair,
}

impl Issuer for SelfIssuer<'_> {
    fn issuer_name(&self) -> Name {
        self.name.clone()
    }

    fn signing_key(&self) -> &KeyPair {
        self.key
    }
}

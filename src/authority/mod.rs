//! The signing certificate authority.
//!
//! A [`CertificateAuthority`] is built once from PEM inputs, validated
//! eagerly, and then shared read-only across every concurrent issuance call.

pub mod naming;

use std::net::IpAddr;
use std::path::Path;

use tracing::{debug, error, info, instrument, warn};
use x509_cert::name::Name;

use crate::cert::Certificate;
use crate::cert::extensions::{ExtendedKeyUsageOption, SubjectAltName};
use crate::cert::params::{CertificationRequestInfo, DistinguishedName, ExtensionParam, Validity};
use crate::error::{CertError, ConfigurationError, IssuanceError, ValidationError};
use crate::issuer::{self, Issuer};
use crate::key::KeyPair;
use crate::pem_utils;
use naming::NamePolicy;

pub const DEFAULT_CA_NAME: &str = "default";

/// Issuance policy that is not carried by the signing certificate itself.
#[derive(Debug, Clone)]
pub struct CaPolicy {
    /// Longest validity a leaf may be issued with.
    pub max_duration: time::Duration,
    /// Organization written into every leaf subject.
    pub organization: String,
    /// Refuse to start when the signing certificate has no permitted DNS domains.
    pub require_name_constraints: bool,
}

impl Default for CaPolicy {
    fn default() -> Self {
        Self {
            max_duration: time::Duration::days(365),
            organization: "certmgr".to_string(),
            require_name_constraints: false,
        }
    }
}

/// A freshly issued leaf certificate and its private key, both PEM encoded.
#[derive(Clone)]
pub struct IssuedCertificate {
    pub certificate: String,
    pub key: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("certificate", &self.certificate)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
pub struct CertificateAuthority {
    name: String,
    signing_certificate: Certificate,
    signing_key: KeyPair,
    authority_key_identifier: Vec<u8>,
    permitted_dns_domains: Vec<String>,
    bundle: String,
    policy: CaPolicy,
}

impl CertificateAuthority {
    /// Builds a CA from PEM text. An empty `name` becomes [`DEFAULT_CA_NAME`].
    pub fn from_pem(
        name: &str,
        cert_pem: &str,
        key_pem: &str,
        bundle_pem: &str,
        policy: CaPolicy,
    ) -> Result<Self, ConfigurationError> {
        let name = if name.is_empty() {
            DEFAULT_CA_NAME.to_string()
        } else {
            name.to_string()
        };

        let cert_block = pem::parse(cert_pem).map_err(|e| ConfigurationError::InvalidPem {
            what: "certificate",
            reason: e.to_string(),
        })?;
        if cert_block.tag() != pem_utils::CERTIFICATE_LABEL {
            return Err(ConfigurationError::InvalidPem {
                what: "certificate",
                reason: format!("expected a CERTIFICATE block, found {}", cert_block.tag()),
            });
        }
        let signing_certificate = Certificate::from_der(cert_block.contents())
            .map_err(|e| ConfigurationError::InvalidCertificate(e.to_string()))?;

        let key_block = pem::parse(key_pem).map_err(|e| ConfigurationError::InvalidPem {
            what: "key",
            reason: e.to_string(),
        })?;
        if pem_utils::is_encrypted(&key_block) {
            return Err(ConfigurationError::EncryptedKey);
        }
        if key_block.tag() != pem_utils::PRIVATE_KEY_LABEL {
            return Err(ConfigurationError::InvalidKey(format!(
                "expected an unencrypted PKCS#8 PRIVATE KEY block, found {}",
                key_block.tag()
            )));
        }
        let signing_key =
            KeyPair::import_from_pkcs8_der(key_block.contents()).map_err(|e| match e {
                CertError::UnsupportedKeyType(kind) => ConfigurationError::UnsupportedKeyType(kind),
                CertError::EncryptedKey => ConfigurationError::EncryptedKey,
                other => ConfigurationError::InvalidKey(other.to_string()),
            })?;

        let key_spki = signing_key
            .subject_public_key_info()
            .map_err(|e| ConfigurationError::InvalidKey(e.to_string()))?;
        if &key_spki != signing_certificate.subject_public_key_info() {
            return Err(ConfigurationError::KeyMismatch);
        }

        pem_utils::parse_bundle(bundle_pem)
            .map_err(|e| ConfigurationError::InvalidBundle(e.to_string()))?;

        let permitted_dns_domains = signing_certificate
            .permitted_dns_domains()
            .map_err(|e| ConfigurationError::InvalidCertificate(e.to_string()))?;
        if permitted_dns_domains.is_empty() {
            if policy.require_name_constraints {
                return Err(ConfigurationError::UnconstrainedCa);
            }
            warn!(ca = %name, "signing certificate has no permitted DNS domains; any domain may be issued");
        } else {
            info!(ca = %name, permitted_domains = %permitted_dns_domains.join(", "), "loaded name constraints");
        }

        let authority_key_identifier = signing_certificate
            .subject_key_identifier()
            .map_err(|e| ConfigurationError::InvalidCertificate(e.to_string()))?
            .unwrap_or_else(|| issuer::key_identifier(&key_spki));

        info!(
            ca = %name,
            subject = %signing_certificate.subject().common_name,
            key = signing_key.algorithm_name(),
            "certificate authority ready"
        );

        Ok(Self {
            name,
            signing_certificate,
            signing_key,
            authority_key_identifier,
            permitted_dns_domains,
            bundle: bundle_pem.to_string(),
            policy,
        })
    }

    /// Reads the certificate, key and optional bundle from disk, then
    /// behaves like [`CertificateAuthority::from_pem`].
    pub fn from_files(
        name: &str,
        certificate_file: &Path,
        key_file: &Path,
        bundle_file: Option<&Path>,
        policy: CaPolicy,
    ) -> Result<Self, ConfigurationError> {
        let cert_pem = read_input(certificate_file, "certificate")?;
        let key_pem = read_input(key_file, "key")?;
        let bundle_pem = match bundle_file {
            Some(path) => read_input(path, "ca bundle")?,
            None => String::new(),
        };
        Self::from_pem(name, &cert_pem, &key_pem, &bundle_pem, policy)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signing_certificate(&self) -> &Certificate {
        &self.signing_certificate
    }

    pub fn permitted_dns_domains(&self) -> &[String] {
        &self.permitted_dns_domains
    }

    /// The intermediate chain, passed through untouched.
    pub fn bundle(&self) -> &str {
        &self.bundle
    }

    pub fn policy(&self) -> &CaPolicy {
        &self.policy
    }

    /// Validates `[common_name] ++ alternate_names` and returns the hosts in
    /// the form they will be certified under.
    pub fn validate_request(
        &self,
        common_name: &str,
        alternate_names: &[String],
        duration: time::Duration,
    ) -> Result<Vec<String>, ValidationError> {
        let mut requested = Vec::with_capacity(alternate_names.len() + 1);
        requested.push(common_name.to_string());
        requested.extend(alternate_names.iter().cloned());

        naming::validate(
            &requested,
            duration,
            &NamePolicy {
                permitted_dns_domains: &self.permitted_dns_domains,
                max_duration: self.policy.max_duration,
            },
        )
    }

    /// Issues a leaf certificate with a fresh ECDSA P-256 key.
    #[instrument(skip(self), fields(ca = %self.name))]
    pub fn create_certificate(
        &self,
        common_name: &str,
        alternate_names: &[String],
        duration: time::Duration,
    ) -> Result<IssuedCertificate, IssuanceError> {
        let hosts = self
            .validate_request(common_name, alternate_names, duration)
            .inspect_err(|err| debug!(error = %err, "request rejected"))?;
        let validity = Validity::starting_now(duration).map_err(|err| {
            debug!(error = %err, "request rejected");
            ValidationError::DurationOutOfRange {
                requested_days: duration.whole_days(),
                max_days: self.policy.max_duration.whole_days(),
            }
        })?;

        let leaf_key = KeyPair::generate_ecdsa_p256();

        let mut san = SubjectAltName::default();
        for host in &hosts {
            match host.parse::<IpAddr>() {
                Ok(ip) => san.ip_addresses.push(ip),
                Err(_) => san.names.push(host.clone()),
            }
        }

        // Validation guarantees at least the common name is present.
        let subject_cn = hosts.first().cloned().unwrap_or_default();
        let subject = DistinguishedName::builder()
            .common_name(subject_cn)
            .organization(self.policy.organization.clone())
            .build();

        let request = CertificationRequestInfo::builder()
            .subject(subject)
            .subject_public_key(leaf_key.subject_public_key_info()?)
            .usages(vec![
                ExtendedKeyUsageOption::ServerAuth,
                ExtendedKeyUsageOption::ClientAuth,
            ])
            .extensions(vec![ExtensionParam::from_extension(san, false)?])
            .build();

        let certificate = self
            .issue(&request, validity)
            .map_err(IssuanceError::from)
            .inspect_err(|err| error!(error = %err, "unable to create certificate"))?;

        let issued = IssuedCertificate {
            certificate: certificate.to_pem()?,
            key: leaf_key.to_private_key_pem()?,
        };
        info!(host = %hosts.join(","), "issued certificate");
        Ok(issued)
    }
}

impl Issuer for CertificateAuthority {
    fn issuer_name(&self) -> Name {
        self.signing_certificate.subject_name().clone()
    }

    fn signing_key(&self) -> &KeyPair {
        &self.signing_key
    }

    fn authority_key_identifier(&self) -> Result<Vec<u8>, CertError> {
        Ok(self.authority_key_identifier.clone())
    }
}

fn read_input(path: &Path, description: &'static str) -> Result<String, ConfigurationError> {
    std::fs::read_to_string(path)
        .inspect_err(|err| error!(file = %path.display(), error = %err, "unable to read {description}"))
        .map_err(|source| ConfigurationError::Io {
            description,
            path: path.display().to_string(),
            source,
        })
}

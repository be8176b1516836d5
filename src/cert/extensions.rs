use std::net::IpAddr;

use const_oid::AssociatedOid;
use const_oid::db::rfc5280;
use der::{
    Decode, Encode,
    asn1::{Ia5String, OctetString},
    oid::ObjectIdentifier,
};
use x509_cert::ext::pkix::constraints::name::{GeneralSubtree, NameConstraints as X509NameConstraints};
use x509_cert::ext::pkix::name::GeneralName;

use crate::error::CertError;

/// Trait for converting to and from X.509 extensions.
///
/// This trait provides methods to encode and decode X.509 extension values.
///
/// # Example
/// ```
/// use certmgr::cert::extensions::{SubjectAltName, ToAndFromX509Extension};
///
/// let san = SubjectAltName {
///     names: vec!["example.com".to_string()],
///     ip_addresses: vec!["192.0.2.1".parse().unwrap()],
/// };
/// let encoded = san.to_x509_extension_value().unwrap();
/// let decoded = SubjectAltName::from_x509_extension_value(&encoded).unwrap();
/// assert_eq!(san.names, decoded.names);
/// assert_eq!(san.ip_addresses, decoded.ip_addresses);
/// ```
pub trait ToAndFromX509Extension {
    /// The Object Identifier (OID) for the extension.
    const OID: ObjectIdentifier;

    /// Encodes the extension into a DER-encoded byte vector.
    fn to_x509_extension_value(&self) -> Result<Vec<u8>, CertError>;

    /// Decodes the extension from a DER-encoded byte slice.
    fn from_x509_extension_value(extension: &[u8]) -> Result<Self, CertError>
    where
        Self: Sized;
}

/// Represents the Subject Alternative Name (SAN) extension.
///
/// DNS names are emitted before IP addresses; each group keeps its order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectAltName {
    pub names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl ToAndFromX509Extension for SubjectAltName {
    const OID: ObjectIdentifier = x509_cert::ext::pkix::SubjectAltName::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>, CertError> {
        let mut general_names = self
            .names
            .iter()
            .map(|name| {
                Ia5String::try_from(name.clone())
                    .map(GeneralName::DnsName)
                    .map_err(|e| CertError::InvalidInput(format!("{name}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        for ip in &self.ip_addresses {
            let octets = match ip {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            };
            general_names.push(GeneralName::IpAddress(OctetString::new(octets)?));
        }

        Ok(x509_cert::ext::pkix::SubjectAltName(general_names).to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self, CertError> {
        let san = x509_cert::ext::pkix::SubjectAltName::from_der(extension)?;
        let mut decoded = Self::default();
        for name in san.0.iter() {
            match name {
                GeneralName::DnsName(dns) => decoded.names.push(dns.to_string()),
                GeneralName::IpAddress(octets) => {
                    decoded.ip_addresses.push(ip_from_octets(octets.as_bytes())?)
                }
                _ => {
                    return Err(CertError::InvalidInput(
                        "Unsupported general name type".to_string(),
                    ));
                }
            }
        }
        Ok(decoded)
    }
}

fn ip_from_octets(octets: &[u8]) -> Result<IpAddr, CertError> {
    if let Ok(v4) = <[u8; 4]>::try_from(octets) {
        return Ok(IpAddr::from(v4));
    }
    if let Ok(v6) = <[u8; 16]>::try_from(octets) {
        return Ok(IpAddr::from(v6));
    }
    Err(CertError::DecodingError(format!(
        "IP address SAN has {} octets",
        octets.len()
    )))
}

/// Represents the Basic Constraints extension.
///
/// This extension indicates whether the certificate is a CA certificate and its path length.
///
/// # Fields
/// * `is_ca` - Indicates if the certificate is a CA.
/// * `max_path_length` - The maximum number of intermediate CAs allowed.
#[derive(Debug, Default)]
pub struct BasicConstraints {
    pub is_ca: bool,
    pub max_path_length: Option<u8>,
}

impl ToAndFromX509Extension for BasicConstraints {
    const OID: ObjectIdentifier = x509_cert::ext::pkix::BasicConstraints::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>, CertError> {
        let bc = x509_cert::ext::pkix::BasicConstraints {
            ca: self.is_ca,
            path_len_constraint: self.max_path_length,
        };

        Ok(bc.to_der()?)
    }

    fn from_x509_extension_value(der_bytes: &[u8]) -> Result<Self, CertError> {
        let bc = x509_cert::ext::pkix::BasicConstraints::from_der(der_bytes)?;
        Ok(Self {
            is_ca: bc.ca,
            max_path_length: bc.path_len_constraint,
        })
    }
}

pub use der::flagset::FlagSet;
use x509_cert::ext::pkix::KeyUsage as X509KeyUsage;
pub use x509_cert::ext::pkix::KeyUsages;

/// Represents the Key Usage extension.
///
/// This extension defines the purpose of the key contained in the certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUsage(pub FlagSet<KeyUsages>);

impl ToAndFromX509Extension for KeyUsage {
    const OID: ObjectIdentifier = <X509KeyUsage as AssociatedOid>::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>, CertError> {
        let ku = X509KeyUsage::from(self.0);
        Ok(ku.to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self, CertError> {
        let ku = X509KeyUsage::from_der(extension)?;
        Ok(Self(ku.0))
    }
}

/// Represents the Extended Key Usage extension.
///
/// This extension indicates purposes for which the public key may be used.
#[derive(Debug, Clone, Default)]
pub struct ExtendedKeyUsage {
    pub usage: Vec<ExtendedKeyUsageOption>,
}

impl ToAndFromX509Extension for ExtendedKeyUsage {
    const OID: ObjectIdentifier = x509_cert::ext::pkix::ExtendedKeyUsage::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>, CertError> {
        let oids: Vec<ObjectIdentifier> = self.usage.iter().map(|v| (*v).into()).collect();
        let eku = x509_cert::ext::pkix::ExtendedKeyUsage(oids);
        Ok(eku.to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self, CertError> {
        let eku = x509_cert::ext::pkix::ExtendedKeyUsage::from_der(extension)?;
        let usage = eku
            .0
            .iter()
            .map(|v| match *v {
                const_oid::db::rfc5912::ID_KP_SERVER_AUTH => Ok(ExtendedKeyUsageOption::ServerAuth),
                const_oid::db::rfc5912::ID_KP_CLIENT_AUTH => Ok(ExtendedKeyUsageOption::ClientAuth),
                const_oid::db::rfc5912::ID_KP_CODE_SIGNING => {
                    Ok(ExtendedKeyUsageOption::CodeSigning)
                }
                const_oid::db::rfc5912::ID_KP_OCSP_SIGNING => {
                    Ok(ExtendedKeyUsageOption::OcspSigning)
                }
                other => Err(CertError::InvalidInput(format!(
                    "Unsupported extended key usage option {other}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { usage })
    }
}

/// Represents an option for the Extended Key Usage extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedKeyUsageOption {
    ServerAuth,
    ClientAuth,
    CodeSigning,
    OcspSigning,
}

impl From<ExtendedKeyUsageOption> for ObjectIdentifier {
    fn from(value: ExtendedKeyUsageOption) -> Self {
        match value {
            ExtendedKeyUsageOption::ServerAuth => const_oid::db::rfc5912::ID_KP_SERVER_AUTH,
            ExtendedKeyUsageOption::ClientAuth => const_oid::db::rfc5912::ID_KP_CLIENT_AUTH,
            ExtendedKeyUsageOption::CodeSigning => const_oid::db::rfc5912::ID_KP_CODE_SIGNING,
            ExtendedKeyUsageOption::OcspSigning => const_oid::db::rfc5912::ID_KP_OCSP_SIGNING,
        }
    }
}

/// Represents the Authority Key Identifier (AKI) extension, key identifier form only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityKeyIdentifier {
    pub key_identifier: Vec<u8>,
}

impl ToAndFromX509Extension for AuthorityKeyIdentifier {
    const OID: ObjectIdentifier = x509_cert::ext::pkix::AuthorityKeyIdentifier::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>, CertError> {
        let aki = x509_cert::ext::pkix::AuthorityKeyIdentifier {
            key_identifier: Some(OctetString::new(self.key_identifier.as_slice())?),
            authority_cert_issuer: None,
            authority_cert_serial_number: None,
        };

        Ok(aki.to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self, CertError> {
        let aki = x509_cert::ext::pkix::AuthorityKeyIdentifier::from_der(extension)?;
        Ok(Self {
            key_identifier: aki
                .key_identifier
                .map(|id| id.as_bytes().to_vec())
                .unwrap_or_default(),
        })
    }
}

/// Represents the Subject Key Identifier (SKI) extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectKeyIdentifier(pub Vec<u8>);

impl ToAndFromX509Extension for SubjectKeyIdentifier {
    const OID: ObjectIdentifier = rfc5280::ID_CE_SUBJECT_KEY_IDENTIFIER;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>, CertError> {
        Ok(OctetString::new(self.0.as_slice())?.to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self, CertError> {
        let ski = OctetString::from_der(extension)?;
        Ok(Self(ski.as_bytes().to_vec()))
    }
}

/// The DNS portion of the Name Constraints extension.
///
/// Only `dNSName` subtrees are modelled; other permitted subtree types are
/// ignored when decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameConstraints {
    pub permitted_dns_domains: Vec<String>,
}

impl ToAndFromX509Extension for NameConstraints {
    const OID: ObjectIdentifier = rfc5280::ID_CE_NAME_CONSTRAINTS;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>, CertError> {
        let permitted = self
            .permitted_dns_domains
            .iter()
            .map(|domain| {
                let base = Ia5String::try_from(domain.clone())
                    .map(GeneralName::DnsName)
                    .map_err(|e| CertError::InvalidInput(format!("{domain}: {e}")))?;
                Ok(GeneralSubtree {
                    base,
                    minimum: 0,
                    maximum: None,
                })
            })
            .collect::<Result<Vec<_>, CertError>>()?;

        let nc = X509NameConstraints {
            permitted_subtrees: (!permitted.is_empty()).then_some(permitted),
            excluded_subtrees: None,
        };
        Ok(nc.to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self, CertError> {
        let nc = X509NameConstraints::from_der(extension)?;
        let permitted_dns_domains = nc
            .permitted_subtrees
            .unwrap_or_default()
            .into_iter()
            .filter_map(|subtree| match subtree.base {
                GeneralName::DnsName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect();
        Ok(Self {
            permitted_dns_domains,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_san_keeps_dns_and_ip_entries() {
        let original = SubjectAltName {
            names: vec!["a.example.com".to_string(), "b.example.com".to_string()],
            ip_addresses: vec!["192.0.2.1".parse().unwrap(), "2001:db8::1".parse().unwrap()],
        };
        let encoded = original.to_x509_extension_value().unwrap();
        let decoded = SubjectAltName::from_x509_extension_value(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_san_rejects_non_ascii_names() {
        let san = SubjectAltName {
            names: vec!["bücher.example.com".to_string()],
            ip_addresses: vec![],
        };
        assert!(matches!(
            san.to_x509_extension_value(),
            Err(CertError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_name_constraints_permitted_dns() {
        let original = NameConstraints {
            permitted_dns_domains: vec!["example.com".to_string(), ".example.org".to_string()],
        };
        let encoded = original.to_x509_extension_value().unwrap();
        let decoded = NameConstraints::from_x509_extension_value(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_key_identifiers() {
        let aki = AuthorityKeyIdentifier {
            key_identifier: vec![1, 2, 3, 4, 5],
        };
        let decoded =
            AuthorityKeyIdentifier::from_x509_extension_value(&aki.to_x509_extension_value().unwrap())
                .unwrap();
        assert_eq!(aki, decoded);

        let ski = SubjectKeyIdentifier(vec![9; 20]);
        let decoded =
            SubjectKeyIdentifier::from_x509_extension_value(&ski.to_x509_extension_value().unwrap())
                .unwrap();
        assert_eq!(ski, decoded);
    }

    #[test]
    fn test_unknown_extended_key_usage_is_rejected() {
        let eku = x509_cert::ext::pkix::ExtendedKeyUsage(vec![const_oid::db::rfc5912::ID_KP_TIME_STAMPING]);
        let encoded = eku.to_der().unwrap();
        assert!(ExtendedKeyUsage::from_x509_extension_value(&encoded).is_err());
    }
}

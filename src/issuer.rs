use der::flagset::FlagSet;
use rand::RngCore;
use sha1::{Digest, Sha1};
use x509_cert::certificate::CertificateInner;
use x509_cert::name::Name;
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::cert::Certificate;
use crate::cert::extensions::AuthorityKeyIdentifier;
use crate::cert::extensions::BasicConstraints;
use crate::cert::extensions::ExtendedKeyUsage;
use crate::cert::extensions::ExtendedKeyUsageOption;
use crate::cert::extensions::KeyUsage;
use crate::cert::extensions::KeyUsages;
use crate::cert::extensions::SubjectKeyIdentifier;
use crate::cert::params::Validity;
use crate::cert::params::{CertificationRequestInfo, ExtensionParam};
use crate::error::CertError;
use crate::key::KeyPair;
use crate::tbs_certificate::TbsCertificate;

/// SHA-1 over the subject public key bit string (RFC 5280 §4.2.1.2, method 1).
pub fn key_identifier(spki: &SubjectPublicKeyInfoOwned) -> Vec<u8> {
    Sha1::digest(spki.subject_public_key.raw_bytes()).to_vec()
}

/// A fresh 128-bit serial number. The top bit is cleared so the DER INTEGER
/// stays positive, and the first octet is never zero so its encoding is minimal.
pub fn random_serial_number() -> Vec<u8> {
    let mut serial = [0u8; 16];
    rand::rng().fill_bytes(&mut serial);
    serial[0] = (serial[0] & 0x7f) | 0x01;
    serial.to_vec()
}

/// Represents an entity capable of issuing certificates.
///
/// This trait provides methods to retrieve issuer details and issue certificates.
pub trait Issuer {
    /// Returns the issuer's subject name, placed verbatim in issued certificates.
    fn issuer_name(&self) -> Name;

    /// Returns the signing key of the issuer.
    fn signing_key(&self) -> &KeyPair;

    /// Key identifier written into the Authority Key Identifier of issued
    /// certificates. Defaults to the SHA-1 of the signing key's public key.
    fn authority_key_identifier(&self) -> Result<Vec<u8>, CertError> {
        Ok(key_identifier(&self.signing_key().subject_public_key_info()?))
    }

    /// Serial number for the next issued certificate.
    fn next_serial_number(&self) -> Vec<u8> {
        random_serial_number()
    }

    /// Issues a certificate based on the provided certification request information.
    ///
    /// The issuer contributes BasicConstraints, Authority and Subject Key
    /// Identifiers, Key Usage derived from the requested usages and Extended
    /// Key Usage. Request extensions follow in their given order.
    fn issue(
        &self,
        cert_request: &CertificationRequestInfo,
        validity: Validity,
    ) -> Result<Certificate, CertError> {
        let signature_algo = self.signing_key().signature_algorithm();

        let basic_constraints = BasicConstraints {
            is_ca: cert_request.is_ca,
            max_path_length: None,
        };
        let authority_key_id = AuthorityKeyIdentifier {
            key_identifier: self.authority_key_identifier()?,
        };
        let subject_key_id =
            SubjectKeyIdentifier(key_identifier(&cert_request.subject_public_key));

        let mut extensions: Vec<ExtensionParam> = vec![
            ExtensionParam::from_extension(basic_constraints, true)?,
            ExtensionParam::from_extension(authority_key_id, false)?,
            ExtensionParam::from_extension(subject_key_id, false)?,
        ];

        let mut key_usage_flags: FlagSet<KeyUsages> = FlagSet::empty();

        if cert_request.is_ca {
            key_usage_flags |= KeyUsages::KeyCertSign;
            key_usage_flags |= KeyUsages::CRLSign;
        }

        for usage in &cert_request.usages {
            match usage {
                ExtendedKeyUsageOption::ClientAuth | ExtendedKeyUsageOption::ServerAuth => {
                    key_usage_flags |= KeyUsages::DigitalSignature;
                    key_usage_flags |= KeyUsages::KeyEncipherment;
                }
                ExtendedKeyUsageOption::CodeSigning | ExtendedKeyUsageOption::OcspSigning => {
                    key_usage_flags |= KeyUsages::DigitalSignature;
                }
            }
        }

        if !key_usage_flags.is_empty() {
            let key_usage = KeyUsage(key_usage_flags);
            extensions.push(ExtensionParam::from_extension(key_usage, true)?);
        }

        if !cert_request.usages.is_empty() {
            let extended_key_usage = ExtendedKeyUsage {
                usage: cert_request.usages.clone(),
            };
            extensions.push(ExtensionParam::from_extension(extended_key_usage, false)?);
        }

        extensions.extend(cert_request.extensions.iter().cloned());

        let tbs_cert = TbsCertificate {
            serial_number: self.next_serial_number(),
            signature_algorithm: signature_algo,
            issuer: self.issuer_name(),
            not_before: validity.not_before,
            not_after: validity.not_after,
            subject: cert_request.subject.as_x509_name()?,
            subject_public_key_info: cert_request.subject_public_key.clone(),
            extensions,
        };

        let tbs_cert_inner = tbs_cert.to_tbs_certificate_inner()?;
        let tbs_der = der::Encode::to_der(&tbs_cert_inner)?;
        let signature = self.signing_key().sign_data(&tbs_der)?;

        let cert_inner = CertificateInner {
            tbs_certificate: tbs_cert_inner,
            signature_algorithm: signature_algo.into(),
            signature: der::asn1::BitString::from_bytes(&signature)?,
        };

        Ok(Certificate { inner: cert_inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::params::DistinguishedName;

    struct FixedIssuer {
        name: Name,
        key: KeyPair,
    }

    impl Issuer for FixedIssuer {
        fn issuer_name(&self) -> Name {
            self.name.clone()
        }

        fn signing_key(&self) -> &KeyPair {
            &self.key
        }

        fn next_serial_number(&self) -> Vec<u8> {
            vec![0x2a]
        }
    }

    #[test]
    fn serial_numbers_are_positive_and_distinct() {
        let a = random_serial_number();
        let b = random_serial_number();
        assert_eq!(a.len(), 16);
        assert!(a[0] & 0x80 == 0 && a[0] != 0);
        assert_ne!(a, b);
    }

    #[test]
    fn issued_leaf_carries_issuer_name_and_key_identifiers() {
        let issuer = FixedIssuer {
            name: DistinguishedName::builder()
                .common_name("Issuing CA".to_string())
                .build()
                .as_x509_name()
                .unwrap(),
            key: KeyPair::generate_ecdsa_p256(),
        };
        let leaf_key = KeyPair::generate_ecdsa_p256();
        let request = CertificationRequestInfo::builder()
            .subject(DistinguishedName::builder().common_name("leaf".to_string()).build())
            .subject_public_key(leaf_key.subject_public_key_info().unwrap())
            .usages(vec![ExtendedKeyUsageOption::ServerAuth])
            .build();

        let leaf = issuer.issue(&request, Validity::for_days(1).unwrap()).unwrap();

        assert_eq!(leaf.inner.tbs_certificate.issuer, issuer.name);
        assert_eq!(leaf.inner.tbs_certificate.serial_number.as_bytes(), &[0x2a]);
        let aki = leaf.extension::<AuthorityKeyIdentifier>().unwrap().unwrap();
        assert_eq!(aki.key_identifier, issuer.authority_key_identifier().unwrap());
        let ski = leaf.subject_key_identifier().unwrap().unwrap();
        assert_eq!(ski, key_identifier(&leaf_key.subject_public_key_info().unwrap()));

        let ku = leaf.extension::<KeyUsage>().unwrap().unwrap();
        assert_eq!(ku.0, KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment);
        assert!(leaf.is_critical::<KeyUsage>());
        assert!(!leaf.is_critical::<ExtendedKeyUsage>());
    }
}

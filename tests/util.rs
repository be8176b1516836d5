#![allow(dead_code)]

use certmgr::authority::{CaPolicy, CertificateAuthority};
use certmgr::cert::Certificate;
use certmgr::cert::extensions::NameConstraints;
use certmgr::cert::params::{CertificationRequestInfo, DistinguishedName, ExtensionParam, Validity};
use certmgr::key::KeyPair;

pub struct TestCa {
    pub cert_pem: String,
    pub key_pem: String,
    pub authority: CertificateAuthority,
}

/// A throwaway self-signed CA permitted to issue for `permitted` DNS domains.
pub fn generate_ca(permitted: &[&str]) -> TestCa {
    generate_ca_with_policy(permitted, CaPolicy::default())
}

pub fn generate_ca_with_policy(permitted: &[&str], policy: CaPolicy) -> TestCa {
    let ca_key = KeyPair::generate_ecdsa_p256();

    let subject_dn = DistinguishedName::builder()
        .common_name("certmgr test CA".to_string())
        .organization("certmgr".to_string())
        .build();

    let mut extensions = Vec::new();
    if !permitted.is_empty() {
        let constraints = NameConstraints {
            permitted_dns_domains: permitted.iter().map(|d| d.to_string()).collect(),
        };
        extensions.push(ExtensionParam::from_extension(constraints, true).unwrap());
    }

    let ca_cert_info = CertificationRequestInfo::builder()
        .subject(subject_dn)
        .subject_public_key(ca_key.subject_public_key_info().unwrap())
        .is_ca(true)
        .extensions(extensions)
        .build();

    let cert = Certificate::new_self_signed(&ca_cert_info, &ca_key, Validity::for_days(30).unwrap()).unwrap();
    let cert_pem = cert.to_pem().unwrap();
    let key_pem = ca_key.to_pkcs8_pem().unwrap();
    let authority = CertificateAuthority::from_pem("test", &cert_pem, &key_pem, "", policy).unwrap();

    TestCa {
        cert_pem,
        key_pem,
        authority,
    }
}

use std::time::SystemTime;

use der::Encode;
use der::asn1::{GeneralizedTime, OctetString, UtcTime};
use time::OffsetDateTime;
use x509_cert::Version;
use x509_cert::certificate::TbsCertificateInner;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Time;

use crate::cert::SignatureAlgorithm;
use crate::cert::params::ExtensionParam;
use crate::error::CertError;

/// Represents the "To Be Signed" (TBS) portion of an X.509 certificate.
///
/// # Fields
/// * `serial_number` - Positive big-endian serial number.
/// * `signature_algorithm` - The algorithm the issuer signs with.
/// * `issuer` - The issuer's subject name, copied verbatim from its certificate.
/// * `not_before` / `not_after` - The validity window.
/// * `subject` - The subject name.
/// * `subject_public_key_info` - The subject's public key.
/// * `extensions` - X.509 v3 extensions, in emission order.
pub struct TbsCertificate {
    pub serial_number: Vec<u8>,
    pub signature_algorithm: SignatureAlgorithm,
    pub issuer: Name,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub subject: Name,
    pub subject_public_key_info: SubjectPublicKeyInfoOwned,
    pub extensions: Vec<ExtensionParam>,
}

impl TbsCertificate {
    /// Converts the `TbsCertificate` into a `TbsCertificateInner` for DER encoding.
    pub fn to_tbs_certificate_inner(&self) -> Result<TbsCertificateInner, CertError> {
        let extensions = self
            .extensions
            .iter()
            .map(|ext| {
                Ok(x509_cert::ext::Extension {
                    extn_id: ext.oid,
                    critical: ext.critical,
                    extn_value: OctetString::new(ext.value.clone())?,
                })
            })
            .collect::<Result<Vec<_>, CertError>>()?;

        let validity = x509_cert::time::Validity {
            not_before: to_x509_time(self.not_before)?,
            not_after: to_x509_time(self.not_after)?,
        };

        Ok(TbsCertificateInner {
            version: Version::V3,
            serial_number: SerialNumber::new(self.serial_number.as_slice())?,
            signature: self.signature_algorithm.clone().into(),
            issuer: self.issuer.clone(),
            validity,
            subject: self.subject.clone(),
            subject_public_key_info: self.subject_public_key_info.clone(),
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: (!extensions.is_empty()).then_some(extensions),
        })
    }

    /// Creates a `TbsCertificate` from a `TbsCertificateInner`.
    pub fn from_tbs_certificate_inner(inner: TbsCertificateInner) -> Result<Self, CertError> {
        let extensions = inner
            .extensions
            .unwrap_or_default()
            .iter()
            .map(|ext| ExtensionParam {
                oid: ext.extn_id,
                critical: ext.critical,
                value: ext.extn_value.as_bytes().to_vec(),
            })
            .collect::<Vec<_>>();

        Ok(Self {
            serial_number: inner.serial_number.as_bytes().into(),
            signature_algorithm: SignatureAlgorithm::try_from(&inner.signature)?,
            issuer: inner.issuer,
            not_before: from_x509_time(&inner.validity.not_before),
            not_after: from_x509_time(&inner.validity.not_after),
            subject: inner.subject,
            subject_public_key_info: inner.subject_public_key_info,
            extensions,
        })
    }

    /// Encodes the `TbsCertificate` into DER format.
    pub fn to_der(&self) -> Result<Vec<u8>, CertError> {
        Ok(self.to_tbs_certificate_inner()?.to_der()?)
    }
}

/// UTCTime through 2049, GeneralizedTime from 2050 on.
pub(crate) fn to_x509_time(at: OffsetDateTime) -> Result<Time, CertError> {
    let date_time = der::DateTime::from_system_time(SystemTime::from(at))?;
    if date_time.year() < 2050 {
        Ok(Time::UtcTime(UtcTime::from_date_time(date_time)?))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_date_time(date_time)))
    }
}

pub(crate) fn from_x509_time(at: &Time) -> OffsetDateTime {
    OffsetDateTime::from(at.to_system_time())
}

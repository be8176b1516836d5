use bon::Builder;
use const_oid::ObjectIdentifier;
use const_oid::db::rfc4519;
use der::Any;
use der::asn1::{PrintableStringRef, SetOfVec, Utf8StringRef};
use time::Duration;
use time::OffsetDateTime;
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use super::extensions::ToAndFromX509Extension;
pub use crate::cert::extensions::ExtendedKeyUsage;
pub use crate::cert::extensions::ExtendedKeyUsageOption;
use crate::error::CertError;

/// Parameters for building an X.509 certificate.
///
/// # Fields
/// * `subject` - The distinguished name of the certificate subject.
/// * `subject_public_key` - The public key of the certificate subject.
/// * `usages` - A list of extended key usage options.
/// * `is_ca` - Indicates if the certificate is a CA.
/// * `extensions` - Additional X.509 extensions, emitted after the issuer's own.
#[derive(Clone, Debug, Builder)]
pub struct CertificationRequestInfo {
    pub subject: DistinguishedName,
    pub subject_public_key: SubjectPublicKeyInfoOwned,
    #[builder(default)]
    pub usages: Vec<ExtendedKeyUsageOption>,
    #[builder(default)]
    pub is_ca: bool,
    #[builder(default)]
    pub extensions: Vec<ExtensionParam>,
}

/// Distinguished name parameters for building an X.509 certificate.
///
/// Attribute values are encoded one per RDN as UTF8String, except the
/// country which is a PrintableString. Absent attributes are omitted.
#[derive(Clone, Debug, Builder, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    pub common_name: String,
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub organization: Option<String>,
    pub organization_unit: Option<String>,
}

impl DistinguishedName {
    /// Converts the distinguished name to an X.509 `Name`, most significant
    /// attribute first (C, ST, L, O, OU, CN).
    pub fn as_x509_name(&self) -> Result<Name, CertError> {
        let mut rdns = Vec::new();
        if let Some(country) = &self.country {
            let value = Any::encode_from(&PrintableStringRef::new(country)?)?;
            rdns.push(single_attribute_rdn(rfc4519::COUNTRY_NAME, value)?);
        }
        let utf8_attributes = [
            (rfc4519::ST, self.state.as_deref()),
            (rfc4519::L, self.locality.as_deref()),
            (rfc4519::O, self.organization.as_deref()),
            (rfc4519::OU, self.organization_unit.as_deref()),
            (rfc4519::CN, Some(self.common_name.as_str())),
        ];
        for (oid, value) in utf8_attributes {
            if let Some(value) = value {
                let value = Any::encode_from(&Utf8StringRef::new(value)?)?;
                rdns.push(single_attribute_rdn(oid, value)?);
            }
        }
        Ok(RdnSequence(rdns))
    }

    /// Creates a `DistinguishedName` from an X.509 `Name`, keeping the
    /// attributes this type models and ignoring the rest.
    pub fn from_x509_name(x509dn: &Name) -> Self {
        let mut dn = DistinguishedName::default();
        for rdn in x509dn.0.iter() {
            for attr in rdn.0.iter() {
                let value = String::from_utf8_lossy(attr.value.value()).into_owned();
                match attr.oid {
                    rfc4519::CN => dn.common_name = value,
                    rfc4519::COUNTRY_NAME => dn.country = Some(value),
                    rfc4519::ST => dn.state = Some(value),
                    rfc4519::L => dn.locality = Some(value),
                    rfc4519::O => dn.organization = Some(value),
                    rfc4519::OU => dn.organization_unit = Some(value),
                    _ => {}
                }
            }
        }
        dn
    }
}

fn single_attribute_rdn(oid: ObjectIdentifier, value: Any) -> Result<RelativeDistinguishedName, CertError> {
    let set = SetOfVec::try_from(vec![AttributeTypeAndValue { oid, value }])?;
    Ok(RelativeDistinguishedName(set))
}

/// Certificate validity period.
///
/// This struct represents the `notBefore` and `notAfter` fields in a certificate.
#[derive(Clone, Debug)]
pub struct Validity {
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl Validity {
    /// Creates a validity period starting now for the given number of days.
    pub fn for_days(days: i64) -> Result<Self, CertError> {
        Self::starting_now(Duration::days(days))
    }

    /// Creates a validity period starting now and lasting `duration`.
    ///
    /// Fails when the end of the period is not a representable date.
    pub fn starting_now(duration: Duration) -> Result<Self, CertError> {
        let now = OffsetDateTime::now_utc();
        let not_after = now.checked_add(duration).ok_or_else(|| {
            CertError::InvalidInput(format!(
                "validity of {} days ends past the last representable date",
                duration.whole_days()
            ))
        })?;
        Ok(Self {
            not_before: now,
            not_after,
        })
    }
}

/// Represents an X.509 extension.
///
/// # Fields
/// * `oid` - The object identifier of the extension.
/// * `critical` - Indicates if the extension is critical.
/// * `value` - The DER-encoded value of the extension.
#[derive(Clone, Debug)]
pub struct ExtensionParam {
    pub oid: ObjectIdentifier,
    pub critical: bool,
    /// DER-encoded extension value
    pub value: Vec<u8>,
}

impl ExtensionParam {
    /// Encodes a specific extension.
    pub fn from_extension<E: ToAndFromX509Extension>(
        extension: E,
        critical: bool,
    ) -> Result<Self, CertError> {
        Ok(Self {
            oid: E::OID,
            critical,
            value: extension.to_x509_extension_value()?,
        })
    }

    /// Decodes an `ExtensionParam` into a specific extension.
    pub fn to_extension<E: ToAndFromX509Extension>(&self) -> Result<E, CertError> {
        E::from_x509_extension_value(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn organization_with_commas_survives_round_trip() {
        let dn = DistinguishedName::builder()
            .common_name("a.example.com".to_string())
            .organization("DST Systems, Inc".to_string())
            .country("US".to_string())
            .build();

        let name = dn.as_x509_name().unwrap();
        assert_eq!(name.0.len(), 3);
        assert_eq!(DistinguishedName::from_x509_name(&name), dn);
    }

    #[test]
    fn common_name_is_last_rdn() {
        let dn = DistinguishedName::builder()
            .common_name("leaf".to_string())
            .organization("org".to_string())
            .build();
        let name = dn.as_x509_name().unwrap();
        let last = name.0.last().unwrap().0.iter().next().unwrap();
        assert_eq!(last.oid, rfc4519::CN);
    }

    #[test]
    fn validity_for_days_spans_requested_days() {
        let validity = Validity::for_days(90).unwrap();
        assert_eq!(validity.not_after - validity.not_before, Duration::days(90));
    }

    #[test]
    fn validity_past_the_calendar_is_an_error() {
        assert!(matches!(
            Validity::starting_now(Duration::days(i64::from(i32::MAX))),
            Err(CertError::InvalidInput(_))
        ));
        assert!(Validity::for_days(i64::from(u32::MAX)).is_err());
    }
}

use bon::Builder;
use const_oid::ObjectIdentifier;
use const_oid::db::rfc4519::{COUNTRY_NAME, CN, LOCALITY_NAME, O, OU, ST};
use der::Any;
use der::asn1::{Ia5StringRef, OctetString, PrintableStringRef, SetOfVec, Utf8StringRef};
use time::Duration;
use time::OffsetDateTime;
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::ext::Extension;
use x509_cert::ext::pkix::{CrlReason, KeyUsages};
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};

use super::extensions::ToAndFromX509Extension;
pub use crate::cert::extensions::ExtendedKeyUsage;
pub use crate::cert::extensions::ExtendedKeyUsageOption;
use crate::error::{HsmCertError, Result};
use crate::serial;

pub use der::flagset::FlagSet;

/// Parameters for issuing an X.509 certificate.
///
/// The subject public key is not part of the parameters: it comes from the
/// token key pair (self-signed) or from a verified CSR.
///
/// # Fields
/// * `subject` - The distinguished name of the certificate subject.
/// * `validity` - The validity window, which must contain the current time.
/// * `is_ca` - Issue a CA certificate (`basicConstraints CA=true`).
/// * `path_len` - Path length constraint. Only valid for CA certificates.
/// * `key_usage` - Key usage bits. Defaults depend on `is_ca`.
/// * `dns_names` - DNS names for the subject alternative name extension.
/// * `usages` - A list of extended key usage options.
/// * `crl_distribution_points` - URIs where the issuer publishes its CRL.
/// * `extensions` - Additional X.509 extensions.
#[derive(Clone, Debug, Builder)]
pub struct CertificateParams {
    pub subject: DistinguishedName,
    pub validity: Validity,
    #[builder(default)]
    pub is_ca: bool,
    pub path_len: Option<u8>,
    pub key_usage: Option<FlagSet<KeyUsages>>,
    #[builder(default)]
    pub dns_names: Vec<String>,
    #[builder(default)]
    pub usages: Vec<ExtendedKeyUsageOption>,
    #[builder(default)]
    pub crl_distribution_points: Vec<String>,
    #[builder(default)]
    pub extensions: Vec<ExtensionParam>,
}

impl CertificateParams {
    /// Key usage bits to encode: the explicit set, or the default for the profile.
    pub fn effective_key_usage(&self) -> FlagSet<KeyUsages> {
        match self.key_usage {
            Some(flags) => flags,
            None if self.is_ca => {
                KeyUsages::DigitalSignature | KeyUsages::KeyCertSign | KeyUsages::CRLSign
            }
            None => KeyUsages::DigitalSignature.into(),
        }
    }
}

/// Parameters for a PKCS#10 certification request.
#[derive(Clone, Debug, Builder)]
pub struct CsrParams {
    pub subject: DistinguishedName,
    #[builder(default)]
    pub dns_names: Vec<String>,
    #[builder(default)]
    pub usages: Vec<ExtendedKeyUsageOption>,
    /// Extensions requested through the `extensionRequest` attribute.
    #[builder(default)]
    pub extensions: Vec<ExtensionParam>,
}

/// One revoked certificate in a CRL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevokedEntry {
    /// Big-endian unsigned serial number.
    pub serial: Vec<u8>,
    pub revoked_at: OffsetDateTime,
    pub reason: Option<CrlReason>,
}

impl RevokedEntry {
    pub fn new(serial: impl Into<Vec<u8>>, revoked_at: OffsetDateTime) -> Self {
        Self {
            serial: serial.into(),
            revoked_at,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: CrlReason) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Parameters for a certificate revocation list.
///
/// # Fields
/// * `this_update` - Issue time of this CRL.
/// * `next_update` - When the next CRL will be issued. Must be after `this_update`.
/// * `entries` - Revoked certificates, in any order.
/// * `crl_number` - Monotonic CRL number. Defaults to the Unix time of `this_update`.
#[derive(Clone, Debug, Builder)]
pub struct CrlParams {
    pub this_update: OffsetDateTime,
    pub next_update: OffsetDateTime,
    #[builder(default)]
    pub entries: Vec<RevokedEntry>,
    pub crl_number: Option<u64>,
}

impl CrlParams {
    pub fn effective_crl_number(&self) -> u64 {
        self.crl_number
            .unwrap_or_else(|| self.this_update.unix_timestamp().max(0) as u64)
    }
}

/// Distinguished name parameters for building an X.509 certificate.
///
/// This struct represents the subject or issuer name in a certificate.
///
/// # Fields
/// * `common_name` - The common name (CN).
/// * `country` - The country (C).
/// * `state` - The state or province (ST).
/// * `locality` - The locality or city (L).
/// * `organization` - The organization (O).
/// * `organization_unit` - The organizational unit (OU).
#[derive(Clone, Debug, Builder, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    #[builder(into)]
    pub common_name: String,
    #[builder(into)]
    pub country: Option<String>,
    #[builder(into)]
    pub state: Option<String>,
    #[builder(into)]
    pub locality: Option<String>,
    #[builder(into)]
    pub organization: Option<String>,
    #[builder(into)]
    pub organization_unit: Option<String>,
}

impl DistinguishedName {
    /// Encodes the name as an RDN sequence, most significant attribute first.
    ///
    /// The country is a `PrintableString`, every other attribute a `UTF8String`.
    pub fn as_x509_name(&self) -> Result<Name> {
        let mut rdns = Vec::new();

        if let Some(country) = &self.country {
            let value = PrintableStringRef::new(country)
                .map_err(|e| HsmCertError::InvalidInput(format!("country '{country}': {e}")))?;
            rdns.push(rdn(COUNTRY_NAME, Any::encode_from(&value)?)?);
        }

        let utf8 = [
            (ST, &self.state),
            (LOCALITY_NAME, &self.locality),
            (O, &self.organization),
            (OU, &self.organization_unit),
        ];
        for (oid, value) in utf8 {
            if let Some(value) = value {
                rdns.push(rdn(oid, Any::encode_from(&Utf8StringRef::new(value)?)?)?);
            }
        }

        if self.common_name.is_empty() {
            return Err(HsmCertError::InvalidInput(
                "common name must not be empty".to_string(),
            ));
        }
        rdns.push(rdn(
            CN,
            Any::encode_from(&Utf8StringRef::new(&self.common_name)?)?,
        )?);

        Ok(RdnSequence(rdns))
    }

    /// Reads the attributes this struct knows from an X.509 name.
    ///
    /// Unknown attributes are skipped. A multi-valued attribute keeps the last value.
    pub fn from_x509_name(name: &Name) -> Self {
        let mut dn = DistinguishedName::default();

        for attr in name.0.iter().flat_map(|rdn| rdn.0.iter()) {
            let Some(value) = attribute_text(&attr.value) else {
                continue;
            };
            match attr.oid {
                CN => dn.common_name = value,
                COUNTRY_NAME => dn.country = Some(value),
                ST => dn.state = Some(value),
                LOCALITY_NAME => dn.locality = Some(value),
                O => dn.organization = Some(value),
                OU => dn.organization_unit = Some(value),
                _ => {}
            }
        }
        dn
    }
}

fn rdn(oid: ObjectIdentifier, value: Any) -> Result<RelativeDistinguishedName> {
    Ok(RelativeDistinguishedName(SetOfVec::try_from(vec![
        AttributeTypeAndValue { oid, value },
    ])?))
}

fn attribute_text(value: &Any) -> Option<String> {
    if let Ok(s) = value.decode_as::<Utf8StringRef<'_>>() {
        return Some(s.as_str().to_string());
    }
    if let Ok(s) = value.decode_as::<PrintableStringRef<'_>>() {
        return Some(s.as_str().to_string());
    }
    value
        .decode_as::<Ia5StringRef<'_>>()
        .ok()
        .map(|s| s.as_str().to_string())
}

/// Certificate validity period.
///
/// This struct represents the `notBefore` and `notAfter` fields in a certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Validity {
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl Validity {
    pub fn new(not_before: OffsetDateTime, not_after: OffsetDateTime) -> Self {
        Self {
            not_before,
            not_after,
        }
    }

    /// Creates a validity period starting now for the given number of days.
    pub fn for_days(days: i64) -> Self {
        let now = serial::now();
        Self {
            not_before: now,
            not_after: now + Duration::days(days),
        }
    }

    /// Checks `not_before < not_after` and `not_before <= now <= not_after`,
    /// each bound widened by `skew`.
    pub fn check(&self, now: OffsetDateTime, skew: Duration) -> Result<()> {
        if self.not_before >= self.not_after {
            return Err(HsmCertError::InvalidInput(format!(
                "notBefore {} is not before notAfter {}",
                self.not_before, self.not_after
            )));
        }
        if now + skew < self.not_before {
            return Err(HsmCertError::InvalidInput(format!(
                "validity starts at {}, after the current time {now}",
                self.not_before
            )));
        }
        if now - skew > self.not_after {
            return Err(HsmCertError::InvalidInput(format!(
                "validity ended at {}, before the current time {now}",
                self.not_after
            )));
        }
        Ok(())
    }

    pub fn to_x509(&self) -> Result<x509_cert::time::Validity> {
        Ok(x509_cert::time::Validity {
            not_before: serial::to_x509_time(self.not_before)?,
            not_after: serial::to_x509_time(self.not_after)?,
        })
    }

    pub fn from_x509(validity: &x509_cert::time::Validity) -> Result<Self> {
        Ok(Self {
            not_before: serial::from_x509_time(&validity.not_before)?,
            not_after: serial::from_x509_time(&validity.not_after)?,
        })
    }
}

/// Represents an X.509 extension.
///
/// This struct contains the OID, criticality, and value of an extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionParam {
    pub oid: ObjectIdentifier,
    pub critical: bool,
    /// DER-encoded extension value
    pub value: Vec<u8>,
}

impl ExtensionParam {
    /// Encodes a typed extension.
    pub fn from_extension<E: ToAndFromX509Extension>(extension: &E, critical: bool) -> Result<Self> {
        Ok(Self {
            oid: E::OID,
            critical,
            value: extension.to_x509_extension_value()?,
        })
    }

    /// Decodes the value as a specific extension.
    pub fn to_extension<E: ToAndFromX509Extension>(&self) -> Result<E> {
        if self.oid != E::OID {
            return Err(HsmCertError::DecodingError(format!(
                "extension {} is not {}",
                self.oid,
                E::OID
            )));
        }
        E::from_x509_extension_value(&self.value)
    }

    pub fn to_x509(&self) -> Result<Extension> {
        Ok(Extension {
            extn_id: self.oid,
            critical: self.critical,
            extn_value: OctetString::new(self.value.clone())?,
        })
    }

    pub fn from_x509(extension: &Extension) -> Self {
        Self {
            oid: extension.extn_id,
            critical: extension.critical,
            value: extension.extn_value.as_bytes().to_vec(),
        }
    }
}

/// Finds and decodes the extension of type `E`, if present.
pub fn find_extension<E: ToAndFromX509Extension>(extensions: &[ExtensionParam]) -> Result<Option<E>> {
    extensions
        .iter()
        .find(|ext| ext.oid == E::OID)
        .map(|ext| ext.to_extension())
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use der::{Decode, Encode};

    #[test]
    fn test_distinguished_name_round_trip() {
        let dn = DistinguishedName::builder()
            .common_name("Test CA")
            .country("SE")
            .state("Stockholm")
            .organization("Example AB")
            .build();

        let name = dn.as_x509_name().unwrap();
        assert_eq!(name.0.len(), 4);
        assert_eq!(name.0[0].0.iter().next().unwrap().oid, COUNTRY_NAME);

        let decoded = Name::from_der(&name.to_der().unwrap()).unwrap();
        assert_eq!(DistinguishedName::from_x509_name(&decoded), dn);
    }

    #[test]
    fn test_empty_common_name_is_rejected() {
        assert!(DistinguishedName::default().as_x509_name().is_err());
    }

    #[test]
    fn test_invalid_country_is_rejected() {
        let dn = DistinguishedName::builder()
            .common_name("x")
            .country("S@")
            .build();
        assert!(matches!(dn.as_x509_name(), Err(HsmCertError::InvalidInput(_))));
    }

    #[test]
    fn test_validity_check() {
        let now = serial::now();
        let skew = Duration::minutes(5);

        assert!(Validity::for_days(90).check(now, skew).is_ok());
        assert!(
            Validity::new(now + Duration::minutes(2), now + Duration::days(1))
                .check(now, skew)
                .is_ok()
        );
        assert!(
            Validity::new(now + Duration::hours(1), now + Duration::days(1))
                .check(now, skew)
                .is_err()
        );
        assert!(
            Validity::new(now - Duration::days(2), now - Duration::days(1))
                .check(now, skew)
                .is_err()
        );
        assert!(Validity::new(now, now).check(now, skew).is_err());
    }

    #[test]
    fn test_default_key_usage() {
        let params = CertificateParams::builder()
            .subject(DistinguishedName::builder().common_name("root").build())
            .validity(Validity::for_days(1))
            .is_ca(true)
            .build();
        assert!(params.effective_key_usage().contains(KeyUsages::KeyCertSign));

        let params = CertificateParams {
            is_ca: false,
            ..params
        };
        assert!(!params.effective_key_usage().contains(KeyUsages::KeyCertSign));
    }

    #[test]
    fn test_crl_number_defaults_to_this_update() {
        let this_update = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let params = CrlParams::builder()
            .this_update(this_update)
            .next_update(this_update + Duration::days(7))
            .build();
        assert_eq!(params.effective_crl_number(), 1_700_000_000);
    }
}

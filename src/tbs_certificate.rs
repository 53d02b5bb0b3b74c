use der::Encode;
use x509_cert::Version;
use x509_cert::certificate::TbsCertificateInner;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::cert::params::{ExtensionParam, Validity};
use crate::error::Result;
use crate::signer::SignatureAlgorithm;

/// Represents the "To Be Signed" (TBS) portion of an X.509 certificate.
/// This struct contains all the fields required to generate a valid X.509 certificate.
///
/// Names are kept as encoded X.509 names so that a chained certificate's
/// issuer is byte-identical to its CA's subject.
///
/// # Fields
/// * `serial_number` - The unique identifier for the certificate.
/// * `signature_algorithm` - The algorithm the issuer's key will sign with.
/// * `issuer` - The issuer name.
/// * `validity` - The certificate's validity period.
/// * `subject` - The subject name.
/// * `subject_public_key` - The public key of the certificate subject.
/// * `extensions` - Additional X.509 extensions for the certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TbsCertificate {
    pub serial_number: SerialNumber,
    pub signature_algorithm: SignatureAlgorithm,
    pub issuer: Name,
    pub validity: Validity,
    pub subject: Name,
    pub subject_public_key: SubjectPublicKeyInfoOwned,
    pub extensions: Vec<ExtensionParam>,
}

impl TbsCertificate {
    /// Converts the `TbsCertificate` into a `TbsCertificateInner` for DER encoding.
    pub fn to_tbs_certificate_inner(&self) -> Result<TbsCertificateInner> {
        let extensions = self
            .extensions
            .iter()
            .map(ExtensionParam::to_x509)
            .collect::<Result<Vec<_>>>()?;

        Ok(TbsCertificateInner {
            version: Version::V3,
            serial_number: self.serial_number.clone(),
            signature: self.signature_algorithm.algorithm_identifier()?,
            issuer: self.issuer.clone(),
            validity: self.validity.to_x509()?,
            subject: self.subject.clone(),
            subject_public_key_info: self.subject_public_key.clone(),
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: (!extensions.is_empty()).then_some(extensions),
        })
    }

    /// Creates a `TbsCertificate` from a `TbsCertificateInner`.
    pub fn from_tbs_certificate_inner(inner: &TbsCertificateInner) -> Result<Self> {
        Ok(Self {
            serial_number: inner.serial_number.clone(),
            signature_algorithm: SignatureAlgorithm::from_algorithm_identifier(&inner.signature)?,
            issuer: inner.issuer.clone(),
            validity: Validity::from_x509(&inner.validity)?,
            subject: inner.subject.clone(),
            subject_public_key: inner.subject_public_key_info.clone(),
            extensions: inner
                .extensions
                .iter()
                .flatten()
                .map(ExtensionParam::from_x509)
                .collect(),
        })
    }

    /// Encodes the `TbsCertificate` into DER format.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.to_tbs_certificate_inner()?.to_der()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::extensions::{BasicConstraints, SubjectKeyIdentifier};
    use crate::cert::params::DistinguishedName;
    use crate::serial::SerialAllocator;
    use crate::signer::DigestAlgorithm;
    use der::Decode;
    use p256::pkcs8::EncodePublicKey;

    fn spki() -> SubjectPublicKeyInfoOwned {
        let secret = p256::SecretKey::random(&mut rand_core::OsRng);
        let der = secret.public_key().to_public_key_der().unwrap();
        SubjectPublicKeyInfoOwned::from_der(der.as_bytes()).unwrap()
    }

    #[test]
    fn test_tbs_reencoding_is_byte_identical() {
        let name = DistinguishedName::builder()
            .common_name("test.example.com")
            .organization("Example")
            .build()
            .as_x509_name()
            .unwrap();
        let tbs = TbsCertificate {
            serial_number: SerialAllocator::new().next_serial().unwrap(),
            signature_algorithm: SignatureAlgorithm::Ecdsa(DigestAlgorithm::Sha256),
            issuer: name.clone(),
            validity: Validity::for_days(90),
            subject: name,
            subject_public_key: spki(),
            extensions: vec![
                ExtensionParam::from_extension(&BasicConstraints::default(), true).unwrap(),
                ExtensionParam::from_extension(&SubjectKeyIdentifier(vec![1; 20]), false).unwrap(),
            ],
        };

        let der = tbs.to_der().unwrap();
        let parsed = TbsCertificateInner::from_der(&der).unwrap();
        let decoded = TbsCertificate::from_tbs_certificate_inner(&parsed).unwrap();
        assert_eq!(decoded, tbs);
        assert_eq!(decoded.to_der().unwrap(), der);
    }

    #[test]
    fn test_no_extensions_are_omitted() {
        let name = DistinguishedName::builder()
            .common_name("x")
            .build()
            .as_x509_name()
            .unwrap();
        let tbs = TbsCertificate {
            serial_number: SerialNumber::new(&[1]).unwrap(),
            signature_algorithm: SignatureAlgorithm::RsaPkcs1v15(DigestAlgorithm::Sha256),
            issuer: name.clone(),
            validity: Validity::for_days(1),
            subject: name,
            subject_public_key: spki(),
            extensions: vec![],
        };
        assert!(tbs.to_tbs_certificate_inner().unwrap().extensions.is_none());
    }
}

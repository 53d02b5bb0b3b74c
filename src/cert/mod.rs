pub mod extensions;
pub mod params;

use der::{Decode, DecodePem, Encode, EncodePem};
use extensions::{AuthorityKeyIdentifier, BasicConstraints, SubjectKeyIdentifier, ToAndFromX509Extension};
use params::{DistinguishedName, ExtensionParam, Validity, find_extension};
use x509_cert::certificate::CertificateInner;
use x509_cert::crl::CertificateList;
use x509_cert::request::CertReq;
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::csr::CertificationRequestInfo;
use crate::error::{HsmCertError, Result};
use crate::signer::{SignatureAlgorithm, verify_signature};

/// Represents an X.509 certificate.
///
/// This struct provides methods to encode the certificate into DER or PEM formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// The inner representation of the certificate.
    pub inner: CertificateInner,
}

impl Certificate {
    /// Encodes the certificate into DER format.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        self.inner
            .to_der()
            .map_err(|e| HsmCertError::EncodingError(e.to_string()))
    }

    /// Encodes the certificate into PEM format.
    pub fn to_pem(&self) -> Result<String> {
        self.inner
            .to_pem(pkcs8::LineEnding::LF)
            .map_err(|e| HsmCertError::EncodingError(e.to_string()))
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        Ok(Self {
            inner: CertificateInner::from_der(der)?,
        })
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        Ok(Self {
            inner: CertificateInner::from_pem(pem)?,
        })
    }

    /// Serial number as big-endian bytes.
    pub fn serial_number(&self) -> &[u8] {
        self.inner.tbs_certificate.serial_number.as_bytes()
    }

    pub fn subject(&self) -> DistinguishedName {
        DistinguishedName::from_x509_name(&self.inner.tbs_certificate.subject)
    }

    pub fn issuer(&self) -> DistinguishedName {
        DistinguishedName::from_x509_name(&self.inner.tbs_certificate.issuer)
    }

    pub fn validity(&self) -> Result<Validity> {
        Validity::from_x509(&self.inner.tbs_certificate.validity)
    }

    pub fn public_key(&self) -> &SubjectPublicKeyInfoOwned {
        &self.inner.tbs_certificate.subject_public_key_info
    }

    pub fn signature_algorithm(&self) -> Result<SignatureAlgorithm> {
        SignatureAlgorithm::from_algorithm_identifier(&self.inner.signature_algorithm)
    }

    pub fn extensions(&self) -> Vec<ExtensionParam> {
        self.inner
            .tbs_certificate
            .extensions
            .iter()
            .flatten()
            .map(ExtensionParam::from_x509)
            .collect()
    }

    /// Decodes the extension of type `E`, if the certificate carries it.
    pub fn extension<E: ToAndFromX509Extension>(&self) -> Result<Option<E>> {
        find_extension(&self.extensions())
    }

    pub fn is_ca(&self) -> Result<bool> {
        Ok(self
            .extension::<BasicConstraints>()?
            .is_some_and(|bc| bc.is_ca))
    }

    pub fn subject_key_identifier(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.extension::<SubjectKeyIdentifier>()?.map(|ski| ski.0))
    }

    pub fn authority_key_identifier(&self) -> Result<Option<Vec<u8>>> {
        Ok(self
            .extension::<AuthorityKeyIdentifier>()?
            .map(|aki| aki.key_identifier))
    }

    /// Verifies this certificate's signature with the issuer's public key.
    pub fn verify_signed_by(&self, issuer_public_key: &SubjectPublicKeyInfoOwned) -> Result<()> {
        verify_signature(
            issuer_public_key,
            self.signature_algorithm()?,
            &self.inner.tbs_certificate.to_der()?,
            self.inner.signature.raw_bytes(),
        )
    }
}

/// Represents a PKCS#10 certification request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub inner: CertReq,
}

impl CertificateRequest {
    pub fn to_der(&self) -> Result<Vec<u8>> {
        self.inner
            .to_der()
            .map_err(|e| HsmCertError::EncodingError(e.to_string()))
    }

    pub fn to_pem(&self) -> Result<String> {
        self.inner
            .to_pem(pkcs8::LineEnding::LF)
            .map_err(|e| HsmCertError::EncodingError(e.to_string()))
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        Ok(Self {
            inner: CertReq::from_der(der)?,
        })
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        Ok(Self {
            inner: CertReq::from_pem(pem)?,
        })
    }

    pub fn subject(&self) -> DistinguishedName {
        DistinguishedName::from_x509_name(&self.inner.info.subject)
    }

    pub fn public_key(&self) -> &SubjectPublicKeyInfoOwned {
        &self.inner.info.public_key
    }

    /// Extensions from the `extensionRequest` attribute.
    pub fn requested_extensions(&self) -> Result<Vec<ExtensionParam>> {
        Ok(CertificationRequestInfo::from_inner(&self.inner.info)?.extensions)
    }

    /// Checks the request's signature against its own public key.
    pub fn verify(&self) -> Result<()> {
        verify_signature(
            &self.inner.info.public_key,
            SignatureAlgorithm::from_algorithm_identifier(&self.inner.algorithm)?,
            &self.inner.info.to_der()?,
            self.inner.signature.raw_bytes(),
        )
    }
}

const CRL_PEM_LABEL: &str = "X509 CRL";

/// Represents an X.509 certificate revocation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationList {
    pub inner: CertificateList,
}

impl RevocationList {
    pub fn to_der(&self) -> Result<Vec<u8>> {
        self.inner
            .to_der()
            .map_err(|e| HsmCertError::EncodingError(e.to_string()))
    }

    pub fn to_pem(&self) -> Result<String> {
        der::pem::encode_string(CRL_PEM_LABEL, pkcs8::LineEnding::LF, &self.to_der()?)
            .map_err(|e| HsmCertError::EncodingError(e.to_string()))
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        Ok(Self {
            inner: CertificateList::from_der(der)?,
        })
    }

    /// Revoked serial numbers in the order they appear.
    pub fn revoked_serials(&self) -> Vec<Vec<u8>> {
        self.inner
            .tbs_cert_list
            .revoked_certificates
            .iter()
            .flatten()
            .map(|entry| entry.serial_number.as_bytes().to_vec())
            .collect()
    }

    pub fn extensions(&self) -> Vec<ExtensionParam> {
        self.inner
            .tbs_cert_list
            .crl_extensions
            .iter()
            .flatten()
            .map(ExtensionParam::from_x509)
            .collect()
    }

    pub fn extension<E: ToAndFromX509Extension>(&self) -> Result<Option<E>> {
        find_extension(&self.extensions())
    }

    pub fn verify_signed_by(&self, issuer_public_key: &SubjectPublicKeyInfoOwned) -> Result<()> {
        verify_signature(
            issuer_public_key,
            SignatureAlgorithm::from_algorithm_identifier(&self.inner.signature_algorithm)?,
            &self.inner.tbs_cert_list.to_der()?,
            self.inner.signature.raw_bytes(),
        )
    }
}

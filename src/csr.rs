//! PKCS#10 `CertificationRequestInfo` (RFC 2986).

use const_oid::AssociatedOid;
use der::asn1::SetOfVec;
use der::{Any, Decode, Encode};
use x509_cert::attr::Attribute;
use x509_cert::name::Name;
use x509_cert::request::{CertReqInfo, ExtensionReq, Version};
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::cert::params::ExtensionParam;
use crate::error::{HsmCertError, Result};

/// The signed portion of a certification request.
///
/// Requested extensions travel in a single `extensionRequest` attribute,
/// which is left out when there are none.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificationRequestInfo {
    pub subject: Name,
    pub public_key: SubjectPublicKeyInfoOwned,
    pub extensions: Vec<ExtensionParam>,
}

impl CertificationRequestInfo {
    pub fn to_inner(&self) -> Result<CertReqInfo> {
        let attributes = if self.extensions.is_empty() {
            SetOfVec::new()
        } else {
            let request = ExtensionReq(
                self.extensions
                    .iter()
                    .map(ExtensionParam::to_x509)
                    .collect::<Result<Vec<_>>>()?,
            );
            SetOfVec::try_from(vec![Attribute {
                oid: ExtensionReq::OID,
                values: SetOfVec::try_from(vec![Any::encode_from(&request)?])?,
            }])?
        };

        Ok(CertReqInfo {
            version: Version::V1,
            subject: self.subject.clone(),
            public_key: self.public_key.clone(),
            attributes,
        })
    }

    pub fn from_inner(inner: &CertReqInfo) -> Result<Self> {
        if inner.version != Version::V1 {
            return Err(HsmCertError::DecodingError(
                "unsupported certification request version".to_string(),
            ));
        }

        let mut extensions = Vec::new();
        for attribute in inner.attributes.iter().filter(|a| a.oid == ExtensionReq::OID) {
            for value in attribute.values.iter() {
                let request = ExtensionReq::from_der(&value.to_der()?)?;
                extensions.extend(request.0.iter().map(ExtensionParam::from_x509));
            }
        }

        Ok(Self {
            subject: inner.subject.clone(),
            public_key: inner.public_key.clone(),
            extensions,
        })
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.to_inner()?.to_der()?)
    }
}

use sha1::{Digest, Sha1};
use x509_cert::name::Name;
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::cert::Certificate;
use crate::cert::extensions::{KeyUsage, KeyUsages};
use crate::cert::params::DistinguishedName;
use crate::error::{HsmCertError, Result};
use crate::signer::TokenSigner;

/// Represents an entity capable of issuing certificates and CRLs.
pub trait Issuer {
    /// The name written as the issuer of everything this issuer signs.
    fn issuer_name(&self) -> &Name;

    /// The key identifier written into the authority key identifier extension.
    fn authority_key_identifier(&self) -> &[u8];

    /// Signs with the issuer's token key.
    fn signer(&self) -> &TokenSigner;
}

/// SHA-1 over the subjectPublicKey bits (RFC 5280 §4.2.1.2, method 1).
pub fn key_identifier(spki: &SubjectPublicKeyInfoOwned) -> Vec<u8> {
    Sha1::digest(spki.subject_public_key.raw_bytes()).to_vec()
}

/// Issuer of a self-signed certificate: issuer equals subject.
pub struct SelfIssuer {
    name: Name,
    key_identifier: Vec<u8>,
    signer: TokenSigner,
}

impl SelfIssuer {
    pub fn new(subject: &DistinguishedName, signer: TokenSigner) -> Result<Self> {
        Ok(Self {
            name: subject.as_x509_name()?,
            key_identifier: key_identifier(&signer.key().public_key),
            signer,
        })
    }
}

impl Issuer for SelfIssuer {
    fn issuer_name(&self) -> &Name {
        &self.name
    }

    fn authority_key_identifier(&self) -> &[u8] {
        &self.key_identifier
    }

    fn signer(&self) -> &TokenSigner {
        &self.signer
    }
}

/// A CA certificate together with the token key that certifies with it.
///
/// The issuer name and authority key identifier come from the certificate,
/// never from the key pair.
#[derive(Clone)]
pub struct CaIssuer {
    certificate: Certificate,
    key_identifier: Vec<u8>,
    signer: TokenSigner,
}

impl CaIssuer {
    pub fn new(certificate: Certificate, signer: TokenSigner) -> Result<Self> {
        if certificate.public_key() != &signer.key().public_key {
            return Err(HsmCertError::InvalidInput(format!(
                "CA certificate '{}' does not certify key {}",
                certificate.subject().common_name,
                signer.key().key_ref
            )));
        }
        if !certificate.is_ca()? {
            return Err(HsmCertError::ExtensionConsistencyError(format!(
                "certificate '{}' is not a CA certificate",
                certificate.subject().common_name
            )));
        }

        let key_identifier = match certificate.subject_key_identifier()? {
            Some(ski) => ski,
            None => key_identifier(certificate.public_key()),
        };

        Ok(Self {
            certificate,
            key_identifier,
            signer,
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Fails unless the CA certificate's key usage, when present, includes `usage`.
    pub fn require_key_usage(&self, usage: KeyUsages) -> Result<()> {
        match self.certificate.extension::<KeyUsage>()? {
            Some(KeyUsage(flags)) if !flags.contains(usage) => {
                Err(HsmCertError::ExtensionConsistencyError(format!(
                    "CA certificate '{}' lacks key usage {usage:?}",
                    self.certificate.subject().common_name
                )))
            }
            _ => Ok(()),
        }
    }
}

impl Issuer for CaIssuer {
    fn issuer_name(&self) -> &Name {
        &self.certificate.inner.tbs_certificate.subject
    }

    fn authority_key_identifier(&self) -> &[u8] {
        &self.key_identifier
    }

    fn signer(&self) -> &TokenSigner {
        &self.signer
    }
}

use std::sync::Arc;

use const_oid::AssociatedOid;
use const_oid::db::rfc5912;
use der::asn1::{AnyRef, UintRef};
use der::{Encode, Sequence};
use ecdsa::signature::hazmat::PrehashVerifier;
use log::{debug, trace};
use rsa::pkcs8::DecodePublicKey;
use rsa::pss::get_default_pss_signature_algo_id;
use rsa::{Pkcs1v15Sign, Pss, RsaPublicKey};
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha384, Sha512};
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};

use crate::error::{HsmCertError, Result};
use crate::key::{EcCurve, KeyAlgorithm, KeyPair};
use crate::session::SessionManager;
use crate::token::{SignMechanism, TokenSession};

/// Hash applied to the payload before it is sent to the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    pub fn output_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    pub fn oid(self) -> const_oid::ObjectIdentifier {
        match self {
            DigestAlgorithm::Sha256 => Sha256::OID,
            DigestAlgorithm::Sha384 => Sha384::OID,
            DigestAlgorithm::Sha512 => Sha512::OID,
        }
    }

    /// `DigestInfo` prefix for PKCS#1 v1.5 signatures.
    fn pkcs1v15(self) -> Pkcs1v15Sign {
        match self {
            DigestAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            DigestAlgorithm::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
            DigestAlgorithm::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
        }
    }

    fn pss(self) -> Pss {
        match self {
            DigestAlgorithm::Sha256 => Pss::new::<Sha256>(),
            DigestAlgorithm::Sha384 => Pss::new::<Sha384>(),
            DigestAlgorithm::Sha512 => Pss::new::<Sha512>(),
        }
    }
}

/// RSA signature padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RsaPadding {
    #[default]
    Pkcs1v15,
    Pss,
}

/// Signature algorithms that can appear in an issued object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    RsaPkcs1v15(DigestAlgorithm),
    /// MGF1 with the same hash, salt length equal to the hash length.
    RsaPss(DigestAlgorithm),
    Ecdsa(DigestAlgorithm),
}

impl SignatureAlgorithm {
    pub fn digest(&self) -> DigestAlgorithm {
        match self {
            SignatureAlgorithm::RsaPkcs1v15(d)
            | SignatureAlgorithm::RsaPss(d)
            | SignatureAlgorithm::Ecdsa(d) => *d,
        }
    }

    /// The `AlgorithmIdentifier` written into the signed object.
    ///
    /// PKCS#1 v1.5 identifiers carry NULL parameters, ECDSA ones carry none
    /// (RFC 5758 §3.2) and PSS ones carry `RSASSA-PSS-params`.
    pub fn algorithm_identifier(&self) -> Result<AlgorithmIdentifierOwned> {
        let null = Some(AnyRef::NULL.into());
        Ok(match self {
            SignatureAlgorithm::RsaPkcs1v15(digest) => AlgorithmIdentifierOwned {
                oid: match digest {
                    DigestAlgorithm::Sha256 => rfc5912::SHA_256_WITH_RSA_ENCRYPTION,
                    DigestAlgorithm::Sha384 => rfc5912::SHA_384_WITH_RSA_ENCRYPTION,
                    DigestAlgorithm::Sha512 => rfc5912::SHA_512_WITH_RSA_ENCRYPTION,
                },
                parameters: null,
            },
            SignatureAlgorithm::RsaPss(digest) => match digest {
                DigestAlgorithm::Sha256 => get_default_pss_signature_algo_id::<Sha256>(),
                DigestAlgorithm::Sha384 => get_default_pss_signature_algo_id::<Sha384>(),
                DigestAlgorithm::Sha512 => get_default_pss_signature_algo_id::<Sha512>(),
            }?,
            SignatureAlgorithm::Ecdsa(digest) => AlgorithmIdentifierOwned {
                oid: match digest {
                    DigestAlgorithm::Sha256 => rfc5912::ECDSA_WITH_SHA_256,
                    DigestAlgorithm::Sha384 => rfc5912::ECDSA_WITH_SHA_384,
                    DigestAlgorithm::Sha512 => rfc5912::ECDSA_WITH_SHA_512,
                },
                parameters: None,
            },
        })
    }

    /// Inverse of [`Self::algorithm_identifier`].
    pub fn from_algorithm_identifier(id: &AlgorithmIdentifierOwned) -> Result<Self> {
        const DIGESTS: [DigestAlgorithm; 3] = [
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ];
        for digest in DIGESTS {
            for candidate in [
                SignatureAlgorithm::RsaPkcs1v15(digest),
                SignatureAlgorithm::RsaPss(digest),
                SignatureAlgorithm::Ecdsa(digest),
            ] {
                if candidate.algorithm_identifier()? == *id {
                    return Ok(candidate);
                }
            }
        }
        // Some encoders omit the NULL parameters of PKCS#1 v1.5 identifiers.
        if id.parameters.is_none() {
            for digest in DIGESTS {
                let candidate = SignatureAlgorithm::RsaPkcs1v15(digest);
                if candidate.algorithm_identifier()?.oid == id.oid {
                    return Ok(candidate);
                }
            }
        }
        Err(HsmCertError::UnsupportedAlgorithmError(format!(
            "signature algorithm {}",
            id.oid
        )))
    }
}

/// Signature bytes together with the algorithm that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub algorithm: SignatureAlgorithm,
    /// PKCS#1 signature for RSA, DER `ECDSA-Sig-Value` for ECDSA.
    pub bytes: Vec<u8>,
}

#[derive(Sequence)]
struct EcdsaSigValue<'a> {
    r: UintRef<'a>,
    s: UintRef<'a>,
}

/// Re-encodes a token's fixed-width `r || s` as DER `ECDSA-Sig-Value`.
pub fn ecdsa_raw_to_der(raw: &[u8], curve: EcCurve) -> Result<Vec<u8>> {
    let width = curve.field_len();
    if raw.len() != 2 * width {
        return Err(HsmCertError::VerificationError(format!(
            "token returned {} signature bytes, expected {} for {curve:?}",
            raw.len(),
            2 * width
        )));
    }
    let (r, s) = raw.split_at(width);
    let value = EcdsaSigValue {
        r: UintRef::new(r)?,
        s: UintRef::new(s)?,
    };
    Ok(value.to_der()?)
}

/// Per-family signing behaviour, selected from the key's recorded algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAdapter {
    Rsa { padding: RsaPadding },
    Ecdsa { curve: EcCurve },
}

impl SigningAdapter {
    pub fn for_key(key: &KeyPair, padding: RsaPadding) -> Self {
        match key.algorithm {
            KeyAlgorithm::Rsa(_) => SigningAdapter::Rsa { padding },
            KeyAlgorithm::Ec(curve) => SigningAdapter::Ecdsa { curve },
        }
    }

    /// Digest to use when the caller asked for `requested`.
    ///
    /// ECDSA keys use the hash matched to their curve.
    pub fn digest_for(&self, requested: DigestAlgorithm) -> DigestAlgorithm {
        match self {
            SigningAdapter::Rsa { .. } => requested,
            SigningAdapter::Ecdsa { curve } => curve.digest(),
        }
    }

    pub fn signature_algorithm(&self, digest: DigestAlgorithm) -> SignatureAlgorithm {
        match self {
            SigningAdapter::Rsa {
                padding: RsaPadding::Pkcs1v15,
            } => SignatureAlgorithm::RsaPkcs1v15(digest),
            SigningAdapter::Rsa {
                padding: RsaPadding::Pss,
            } => SignatureAlgorithm::RsaPss(digest),
            SigningAdapter::Ecdsa { .. } => SignatureAlgorithm::Ecdsa(digest),
        }
    }

    /// Hashes `payload` locally and has the token sign it with `key`.
    pub fn sign(
        &self,
        session: &dyn TokenSession,
        key: &KeyPair,
        payload: &[u8],
        digest: DigestAlgorithm,
    ) -> Result<Signature> {
        let hashed = digest.digest(payload);
        let algorithm = self.signature_algorithm(digest);
        trace!("Signing {} bytes with {} as {algorithm:?}", payload.len(), key.key_ref);

        let bytes = match self {
            SigningAdapter::Rsa {
                padding: RsaPadding::Pkcs1v15,
            } => {
                let mut digest_info = digest.pkcs1v15().prefix.into_vec();
                digest_info.extend_from_slice(&hashed);
                session
                    .sign(&key.key_ref, SignMechanism::RsaPkcs, &digest_info)
                    .map_err(HsmCertError::SigningError)?
            }
            SigningAdapter::Rsa {
                padding: RsaPadding::Pss,
            } => session
                .sign(
                    &key.key_ref,
                    SignMechanism::RsaPkcsPss {
                        digest,
                        salt_len: digest.output_len(),
                    },
                    &hashed,
                )
                .map_err(HsmCertError::SigningError)?,
            SigningAdapter::Ecdsa { curve } => {
                if digest.output_len() * 2 < curve.field_len() {
                    return Err(HsmCertError::UnsupportedAlgorithmError(format!(
                        "{digest:?} is too short for {curve:?}"
                    )));
                }
                let raw = session
                    .sign(&key.key_ref, SignMechanism::Ecdsa, &hashed)
                    .map_err(HsmCertError::SigningError)?;
                ecdsa_raw_to_der(&raw, *curve)?
            }
        };

        Ok(Signature { algorithm, bytes })
    }
}

/// Signs with one token key, borrowing a pooled session per call.
#[derive(Clone)]
pub struct TokenSigner {
    sessions: Arc<SessionManager>,
    key: KeyPair,
    adapter: SigningAdapter,
    digest: DigestAlgorithm,
    verify: bool,
}

impl TokenSigner {
    pub fn new(
        sessions: Arc<SessionManager>,
        key: KeyPair,
        padding: RsaPadding,
        digest: DigestAlgorithm,
    ) -> Self {
        let adapter = SigningAdapter::for_key(&key, padding);
        Self {
            sessions,
            digest: adapter.digest_for(digest),
            key,
            adapter,
            verify: true,
        }
    }

    /// Whether each signature is checked against the public key before it is returned.
    pub fn verify_signatures(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    /// The algorithm every signature from this signer will carry.
    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.adapter.signature_algorithm(self.digest)
    }

    pub fn sign(&self, payload: &[u8]) -> Result<Signature> {
        let signature = self.sessions.with_session("sign", |session| {
            self.adapter.sign(&**session, &self.key, payload, self.digest)
        })?;

        if self.verify {
            verify_signature(
                &self.key.public_key,
                signature.algorithm,
                payload,
                &signature.bytes,
            )?;
        }
        debug!("Token signature by {} ({:?})", self.key.key_ref, signature.algorithm);
        Ok(signature)
    }
}

/// Verifies `signature` over `message` with a public key, in software.
pub fn verify_signature(
    public_key: &SubjectPublicKeyInfoOwned,
    algorithm: SignatureAlgorithm,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let failed = |e: &dyn std::fmt::Display| HsmCertError::VerificationError(e.to_string());
    let hashed = algorithm.digest().digest(message);

    match algorithm {
        SignatureAlgorithm::RsaPkcs1v15(digest) | SignatureAlgorithm::RsaPss(digest) => {
            let key = RsaPublicKey::from_public_key_der(&public_key.to_der()?)
                .map_err(|e| failed(&e))?;
            let result = if matches!(algorithm, SignatureAlgorithm::RsaPss(_)) {
                key.verify(digest.pss(), &hashed, signature)
            } else {
                key.verify(digest.pkcs1v15(), &hashed, signature)
            };
            result.map_err(|e| failed(&e))
        }
        SignatureAlgorithm::Ecdsa(_) => {
            let point = public_key.subject_public_key.raw_bytes();
            match EcCurve::from_spki(public_key)? {
                EcCurve::P256 => {
                    let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
                        .map_err(|e| failed(&e))?;
                    let sig = p256::ecdsa::Signature::from_der(signature).map_err(|e| failed(&e))?;
                    key.verify_prehash(&hashed, &sig).map_err(|e| failed(&e))
                }
                EcCurve::P384 => {
                    let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point)
                        .map_err(|e| failed(&e))?;
                    let sig = p384::ecdsa::Signature::from_der(signature).map_err(|e| failed(&e))?;
                    key.verify_prehash(&hashed, &sig).map_err(|e| failed(&e))
                }
                EcCurve::P521 => {
                    let key = p521::ecdsa::VerifyingKey::from_sec1_bytes(point)
                        .map_err(|e| failed(&e))?;
                    let sig = p521::ecdsa::Signature::from_der(signature).map_err(|e| failed(&e))?;
                    key.verify_prehash(&hashed, &sig).map_err(|e| failed(&e))
                }
            }
        }
    }
}

/// Checks that a DER-encoded object's algorithm identifier parses back to `algorithm`.
pub(crate) fn check_algorithm_identifier(
    id: &AlgorithmIdentifierOwned,
    algorithm: SignatureAlgorithm,
) -> Result<()> {
    let parsed = SignatureAlgorithm::from_algorithm_identifier(id)?;
    if parsed != algorithm {
        return Err(HsmCertError::VerificationError(format!(
            "algorithm identifier {parsed:?} does not match {algorithm:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_identifier_round_trip() {
        for digest in [
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ] {
            for alg in [
                SignatureAlgorithm::RsaPkcs1v15(digest),
                SignatureAlgorithm::RsaPss(digest),
                SignatureAlgorithm::Ecdsa(digest),
            ] {
                let id = alg.algorithm_identifier().unwrap();
                assert_eq!(SignatureAlgorithm::from_algorithm_identifier(&id).unwrap(), alg);
            }
        }
    }

    #[test]
    fn test_pkcs1v15_identifier_has_null_parameters() {
        let id = SignatureAlgorithm::RsaPkcs1v15(DigestAlgorithm::Sha256)
            .algorithm_identifier()
            .unwrap();
        assert_eq!(id.oid, rfc5912::SHA_256_WITH_RSA_ENCRYPTION);
        assert_eq!(id.parameters.unwrap().to_der().unwrap(), vec![0x05, 0x00]);

        let ec = SignatureAlgorithm::Ecdsa(DigestAlgorithm::Sha384)
            .algorithm_identifier()
            .unwrap();
        assert!(ec.parameters.is_none());
    }

    #[test]
    fn test_ecdsa_raw_to_der() {
        let mut raw = vec![0u8; 64];
        raw[31] = 0x01;
        raw[32] = 0x80;
        raw[63] = 0x02;

        let der = ecdsa_raw_to_der(&raw, EcCurve::P256).unwrap();
        // r = 1 is a single byte, s has its high bit set and needs a leading zero.
        assert_eq!(&der[..5], &[0x30, 0x26, 0x02, 0x01, 0x01]);
        assert_eq!(&der[5..8], &[0x02, 0x21, 0x00]);
        assert_eq!(der[8], 0x80);

        assert!(ecdsa_raw_to_der(&raw[..63], EcCurve::P256).is_err());
    }

    #[test]
    fn test_ecdsa_digest_follows_curve() {
        let adapter = SigningAdapter::Ecdsa { curve: EcCurve::P384 };
        assert_eq!(adapter.digest_for(DigestAlgorithm::Sha256), DigestAlgorithm::Sha384);

        let adapter = SigningAdapter::Rsa {
            padding: RsaPadding::Pss,
        };
        assert_eq!(adapter.digest_for(DigestAlgorithm::Sha512), DigestAlgorithm::Sha512);
        assert_eq!(
            adapter.signature_algorithm(DigestAlgorithm::Sha512),
            SignatureAlgorithm::RsaPss(DigestAlgorithm::Sha512)
        );
    }
}

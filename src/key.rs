//! Token-resident key pairs.
//!
//! A [`KeyPair`] never holds private key material. It records where the key
//! lives in the token (label and id), its algorithm and its public key. The
//! [`KeyRegistry`] finds, generates, imports, lists and deletes key pairs
//! through the session pool and caches public keys indefinitely.

use der::referenced::OwnedToRef;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use const_oid::ObjectIdentifier;
use const_oid::db::rfc5912::{
    ID_EC_PUBLIC_KEY, RSA_ENCRYPTION, SECP_256_R_1, SECP_384_R_1, SECP_521_R_1,
};
use der::{Encode, EncodePem};
use log::{debug, info};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use pkcs8::{DecodePrivateKey, PrivateKeyInfo};
use rsa::traits::{PrivateKeyParts as _, PublicKeyParts as _};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use secrecy::SecretSlice;
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::error::{HsmCertError, Result};
use crate::issuer;
use crate::session::SessionManager;
use crate::signer::DigestAlgorithm;
use crate::token::{KeyGenParams, KeyRef, PrivateKeyParts, PublicKeyParts, TokenKeyPair};

pub const RSA_KEY_SIZES: [u32; 3] = [2048, 3072, 4096];

/// Supported named curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcCurve {
    P256,
    P384,
    P521,
}

impl EcCurve {
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            EcCurve::P256 => SECP_256_R_1,
            EcCurve::P384 => SECP_384_R_1,
            EcCurve::P521 => SECP_521_R_1,
        }
    }

    pub fn from_oid(oid: ObjectIdentifier) -> Result<Self> {
        match oid {
            SECP_256_R_1 => Ok(EcCurve::P256),
            SECP_384_R_1 => Ok(EcCurve::P384),
            SECP_521_R_1 => Ok(EcCurve::P521),
            _ => Err(HsmCertError::UnsupportedAlgorithmError(format!(
                "elliptic curve {oid}"
            ))),
        }
    }

    /// Reads the named curve from an `id-ecPublicKey` SubjectPublicKeyInfo.
    pub fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self> {
        if spki.algorithm.oid != ID_EC_PUBLIC_KEY {
            return Err(HsmCertError::UnsupportedAlgorithmError(format!(
                "public key algorithm {}",
                spki.algorithm.oid
            )));
        }
        let curve = spki
            .algorithm
            .owned_to_ref()
            .parameters_oid()
            .map_err(|e| HsmCertError::DecodingError(e.to_string()))?;
        Self::from_oid(curve)
    }

    /// Size in bytes of a scalar, and of each half of a raw signature.
    pub fn field_len(self) -> usize {
        match self {
            EcCurve::P256 => 32,
            EcCurve::P384 => 48,
            EcCurve::P521 => 66,
        }
    }

    /// The hash conventionally paired with this curve.
    pub fn digest(self) -> DigestAlgorithm {
        match self {
            EcCurve::P256 => DigestAlgorithm::Sha256,
            EcCurve::P384 => DigestAlgorithm::Sha384,
            EcCurve::P521 => DigestAlgorithm::Sha512,
        }
    }
}

impl FromStr for EcCurve {
    type Err = HsmCertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "p-256" | "p256" | "secp256r1" | "prime256v1" => Ok(EcCurve::P256),
            "p-384" | "p384" | "secp384r1" => Ok(EcCurve::P384),
            "p-521" | "p521" | "secp521r1" => Ok(EcCurve::P521),
            other => Err(HsmCertError::UnsupportedAlgorithmError(format!(
                "elliptic curve '{other}'"
            ))),
        }
    }
}

/// Algorithm of a key pair that exists in the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// Modulus size in bits.
    Rsa(u32),
    Ec(EcCurve),
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa(bits) => write!(f, "rsa_{bits}"),
            KeyAlgorithm::Ec(EcCurve::P256) => write!(f, "secp256r1"),
            KeyAlgorithm::Ec(EcCurve::P384) => write!(f, "secp384r1"),
            KeyAlgorithm::Ec(EcCurve::P521) => write!(f, "secp521r1"),
        }
    }
}

/// A requested key type, as a caller would spell it.
///
/// Unchecked until converted to a [`KeyAlgorithm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySpec {
    Rsa { bits: u32 },
    Ec { curve: String },
}

impl KeySpec {
    pub fn rsa(bits: u32) -> Self {
        KeySpec::Rsa { bits }
    }

    pub fn ec(curve: &str) -> Self {
        KeySpec::Ec {
            curve: curve.to_string(),
        }
    }
}

impl FromStr for KeySpec {
    type Err = HsmCertError;

    /// Accepts `rsa_2048`, `rsa_3072`, `rsa_4096` or a curve name such as `secp256r1`.
    fn from_str(s: &str) -> Result<Self> {
        match s.strip_prefix("rsa_").or_else(|| s.strip_prefix("rsa")) {
            Some(bits) => bits
                .parse()
                .map(KeySpec::rsa)
                .map_err(|_| HsmCertError::UnsupportedAlgorithmError(format!("key type '{s}'"))),
            None => Ok(KeySpec::ec(s)),
        }
    }
}

impl TryFrom<&KeySpec> for KeyAlgorithm {
    type Error = HsmCertError;

    fn try_from(spec: &KeySpec) -> Result<Self> {
        match spec {
            KeySpec::Rsa { bits } if RSA_KEY_SIZES.contains(bits) => Ok(KeyAlgorithm::Rsa(*bits)),
            KeySpec::Rsa { bits } => Err(HsmCertError::UnsupportedAlgorithmError(format!(
                "RSA key size {bits}, expected one of {RSA_KEY_SIZES:?}"
            ))),
            KeySpec::Ec { curve } => curve.parse().map(KeyAlgorithm::Ec),
        }
    }
}

impl KeyAlgorithm {
    fn generation_params(self) -> KeyGenParams {
        match self {
            KeyAlgorithm::Rsa(bits) => KeyGenParams::Rsa { bits },
            KeyAlgorithm::Ec(curve) => KeyGenParams::Ec { curve: curve.oid() },
        }
    }
}

/// Decodes an unencrypted PKCS#8 private key into token import attributes.
fn decode_private_key(der: &[u8]) -> Result<(KeyAlgorithm, PrivateKeyParts)> {
    let malformed = |e: &dyn fmt::Display| HsmCertError::DecodingError(format!("PKCS#8 private key: {e}"));
    let info = PrivateKeyInfo::try_from(der).map_err(|e| malformed(&e))?;

    if info.algorithm.oid == RSA_ENCRYPTION {
        let key = RsaPrivateKey::from_pkcs8_der(der).map_err(|e| malformed(&e))?;
        let algorithm = KeyAlgorithm::try_from(&KeySpec::rsa(key.n().bits() as u32))?;
        let [prime_1, prime_2] = key.primes() else {
            return Err(HsmCertError::UnsupportedAlgorithmError(format!(
                "RSA key with {} primes",
                key.primes().len()
            )));
        };
        let (Some(exponent_1), Some(exponent_2), Some(coefficient)) =
            (key.dp(), key.dq(), key.crt_coefficient())
        else {
            return Err(malformed(&"RSA key without CRT parameters"));
        };
        let secret = |n: &BigUint| SecretSlice::from(n.to_bytes_be());

        let parts = PrivateKeyParts::Rsa {
            modulus: key.n().to_bytes_be(),
            public_exponent: key.e().to_bytes_be(),
            private_exponent: secret(key.d()),
            prime_1: secret(prime_1),
            prime_2: secret(prime_2),
            exponent_1: secret(exponent_1),
            exponent_2: secret(exponent_2),
            coefficient: secret(&coefficient),
        };
        return Ok((algorithm, parts));
    }

    if info.algorithm.oid != ID_EC_PUBLIC_KEY {
        return Err(HsmCertError::UnsupportedAlgorithmError(format!(
            "private key algorithm {}",
            info.algorithm.oid
        )));
    }
    let curve = EcCurve::from_oid(info.algorithm.parameters_oid().map_err(|e| malformed(&e))?)?;
    let (point, value) = match curve {
        EcCurve::P256 => {
            let key = p256::SecretKey::from_pkcs8_der(der).map_err(|e| malformed(&e))?;
            (key.public_key().to_encoded_point(false).as_bytes().to_vec(), key.to_bytes().to_vec())
        }
        EcCurve::P384 => {
            let key = p384::SecretKey::from_pkcs8_der(der).map_err(|e| malformed(&e))?;
            (key.public_key().to_encoded_point(false).as_bytes().to_vec(), key.to_bytes().to_vec())
        }
        EcCurve::P521 => {
            let key = p521::SecretKey::from_pkcs8_der(der).map_err(|e| malformed(&e))?;
            (key.public_key().to_encoded_point(false).as_bytes().to_vec(), key.to_bytes().to_vec())
        }
    };

    let parts = PrivateKeyParts::Ec {
        curve: curve.oid(),
        point,
        value: SecretSlice::from(value),
    };
    Ok((KeyAlgorithm::Ec(curve), parts))
}

/// A key pair held by the token. Only the public half is data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub key_ref: KeyRef,
    pub algorithm: KeyAlgorithm,
    pub public_key: SubjectPublicKeyInfoOwned,
}

impl KeyPair {
    /// Builds a `KeyPair` from the attributes read out of the token.
    pub fn from_token(pair: TokenKeyPair) -> Result<Self> {
        let (algorithm, public_key) = match pair.public {
            PublicKeyParts::Rsa { modulus, exponent } => {
                let public = RsaPublicKey::new(
                    BigUint::from_bytes_be(&modulus),
                    BigUint::from_bytes_be(&exponent),
                )?;
                let bits = public.n().bits() as u32;
                (
                    KeyAlgorithm::Rsa(bits),
                    SubjectPublicKeyInfoOwned::from_key(public)?,
                )
            }
            PublicKeyParts::Ec { curve, point } => {
                let curve = EcCurve::from_oid(curve)?;
                let invalid = |e: &dyn fmt::Display| {
                    HsmCertError::DecodingError(format!("EC point of {}: {e}", pair.key_ref))
                };
                let spki = match curve {
                    EcCurve::P256 => SubjectPublicKeyInfoOwned::from_key(
                        p256::ecdsa::VerifyingKey::from_sec1_bytes(&point)
                            .map_err(|e| invalid(&e))?,
                    )?,
                    EcCurve::P384 => SubjectPublicKeyInfoOwned::from_key(
                        p384::ecdsa::VerifyingKey::from_sec1_bytes(&point)
                            .map_err(|e| invalid(&e))?,
                    )?,
                    EcCurve::P521 => SubjectPublicKeyInfoOwned::from_key(
                        p521::PublicKey::from_sec1_bytes(&point)
                            .map_err(|e| invalid(&e))?,
                    )?,
                };
                (KeyAlgorithm::Ec(curve), spki)
            }
        };

        Ok(Self {
            key_ref: pair.key_ref,
            algorithm,
            public_key,
        })
    }

    /// SHA-1 over the subjectPublicKey bits (RFC 5280 §4.2.1.2, method 1).
    pub fn key_identifier(&self) -> Vec<u8> {
        issuer::key_identifier(&self.public_key)
    }

    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        Ok(self.public_key.to_der()?)
    }

    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key
            .to_pem(pkcs8::LineEnding::LF)
            .map_err(|e| HsmCertError::EncodingError(e.to_string()))
    }
}

/// Finds and creates key pairs in the token.
pub struct KeyRegistry {
    sessions: Arc<SessionManager>,
    cache: RwLock<HashMap<KeyRef, KeyPair>>,
    generation_locks: Mutex<HashMap<KeyRef, Arc<Mutex<()>>>>,
}

impl KeyRegistry {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            cache: RwLock::new(HashMap::new()),
            generation_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Looks the key pair up in the token.
    pub fn find(&self, key: &KeyRef) -> Result<Option<KeyPair>> {
        let found = self
            .sessions
            .with_session("find key", |session| Ok(session.find_key_pair(key)?))?;

        match found {
            Some(pair) => {
                let pair = KeyPair::from_token(pair)?;
                self.remember(&pair);
                Ok(Some(pair))
            }
            None => Ok(None),
        }
    }

    /// Like [`Self::find`] but a missing key is an error.
    pub fn require(&self, key: &KeyRef) -> Result<KeyPair> {
        self.find(key)?
            .ok_or_else(|| HsmCertError::KeyNotFoundError(key.to_string()))
    }

    /// Creates a new key pair in the token.
    ///
    /// `spec` is validated before any token call. Existence check and
    /// creation run under a lock for this label and id, so concurrent callers
    /// cannot both create the same key.
    pub fn generate(&self, key: &KeyRef, spec: &KeySpec) -> Result<KeyPair> {
        let algorithm = KeyAlgorithm::try_from(spec)?;
        if key.label.is_empty() {
            return Err(HsmCertError::InvalidInput("key label must not be empty".to_string()));
        }

        let lock = self.generation_lock(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let params = algorithm.generation_params();
        let created = self.sessions.with_session("generate key", |session| {
            if let Some(existing) = session.find_key_pair(key)? {
                return Err(HsmCertError::KeyExistsError(existing.key_ref.to_string()));
            }
            Ok(session.generate_key_pair(key, &params)?)
        })?;

        let pair = KeyPair::from_token(created)?;
        if pair.algorithm != algorithm {
            return Err(HsmCertError::UnsupportedAlgorithmError(format!(
                "token generated {} for {key}, requested {algorithm}",
                pair.algorithm
            )));
        }
        info!("Generated {} key pair {}", pair.algorithm, pair.key_ref);
        self.remember(&pair);
        Ok(pair)
    }

    /// Stores an existing key pair in the token.
    ///
    /// `pkcs8_der` is an unencrypted PKCS#8 private key of an algorithm that
    /// [`Self::generate`] would accept. Like generation, the import fails with
    /// [`HsmCertError::KeyExistsError`] if the label is already taken.
    pub fn import(&self, key: &KeyRef, pkcs8_der: &[u8]) -> Result<KeyPair> {
        let (algorithm, parts) = decode_private_key(pkcs8_der)?;
        if key.label.is_empty() {
            return Err(HsmCertError::InvalidInput("key label must not be empty".to_string()));
        }

        let lock = self.generation_lock(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let imported = self.sessions.with_session("import key", |session| {
            if let Some(existing) = session.find_key_pair(key)? {
                return Err(HsmCertError::KeyExistsError(existing.key_ref.to_string()));
            }
            Ok(session.import_key_pair(key, &parts)?)
        })?;

        let pair = KeyPair::from_token(imported)?;
        if pair.algorithm != algorithm {
            return Err(HsmCertError::UnsupportedAlgorithmError(format!(
                "token stored {} for {key}, imported {algorithm}",
                pair.algorithm
            )));
        }
        info!("Imported {} key pair {}", pair.algorithm, pair.key_ref);
        self.remember(&pair);
        Ok(pair)
    }

    /// The key's public key, from cache when possible.
    pub fn public_key_of(&self, key: &KeyPair) -> Result<SubjectPublicKeyInfoOwned> {
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.key_ref)
        {
            return Ok(cached.public_key.clone());
        }
        debug!("Public key of {} not cached, reading from token", key.key_ref);
        Ok(self.require(&key.key_ref)?.public_key)
    }

    /// SHA-1 key identifier of the key's public key.
    pub fn key_identifier(&self, key: &KeyPair) -> Result<Vec<u8>> {
        Ok(issuer::key_identifier(&self.public_key_of(key)?))
    }

    /// All key pairs in the token, sorted by label and id.
    pub fn list(&self) -> Result<Vec<KeyPair>> {
        let found = self
            .sessions
            .with_session("list keys", |session| Ok(session.list_key_pairs()?))?;
        let mut pairs = found
            .into_iter()
            .map(KeyPair::from_token)
            .collect::<Result<Vec<_>>>()?;
        pairs.sort_by(|a, b| a.key_ref.cmp(&b.key_ref));
        for pair in &pairs {
            self.remember(pair);
        }
        Ok(pairs)
    }

    /// Destroys both halves of a key pair.
    pub fn delete(&self, key: &KeyRef) -> Result<()> {
        let lock = self.generation_lock(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let deleted = self
            .sessions
            .with_session("delete key", |session| Ok(session.destroy_key_pair(key)?))?;
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|cached, _| !key.matches(cached));

        if deleted {
            info!("Deleted key pair {key}");
            Ok(())
        } else {
            Err(HsmCertError::KeyNotFoundError(key.to_string()))
        }
    }

    fn remember(&self, pair: &KeyPair) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pair.key_ref.clone(), pair.clone());
    }

    /// Lock keyed by label only, since a label-only reference collides with every id.
    fn generation_lock(&self, key: &KeyRef) -> Arc<Mutex<()>> {
        self.generation_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(KeyRef::labelled(key.label.clone()))
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use pkcs8::EncodePrivateKey;
    use rand_core::OsRng;

    use super::*;
    use crate::config::TokenConfig;
    use crate::token::SignMechanism;
    use crate::token::soft::{FnIdx, SoftToken};

    fn registry(token: &SoftToken) -> KeyRegistry {
        let config = TokenConfig::builder()
            .module_path("/dev/null")
            .token_label("test")
            .pin("1234")
            .session_timeout_secs(1)
            .build();
        KeyRegistry::new(Arc::new(
            SessionManager::new(Arc::new(token.clone()), config).unwrap(),
        ))
    }

    #[test]
    fn test_key_spec_parsing() {
        assert_eq!("rsa_2048".parse::<KeySpec>().unwrap(), KeySpec::rsa(2048));
        assert_eq!(
            KeyAlgorithm::try_from(&"secp384r1".parse::<KeySpec>().unwrap()).unwrap(),
            KeyAlgorithm::Ec(EcCurve::P384)
        );
        assert!(matches!(
            KeyAlgorithm::try_from(&KeySpec::rsa(1024)),
            Err(HsmCertError::UnsupportedAlgorithmError(_))
        ));
        assert!(matches!(
            KeyAlgorithm::try_from(&KeySpec::ec("ed25519")),
            Err(HsmCertError::UnsupportedAlgorithmError(_))
        ));
    }

    #[test]
    fn test_unsupported_algorithm_makes_no_token_call() {
        let token = SoftToken::new("test", "1234");
        let keys = registry(&token);

        let err = keys
            .generate(&KeyRef::labelled("k"), &KeySpec::ec("secp192r1"))
            .unwrap_err();
        assert!(matches!(err, HsmCertError::UnsupportedAlgorithmError(_)));
        assert_eq!(token.call_counts().get(FnIdx::FindKeyPair), 0);
        assert_eq!(token.call_counts().get(FnIdx::GenerateKeyPair), 0);
    }

    #[test]
    fn test_generate_then_find() {
        let token = SoftToken::new("test", "1234");
        let keys = registry(&token);
        let key_ref = KeyRef::new("issuer", vec![7]);

        let generated = keys.generate(&key_ref, &KeySpec::ec("P-256")).unwrap();
        assert_eq!(generated.algorithm, KeyAlgorithm::Ec(EcCurve::P256));
        assert_eq!(generated.public_key.algorithm.oid, ID_EC_PUBLIC_KEY);

        let found = keys.find(&KeyRef::labelled("issuer")).unwrap().unwrap();
        assert_eq!(found, generated);
        assert!(keys.find(&KeyRef::labelled("missing")).unwrap().is_none());
        assert_eq!(keys.key_identifier(&found).unwrap().len(), 20);
    }

    #[test]
    fn test_generate_existing_key_fails() {
        let token = SoftToken::new("test", "1234");
        let keys = registry(&token);
        let key_ref = KeyRef::labelled("dup");

        keys.generate(&key_ref, &KeySpec::ec("secp256r1")).unwrap();
        let err = keys.generate(&key_ref, &KeySpec::ec("secp256r1")).unwrap_err();
        assert!(matches!(err, HsmCertError::KeyExistsError(_)));
        assert_eq!(token.call_counts().get(FnIdx::GenerateKeyPair), 1);
    }

    #[test]
    fn test_concurrent_generation_creates_one_key() {
        let token = SoftToken::new("test", "1234");
        let keys = Arc::new(registry(&token));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let keys = keys.clone();
                std::thread::spawn(move || {
                    keys.generate(&KeyRef::labelled("race"), &KeySpec::ec("secp256r1"))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, HsmCertError::KeyExistsError(_))));
        assert_eq!(token.call_counts().get(FnIdx::GenerateKeyPair), 1);
    }

    #[test]
    fn test_public_key_is_cached() {
        let token = SoftToken::new("test", "1234");
        let keys = registry(&token);
        let pair = keys
            .generate(&KeyRef::labelled("cached"), &KeySpec::ec("secp384r1"))
            .unwrap();

        let finds = token.call_counts().get(FnIdx::FindKeyPair);
        let spki = keys.public_key_of(&pair).unwrap();
        keys.public_key_of(&pair).unwrap();
        assert_eq!(spki, pair.public_key);
        assert_eq!(token.call_counts().get(FnIdx::FindKeyPair), finds);
    }

    #[test]
    fn test_list_and_delete() {
        let token = SoftToken::new("test", "1234");
        let keys = registry(&token);
        keys.generate(&KeyRef::labelled("b"), &KeySpec::ec("secp256r1"))
            .unwrap();
        keys.generate(&KeyRef::labelled("a"), &KeySpec::ec("secp521r1"))
            .unwrap();

        let labels: Vec<_> = keys
            .list()
            .unwrap()
            .into_iter()
            .map(|k| k.key_ref.label)
            .collect();
        assert_eq!(labels, vec!["a", "b"]);

        keys.delete(&KeyRef::labelled("a")).unwrap();
        assert!(keys.find(&KeyRef::labelled("a")).unwrap().is_none());
        assert!(matches!(
            keys.delete(&KeyRef::labelled("a")),
            Err(HsmCertError::KeyNotFoundError(_))
        ));
    }

    #[test]
    fn test_import_ec_key_then_find() {
        let token = SoftToken::new("test", "1234");
        let keys = registry(&token);
        let secret = p384::SecretKey::random(&mut OsRng);
        let der = secret.to_pkcs8_der().unwrap();

        let imported = keys.import(&KeyRef::labelled("imported"), der.as_bytes()).unwrap();
        assert_eq!(imported.algorithm, KeyAlgorithm::Ec(EcCurve::P384));
        assert_eq!(
            imported.public_key,
            SubjectPublicKeyInfoOwned::from_key(secret.public_key()).unwrap()
        );

        let found = keys.find(&KeyRef::labelled("imported")).unwrap().unwrap();
        assert_eq!(found, imported);
        assert_eq!(token.call_counts().get(FnIdx::ImportKeyPair), 1);
        assert_eq!(token.call_counts().get(FnIdx::GenerateKeyPair), 0);
    }

    #[test]
    fn test_imported_rsa_key_signs() {
        let token = SoftToken::new("test", "1234");
        let keys = registry(&token);
        let private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let der = private.to_pkcs8_der().unwrap();

        let key_ref = KeyRef::labelled("rsa");
        let imported = keys.import(&key_ref, der.as_bytes()).unwrap();
        assert_eq!(imported.algorithm, KeyAlgorithm::Rsa(2048));

        let message = b"digest info stand-in";
        let sig = keys
            .sessions()
            .with_session("sign", |s| Ok(s.sign(&key_ref, SignMechanism::RsaPkcs, message)?))
            .unwrap();
        private
            .to_public_key()
            .verify(rsa::Pkcs1v15Sign::new_unprefixed(), message, &sig)
            .unwrap();
    }

    #[test]
    fn test_import_existing_label_fails() {
        let token = SoftToken::new("test", "1234");
        let keys = registry(&token);
        keys.generate(&KeyRef::labelled("taken"), &KeySpec::ec("secp256r1"))
            .unwrap();
        let der = p256::SecretKey::random(&mut OsRng).to_pkcs8_der().unwrap();

        let err = keys
            .import(&KeyRef::new("taken", vec![9]), der.as_bytes())
            .unwrap_err();
        assert!(matches!(err, HsmCertError::KeyExistsError(_)));

        keys.import(&KeyRef::labelled("fresh"), der.as_bytes()).unwrap();
        let err = keys.import(&KeyRef::labelled("fresh"), der.as_bytes()).unwrap_err();
        assert!(matches!(err, HsmCertError::KeyExistsError(_)));
        assert_eq!(token.call_counts().get(FnIdx::ImportKeyPair), 1);
    }

    #[test]
    fn test_import_rejects_unsupported_keys_before_token_calls() {
        let token = SoftToken::new("test", "1234");
        let keys = registry(&token);
        let weak = RsaPrivateKey::new(&mut OsRng, 1024).unwrap().to_pkcs8_der().unwrap();

        let err = keys.import(&KeyRef::labelled("weak"), weak.as_bytes()).unwrap_err();
        assert!(matches!(err, HsmCertError::UnsupportedAlgorithmError(_)));
        let err = keys.import(&KeyRef::labelled("junk"), &[0x30, 0x03, 0x02, 0x01, 0x00]).unwrap_err();
        assert!(matches!(err, HsmCertError::DecodingError(_)));
        assert_eq!(token.call_counts().get(FnIdx::FindKeyPair), 0);
        assert_eq!(token.call_counts().get(FnIdx::ImportKeyPair), 0);
    }

    #[test]
    fn test_public_key_pem() {
        let token = SoftToken::new("test", "1234");
        let keys = registry(&token);
        let pair = keys
            .generate(&KeyRef::labelled("pem"), &KeySpec::ec("secp256r1"))
            .unwrap();
        let pem = pair.public_key_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }
}

//! An in-process token backed by RustCrypto keys.
//!
//! Behaves like a PKCS#11 token as far as this crate can observe: keys are
//! addressed by label and id, ECDSA returns raw `r || s`, RSA signs a
//! caller-built DigestInfo. It also lets tests inject session loss, PIN
//! rejection, unavailability and signing refusals, and counts every call.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use const_oid::db::rfc5912::{SECP_256_R_1, SECP_384_R_1, SECP_521_R_1};
use ecdsa::signature::hazmat::PrehashSigner;
use rand_core::OsRng;
use rsa::traits::PublicKeyParts as _;
use rsa::{BigUint, Pkcs1v15Sign, Pss, RsaPrivateKey};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Sha256, Sha384, Sha512};

use super::{
    KeyGenParams, KeyRef, PrivateKeyParts, PublicKeyParts, SignMechanism, Token, TokenError,
    TokenErrorKind, TokenKeyPair, TokenSession,
};
use crate::signer::DigestAlgorithm;

/// Index of each counted call.
#[derive(Debug, Clone, Copy)]
pub enum FnIdx {
    OpenSession,
    Login,
    Ping,
    FindKeyPair,
    ListKeyPairs,
    GenerateKeyPair,
    ImportKeyPair,
    DestroyKeyPair,
    Sign,
    ImportCertificate,
    ExportCertificate,
    DeleteCertificate,
    Count,
}

#[derive(Debug)]
pub struct SoftTokenCallCounts {
    call_counts: RwLock<Vec<u32>>,
}

impl SoftTokenCallCounts {
    fn new() -> Self {
        Self {
            call_counts: RwLock::new(vec![0; FnIdx::Count as usize]),
        }
    }

    pub fn get(&self, fn_idx: FnIdx) -> u32 {
        self.call_counts.read().unwrap_or_else(PoisonError::into_inner)[fn_idx as usize]
    }

    fn inc(&self, fn_idx: FnIdx) {
        self.call_counts.write().unwrap_or_else(PoisonError::into_inner)[fn_idx as usize] += 1;
    }
}

enum SoftKey {
    Rsa(Box<RsaPrivateKey>),
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
    P521(p521::ecdsa::SigningKey),
}

impl SoftKey {
    fn generate(params: &KeyGenParams) -> Result<Self, TokenError> {
        let mut rng = OsRng;
        match params {
            KeyGenParams::Rsa { bits } => RsaPrivateKey::new(&mut rng, *bits as usize)
                .map(|key| SoftKey::Rsa(Box::new(key)))
                .map_err(|err| {
                    TokenError::new(TokenErrorKind::Other, "GENERATE_FAILED", err.to_string())
                }),
            KeyGenParams::Ec { curve } => match *curve {
                SECP_256_R_1 => Ok(SoftKey::P256(p256::ecdsa::SigningKey::random(&mut rng))),
                SECP_384_R_1 => Ok(SoftKey::P384(p384::ecdsa::SigningKey::random(&mut rng))),
                SECP_521_R_1 => Ok(SoftKey::P521(p521::ecdsa::SigningKey::random(&mut rng))),
                _ => Err(TokenError::new(
                    TokenErrorKind::MechanismInvalid,
                    "MechanismParamInvalid",
                    format!("generate key on curve {curve}"),
                )),
            },
        }
    }

    fn from_parts(parts: &PrivateKeyParts) -> Result<Self, TokenError> {
        let inconsistent = |err: &dyn std::fmt::Display| {
            TokenError::new(
                TokenErrorKind::Other,
                "TemplateInconsistent",
                format!("C_CreateObject: {err}"),
            )
        };
        match parts {
            PrivateKeyParts::Rsa {
                modulus,
                public_exponent,
                private_exponent,
                prime_1,
                prime_2,
                ..
            } => {
                let int = |bytes: &[u8]| BigUint::from_bytes_be(bytes);
                RsaPrivateKey::from_components(
                    int(modulus),
                    int(public_exponent),
                    int(private_exponent.expose_secret()),
                    vec![int(prime_1.expose_secret()), int(prime_2.expose_secret())],
                )
                .map(|key| SoftKey::Rsa(Box::new(key)))
                .map_err(|err| inconsistent(&err))
            }
            PrivateKeyParts::Ec { curve, value, .. } => {
                let value = value.expose_secret();
                match *curve {
                    SECP_256_R_1 => p256::ecdsa::SigningKey::from_slice(value)
                        .map(SoftKey::P256)
                        .map_err(|err| inconsistent(&err)),
                    SECP_384_R_1 => p384::ecdsa::SigningKey::from_slice(value)
                        .map(SoftKey::P384)
                        .map_err(|err| inconsistent(&err)),
                    SECP_521_R_1 => p521::ecdsa::SigningKey::from_slice(value)
                        .map(SoftKey::P521)
                        .map_err(|err| inconsistent(&err)),
                    _ => Err(TokenError::new(
                        TokenErrorKind::MechanismInvalid,
                        "CurveNotSupported",
                        format!("C_CreateObject on curve {curve}"),
                    )),
                }
            }
        }
    }

    fn public_parts(&self) -> PublicKeyParts {
        match self {
            SoftKey::Rsa(key) => PublicKeyParts::Rsa {
                modulus: key.n().to_bytes_be(),
                exponent: key.e().to_bytes_be(),
            },
            SoftKey::P256(key) => PublicKeyParts::Ec {
                curve: SECP_256_R_1,
                point: key.verifying_key().to_encoded_point(false).as_bytes().to_vec(),
            },
            SoftKey::P384(key) => PublicKeyParts::Ec {
                curve: SECP_384_R_1,
                point: key.verifying_key().to_encoded_point(false).as_bytes().to_vec(),
            },
            SoftKey::P521(key) => PublicKeyParts::Ec {
                curve: SECP_521_R_1,
                point: p521::ecdsa::VerifyingKey::from(key).to_encoded_point(false).as_bytes().to_vec(),
            },
        }
    }

    fn sign(&self, mechanism: SignMechanism, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        let inconsistent = || {
            TokenError::new(
                TokenErrorKind::KeyNotPermitted,
                "KeyTypeInconsistent",
                "C_SignInit",
            )
        };
        let sign_failed = |err: &dyn std::fmt::Display| {
            TokenError::new(TokenErrorKind::DataTooLarge, "DataLenRange", format!("C_Sign: {err}"))
        };

        match (self, mechanism) {
            (SoftKey::Rsa(key), SignMechanism::RsaPkcs) => key
                .sign(Pkcs1v15Sign::new_unprefixed(), data)
                .map_err(|err| sign_failed(&err)),
            (SoftKey::Rsa(key), SignMechanism::RsaPkcsPss { digest, salt_len }) => {
                let padding = match digest {
                    DigestAlgorithm::Sha256 => Pss::new_with_salt::<Sha256>(salt_len),
                    DigestAlgorithm::Sha384 => Pss::new_with_salt::<Sha384>(salt_len),
                    DigestAlgorithm::Sha512 => Pss::new_with_salt::<Sha512>(salt_len),
                };
                key.sign_with_rng(&mut OsRng, padding, data)
                    .map_err(|err| sign_failed(&err))
            }
            (SoftKey::P256(key), SignMechanism::Ecdsa) => {
                let sig: p256::ecdsa::Signature =
                    key.sign_prehash(data).map_err(|err| sign_failed(&err))?;
                Ok(sig.to_bytes().to_vec())
            }
            (SoftKey::P384(key), SignMechanism::Ecdsa) => {
                let sig: p384::ecdsa::Signature =
                    key.sign_prehash(data).map_err(|err| sign_failed(&err))?;
                Ok(sig.to_bytes().to_vec())
            }
            (SoftKey::P521(key), SignMechanism::Ecdsa) => {
                let sig: p521::ecdsa::Signature =
                    key.sign_prehash(data).map_err(|err| sign_failed(&err))?;
                Ok(sig.to_bytes().to_vec())
            }
            _ => Err(inconsistent()),
        }
    }
}

#[derive(Default)]
struct Objects {
    keys: BTreeMap<KeyRef, SoftKey>,
    certificates: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    session_loss: AtomicU32,
    sign_error: Mutex<Option<(TokenErrorKind, String)>>,
}

struct Shared {
    label: String,
    pin: SecretString,
    objects: Mutex<Objects>,
    faults: Faults,
    counts: SoftTokenCallCounts,
    next_session: AtomicU64,
    open_sessions: AtomicUsize,
    max_open_sessions: AtomicUsize,
}

impl Shared {
    fn objects(&self) -> MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory token. Cloning yields another handle to the same token.
#[derive(Clone)]
pub struct SoftToken {
    shared: Arc<Shared>,
}

impl SoftToken {
    pub fn new(label: &str, pin: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                label: label.to_string(),
                pin: SecretString::from(pin.to_string()),
                objects: Mutex::new(Objects::default()),
                faults: Faults::default(),
                counts: SoftTokenCallCounts::new(),
                next_session: AtomicU64::new(1),
                open_sessions: AtomicUsize::new(0),
                max_open_sessions: AtomicUsize::new(0),
            }),
        }
    }

    pub fn call_counts(&self) -> &SoftTokenCallCounts {
        &self.shared.counts
    }

    /// Sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }

    /// Highest number of sessions that were open at the same time.
    pub fn max_open_sessions(&self) -> usize {
        self.shared.max_open_sessions.load(Ordering::SeqCst)
    }

    /// The next `count` object operations fail with `SessionHandleInvalid`,
    /// each killing the session it ran on.
    pub fn invalidate_next_sessions(&self, count: u32) {
        self.shared.faults.session_loss.store(count, Ordering::SeqCst);
    }

    /// While set, opening a session fails as if the token was removed.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next sign call fails with the given error.
    pub fn fail_next_sign(&self, kind: TokenErrorKind, code: &str) {
        *self
            .shared
            .faults
            .sign_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((kind, code.to_string()));
    }
}

impl Token for SoftToken {
    fn open_session(&self) -> Result<Box<dyn TokenSession>, TokenError> {
        self.shared.counts.inc(FnIdx::OpenSession);
        if self.shared.faults.unavailable.load(Ordering::SeqCst) {
            return Err(TokenError::new(
                TokenErrorKind::TokenNotPresent,
                "TokenNotPresent",
                "C_OpenSession",
            ));
        }

        let open = self.shared.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_open_sessions.fetch_max(open, Ordering::SeqCst);

        Ok(Box::new(SoftSession {
            shared: self.shared.clone(),
            id: self.shared.next_session.fetch_add(1, Ordering::SeqCst),
            logged_in: false,
            dead: Cell::new(false),
        }))
    }

    fn description(&self) -> String {
        format!("{} (software)", self.shared.label)
    }
}

struct SoftSession {
    shared: Arc<Shared>,
    id: u64,
    logged_in: bool,
    dead: Cell<bool>,
}

impl SoftSession {
    /// Gate for every object operation.
    fn check(&self, context: &str) -> Result<(), TokenError> {
        if self.dead.get() {
            return Err(TokenError::new(
                TokenErrorKind::SessionInvalid,
                "SessionHandleInvalid",
                context,
            ));
        }
        let faults = &self.shared.faults;
        if faults
            .session_loss
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.dead.set(true);
            return Err(TokenError::new(
                TokenErrorKind::SessionInvalid,
                "SessionHandleInvalid",
                context,
            ));
        }
        if !self.logged_in {
            return Err(TokenError::new(
                TokenErrorKind::Other,
                "UserNotLoggedIn",
                context,
            ));
        }
        Ok(())
    }
}

impl Drop for SoftSession {
    fn drop(&mut self) {
        self.shared.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TokenSession for SoftSession {
    fn slot_id(&self) -> u64 {
        0
    }

    fn login(&mut self, pin: &SecretString) -> Result<(), TokenError> {
        self.shared.counts.inc(FnIdx::Login);
        if self.logged_in {
            return Err(TokenError::new(
                TokenErrorKind::AlreadyLoggedIn,
                "UserAlreadyLoggedIn",
                "C_Login",
            ));
        }
        if pin.expose_secret() != self.shared.pin.expose_secret() {
            return Err(TokenError::new(
                TokenErrorKind::PinRejected,
                "PinIncorrect",
                "C_Login",
            ));
        }
        self.logged_in = true;
        Ok(())
    }

    fn ping(&self) -> Result<(), TokenError> {
        self.shared.counts.inc(FnIdx::Ping);
        if self.dead.get() {
            return Err(TokenError::new(
                TokenErrorKind::SessionInvalid,
                "SessionHandleInvalid",
                format!("C_GetSessionInfo on session {}", self.id),
            ));
        }
        Ok(())
    }

    fn find_key_pair(&self, key: &KeyRef) -> Result<Option<TokenKeyPair>, TokenError> {
        self.shared.counts.inc(FnIdx::FindKeyPair);
        self.check("C_FindObjects")?;
        let objects = self.shared.objects();
        Ok(objects
            .keys
            .iter()
            .find(|(found, _)| key.matches(found))
            .map(|(found, soft)| TokenKeyPair {
                key_ref: found.clone(),
                public: soft.public_parts(),
            }))
    }

    fn list_key_pairs(&self) -> Result<Vec<TokenKeyPair>, TokenError> {
        self.shared.counts.inc(FnIdx::ListKeyPairs);
        self.check("C_FindObjects")?;
        let objects = self.shared.objects();
        Ok(objects
            .keys
            .iter()
            .map(|(key_ref, soft)| TokenKeyPair {
                key_ref: key_ref.clone(),
                public: soft.public_parts(),
            })
            .collect())
    }

    fn generate_key_pair(
        &mut self,
        key: &KeyRef,
        params: &KeyGenParams,
    ) -> Result<TokenKeyPair, TokenError> {
        self.shared.counts.inc(FnIdx::GenerateKeyPair);
        self.check("C_GenerateKeyPair")?;
        let soft = SoftKey::generate(params)?;
        let public = soft.public_parts();
        self.shared.objects().keys.insert(key.clone(), soft);
        Ok(TokenKeyPair {
            key_ref: key.clone(),
            public,
        })
    }

    fn import_key_pair(
        &mut self,
        key: &KeyRef,
        parts: &PrivateKeyParts,
    ) -> Result<TokenKeyPair, TokenError> {
        self.shared.counts.inc(FnIdx::ImportKeyPair);
        self.check("C_CreateObject")?;
        let soft = SoftKey::from_parts(parts)?;
        let public = soft.public_parts();
        if public != parts.public() {
            return Err(TokenError::new(
                TokenErrorKind::Other,
                "TemplateInconsistent",
                "C_CreateObject: public key does not belong to the private key",
            ));
        }
        self.shared.objects().keys.insert(key.clone(), soft);
        Ok(TokenKeyPair {
            key_ref: key.clone(),
            public,
        })
    }

    fn destroy_key_pair(&mut self, key: &KeyRef) -> Result<bool, TokenError> {
        self.shared.counts.inc(FnIdx::DestroyKeyPair);
        self.check("C_DestroyObject")?;
        let mut objects = self.shared.objects();
        let before = objects.keys.len();
        objects.keys.retain(|found, _| !key.matches(found));
        Ok(objects.keys.len() != before)
    }

    fn sign(
        &self,
        key: &KeyRef,
        mechanism: SignMechanism,
        data: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        self.shared.counts.inc(FnIdx::Sign);
        self.check("C_Sign")?;

        let injected = self
            .shared
            .faults
            .sign_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((kind, code)) = injected {
            return Err(TokenError::new(kind, code, "C_Sign"));
        }

        let objects = self.shared.objects();
        let soft = objects
            .keys
            .iter()
            .find(|(found, _)| key.matches(found))
            .map(|(_, soft)| soft)
            .ok_or_else(|| {
                TokenError::new(
                    TokenErrorKind::ObjectNotFound,
                    "KeyHandleInvalid",
                    format!("C_SignInit with {key}"),
                )
            })?;
        soft.sign(mechanism, data)
    }

    fn import_certificate(&mut self, label: &str, der: &[u8]) -> Result<(), TokenError> {
        self.shared.counts.inc(FnIdx::ImportCertificate);
        self.check("C_CreateObject")?;
        self.shared
            .objects()
            .certificates
            .insert(label.to_string(), der.to_vec());
        Ok(())
    }

    fn export_certificate(&self, label: &str) -> Result<Option<Vec<u8>>, TokenError> {
        self.shared.counts.inc(FnIdx::ExportCertificate);
        self.check("C_FindObjects")?;
        Ok(self.shared.objects().certificates.get(label).cloned())
    }

    fn delete_certificate(&mut self, label: &str) -> Result<bool, TokenError> {
        self.shared.counts.inc(FnIdx::DeleteCertificate);
        self.check("C_DestroyObject")?;
        Ok(self.shared.objects().certificates.remove(label).is_some())
    }
}

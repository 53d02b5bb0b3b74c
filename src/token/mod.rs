//! The boundary to a PKCS#11 token.
//!
//! Everything above this module talks to a token through [`Token`] and
//! [`TokenSession`]. Driver errors are translated into [`TokenError`] exactly
//! once, inside the backend that made the call, so the rest of the crate only
//! ever matches on [`TokenErrorKind`].
//!
//! Two backends are provided: [`pkcs11::Pkcs11Token`] drives a real module
//! through `cryptoki`, and [`soft::SoftToken`] keeps keys in process memory
//! for tests and demos.

pub mod pkcs11;
pub mod soft;

use std::fmt;

use const_oid::ObjectIdentifier;
use secrecy::{SecretSlice, SecretString};

use crate::signer::DigestAlgorithm;

/// Closed set of token failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenErrorKind {
    /// The session handle is no longer valid or the session was closed.
    SessionInvalid,
    DeviceRemoved,
    TokenNotPresent,
    /// Wrong, locked or expired PIN.
    PinRejected,
    AlreadyLoggedIn,
    /// The PKCS#11 module could not be loaded or initialized.
    LibraryUnavailable,
    MechanismInvalid,
    /// The key exists but may not be used for the requested operation.
    KeyNotPermitted,
    DataTooLarge,
    ObjectNotFound,
    Other,
}

impl TokenErrorKind {
    /// True for errors after which the session must be discarded and the
    /// operation may be retried on a fresh one.
    pub fn is_session_loss(self) -> bool {
        matches!(
            self,
            TokenErrorKind::SessionInvalid
                | TokenErrorKind::DeviceRemoved
                | TokenErrorKind::TokenNotPresent
        )
    }
}

impl fmt::Display for TokenErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenErrorKind::SessionInvalid => "session invalid",
            TokenErrorKind::DeviceRemoved => "device removed",
            TokenErrorKind::TokenNotPresent => "token not present",
            TokenErrorKind::PinRejected => "PIN rejected",
            TokenErrorKind::AlreadyLoggedIn => "already logged in",
            TokenErrorKind::LibraryUnavailable => "library unavailable",
            TokenErrorKind::MechanismInvalid => "mechanism invalid",
            TokenErrorKind::KeyNotPermitted => "key not permitted",
            TokenErrorKind::DataTooLarge => "data too large",
            TokenErrorKind::ObjectNotFound => "object not found",
            TokenErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// A failed token call.
///
/// `code` is the driver's own error code (for example `SessionHandleInvalid`)
/// kept for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenError {
    pub kind: TokenErrorKind,
    pub code: String,
    pub context: String,
}

impl TokenError {
    pub fn new(kind: TokenErrorKind, code: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            context: context.into(),
        }
    }

    pub fn is_session_loss(&self) -> bool {
        self.kind.is_session_loss()
    }
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {} ({})", self.context, self.kind, self.code)
    }
}

impl std::error::Error for TokenError {}

/// Identifies a key pair inside the token by `CKA_LABEL` and `CKA_ID`.
///
/// An empty `id` matches on label alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyRef {
    pub label: String,
    pub id: Vec<u8>,
}

impl KeyRef {
    pub fn new(label: impl Into<String>, id: impl Into<Vec<u8>>) -> Self {
        Self {
            label: label.into(),
            id: id.into(),
        }
    }

    /// A reference that matches on label only.
    pub fn labelled(label: impl Into<String>) -> Self {
        Self::new(label, Vec::new())
    }

    /// True if `other` (a concrete key found in the token) is selected by this reference.
    pub fn matches(&self, other: &KeyRef) -> bool {
        self.label == other.label && (self.id.is_empty() || self.id == other.id)
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            write!(f, "{}", self.label)
        } else {
            write!(f, "{}/{}", self.label, hex::encode(&self.id))
        }
    }
}

/// Parameters handed to the token's key-pair generation mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyGenParams {
    Rsa { bits: u32 },
    Ec { curve: ObjectIdentifier },
}

/// Public key attributes as stored in the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeyParts {
    /// Big-endian `CKA_MODULUS` and `CKA_PUBLIC_EXPONENT`.
    Rsa { modulus: Vec<u8>, exponent: Vec<u8> },
    /// Named curve from `CKA_EC_PARAMS` and the uncompressed SEC1 point.
    Ec {
        curve: ObjectIdentifier,
        point: Vec<u8>,
    },
}

/// Private key material for `C_CreateObject`.
///
/// Integers are big-endian. Secret components are zeroized on drop.
#[derive(Debug)]
pub enum PrivateKeyParts {
    Rsa {
        modulus: Vec<u8>,
        public_exponent: Vec<u8>,
        private_exponent: SecretSlice<u8>,
        prime_1: SecretSlice<u8>,
        prime_2: SecretSlice<u8>,
        exponent_1: SecretSlice<u8>,
        exponent_2: SecretSlice<u8>,
        coefficient: SecretSlice<u8>,
    },
    /// `value` is the private scalar, `point` the uncompressed SEC1 public point.
    Ec {
        curve: ObjectIdentifier,
        point: Vec<u8>,
        value: SecretSlice<u8>,
    },
}

impl PrivateKeyParts {
    pub fn public(&self) -> PublicKeyParts {
        match self {
            PrivateKeyParts::Rsa {
                modulus,
                public_exponent,
                ..
            } => PublicKeyParts::Rsa {
                modulus: modulus.clone(),
                exponent: public_exponent.clone(),
            },
            PrivateKeyParts::Ec { curve, point, .. } => PublicKeyParts::Ec {
                curve: *curve,
                point: point.clone(),
            },
        }
    }
}

/// A key pair as found in the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenKeyPair {
    pub key_ref: KeyRef,
    pub public: PublicKeyParts,
}

/// Sign mechanisms this crate uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMechanism {
    /// `CKM_RSA_PKCS` over a caller-built DigestInfo.
    RsaPkcs,
    /// `CKM_RSA_PKCS_PSS` over a digest, MGF1 with the same hash.
    RsaPkcsPss {
        digest: DigestAlgorithm,
        salt_len: usize,
    },
    /// `CKM_ECDSA` over a digest. Returns raw `r || s`.
    Ecdsa,
}

/// A connection to one token slot.
pub trait Token: Send + Sync {
    /// Opens a new, not yet logged in, session.
    fn open_session(&self) -> Result<Box<dyn TokenSession>, TokenError>;

    /// Human-readable identification for log messages.
    fn description(&self) -> String;
}

/// One PKCS#11 session.
///
/// Sessions are not reentrant, so the trait is `Send` but not `Sync`: a
/// session is owned by exactly one caller at a time.
pub trait TokenSession: Send {
    fn slot_id(&self) -> u64;

    /// Logs the user in. `AlreadyLoggedIn` is treated as success by callers.
    fn login(&mut self, pin: &SecretString) -> Result<(), TokenError>;

    /// Cheap liveness check.
    fn ping(&self) -> Result<(), TokenError>;

    fn find_key_pair(&self, key: &KeyRef) -> Result<Option<TokenKeyPair>, TokenError>;

    fn list_key_pairs(&self) -> Result<Vec<TokenKeyPair>, TokenError>;

    fn generate_key_pair(
        &mut self,
        key: &KeyRef,
        params: &KeyGenParams,
    ) -> Result<TokenKeyPair, TokenError>;

    /// Stores existing key material as a public and a private key object
    /// sharing the label and id of `key`.
    fn import_key_pair(
        &mut self,
        key: &KeyRef,
        parts: &PrivateKeyParts,
    ) -> Result<TokenKeyPair, TokenError>;

    /// Returns false if no matching key pair existed.
    fn destroy_key_pair(&mut self, key: &KeyRef) -> Result<bool, TokenError>;

    fn sign(
        &self,
        key: &KeyRef,
        mechanism: SignMechanism,
        data: &[u8],
    ) -> Result<Vec<u8>, TokenError>;

    /// Stores a DER certificate as a token object labelled `label`.
    fn import_certificate(&mut self, label: &str, der: &[u8]) -> Result<(), TokenError>;

    fn export_certificate(&self, label: &str) -> Result<Option<Vec<u8>>, TokenError>;

    /// Returns false if no certificate with that label existed.
    fn delete_certificate(&mut self, label: &str) -> Result<bool, TokenError>;
}

use std::path::Path;

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CryptokiError, RvError};
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsPssParams};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{
    Attribute, AttributeType, CertificateType, KeyType, ObjectClass, ObjectHandle,
};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use der::asn1::OctetString;
use der::{Decode, Encode};
use log::{debug, info, warn};
use secrecy::{ExposeSecret, SecretString};

use super::{
    KeyGenParams, KeyRef, PrivateKeyParts, PublicKeyParts, SignMechanism, Token, TokenError,
    TokenErrorKind, TokenKeyPair, TokenSession,
};
use crate::signer::DigestAlgorithm;

const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// A token reached through a PKCS#11 module loaded with `cryptoki`.
pub struct Pkcs11Token {
    client: Pkcs11,
    slot: Slot,
    token_label: String,
    module_path: String,
}

impl Pkcs11Token {
    /// Loads and initializes the module, then locates the slot whose token
    /// carries `token_label`.
    pub fn open(module_path: impl AsRef<Path>, token_label: &str) -> Result<Self, TokenError> {
        let module_path = module_path.as_ref();
        let client = Pkcs11::new(module_path).map_err(|err| map_error(err, "C_GetFunctionList"))?;

        match client.initialize(CInitializeArgs::OsThreads) {
            Ok(()) => {}
            Err(CryptokiError::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {
                debug!("PKCS#11 module '{}' already initialized", module_path.display());
            }
            Err(err) => return Err(map_error(err, "C_Initialize")),
        }

        let slots = client
            .get_slots_with_token()
            .map_err(|err| map_error(err, "C_GetSlotList"))?;

        for slot in slots {
            let info = client
                .get_token_info(slot)
                .map_err(|err| map_error(err, "C_GetTokenInfo"))?;
            if info.label().trim() == token_label {
                info!(
                    "Using PKCS#11 token '{}' in slot {} of module '{}'",
                    token_label,
                    slot.id(),
                    module_path.display()
                );
                return Ok(Self {
                    client,
                    slot,
                    token_label: token_label.to_string(),
                    module_path: module_path.display().to_string(),
                });
            }
        }

        Err(TokenError::new(
            TokenErrorKind::TokenNotPresent,
            "NO_MATCHING_SLOT",
            format!("find token '{token_label}'"),
        ))
    }
}

impl Token for Pkcs11Token {
    fn open_session(&self) -> Result<Box<dyn TokenSession>, TokenError> {
        let session = self
            .client
            .open_rw_session(self.slot)
            .map_err(|err| map_error(err, "C_OpenSession"))?;
        Ok(Box::new(Pkcs11Session {
            session,
            slot: self.slot,
        }))
    }

    fn description(&self) -> String {
        format!("{} ({})", self.token_label, self.module_path)
    }
}

/// Closed by `cryptoki`'s own `Drop`, never logged out: login state is shared
/// by all sessions of the application and `C_Logout` would end it for every
/// pooled sibling.
struct Pkcs11Session {
    session: Session,
    slot: Slot,
}

impl Pkcs11Session {
    fn find_one(&self, template: &[Attribute], context: &str) -> Result<Option<ObjectHandle>, TokenError> {
        let handles = self
            .session
            .find_objects(template)
            .map_err(|err| map_error(err, context))?;
        Ok(handles.into_iter().next())
    }

    fn private_key_handle(&self, key: &KeyRef) -> Result<ObjectHandle, TokenError> {
        self.find_one(&key_template(ObjectClass::PRIVATE_KEY, key), "C_FindObjects")?
            .ok_or_else(|| {
                TokenError::new(
                    TokenErrorKind::ObjectNotFound,
                    "NO_PRIVATE_KEY",
                    format!("find private key {key}"),
                )
            })
    }

    fn read_key_pair(&self, handle: ObjectHandle) -> Result<TokenKeyPair, TokenError> {
        let attrs = self
            .session
            .get_attributes(
                handle,
                &[AttributeType::Label, AttributeType::Id, AttributeType::KeyType],
            )
            .map_err(|err| map_error(err, "C_GetAttributeValue"))?;

        let mut label = String::new();
        let mut id = Vec::new();
        let mut key_type = None;
        for attr in attrs {
            match attr {
                Attribute::Label(bytes) => label = String::from_utf8_lossy(&bytes).into_owned(),
                Attribute::Id(bytes) => id = bytes,
                Attribute::KeyType(kt) => key_type = Some(kt),
                _ => {}
            }
        }

        let public = match key_type {
            Some(kt) if kt == KeyType::RSA => self.read_rsa_public(handle)?,
            Some(kt) if kt == KeyType::EC => self.read_ec_public(handle)?,
            _ => {
                return Err(TokenError::new(
                    TokenErrorKind::Other,
                    "UNSUPPORTED_KEY_TYPE",
                    format!("read key type of '{label}'"),
                ));
            }
        };

        Ok(TokenKeyPair {
            key_ref: KeyRef::new(label, id),
            public,
        })
    }

    fn read_rsa_public(&self, handle: ObjectHandle) -> Result<PublicKeyParts, TokenError> {
        let attrs = self
            .session
            .get_attributes(handle, &[AttributeType::Modulus, AttributeType::PublicExponent])
            .map_err(|err| map_error(err, "C_GetAttributeValue"))?;

        let mut modulus = None;
        let mut exponent = None;
        for attr in attrs {
            match attr {
                Attribute::Modulus(m) => modulus = Some(m),
                Attribute::PublicExponent(e) => exponent = Some(e),
                _ => {}
            }
        }

        match (modulus, exponent) {
            (Some(modulus), Some(exponent)) => Ok(PublicKeyParts::Rsa { modulus, exponent }),
            _ => Err(missing_attribute("CKA_MODULUS/CKA_PUBLIC_EXPONENT")),
        }
    }

    fn read_ec_public(&self, handle: ObjectHandle) -> Result<PublicKeyParts, TokenError> {
        let attrs = self
            .session
            .get_attributes(handle, &[AttributeType::EcParams, AttributeType::EcPoint])
            .map_err(|err| map_error(err, "C_GetAttributeValue"))?;

        let mut params = None;
        let mut point = None;
        for attr in attrs {
            match attr {
                Attribute::EcParams(p) => params = Some(p),
                Attribute::EcPoint(p) => point = Some(p),
                _ => {}
            }
        }

        let (Some(params), Some(point)) = (params, point) else {
            return Err(missing_attribute("CKA_EC_PARAMS/CKA_EC_POINT"));
        };
        let curve = const_oid::ObjectIdentifier::from_der(&params).map_err(|err| {
            TokenError::new(TokenErrorKind::Other, "BAD_EC_PARAMS", err.to_string())
        })?;

        Ok(PublicKeyParts::Ec {
            curve,
            point: unwrap_ec_point(point),
        })
    }

    fn find_certificate(&self, label: &str) -> Result<Option<ObjectHandle>, TokenError> {
        self.find_one(
            &[
                Attribute::Class(ObjectClass::CERTIFICATE),
                Attribute::Label(label.as_bytes().to_vec()),
            ],
            "C_FindObjects",
        )
    }
}

impl TokenSession for Pkcs11Session {
    fn slot_id(&self) -> u64 {
        self.slot.id()
    }

    fn login(&mut self, pin: &SecretString) -> Result<(), TokenError> {
        let pin = AuthPin::new(pin.expose_secret().into());
        self.session
            .login(UserType::User, Some(&pin))
            .map_err(|err| map_error(err, "C_Login"))
    }

    fn ping(&self) -> Result<(), TokenError> {
        self.session
            .get_session_info()
            .map(|_| ())
            .map_err(|err| map_error(err, "C_GetSessionInfo"))
    }

    fn find_key_pair(&self, key: &KeyRef) -> Result<Option<TokenKeyPair>, TokenError> {
        match self.find_one(&key_template(ObjectClass::PUBLIC_KEY, key), "C_FindObjects")? {
            Some(handle) => self.read_key_pair(handle).map(Some),
            None => Ok(None),
        }
    }

    fn list_key_pairs(&self) -> Result<Vec<TokenKeyPair>, TokenError> {
        let handles = self
            .session
            .find_objects(&[Attribute::Class(ObjectClass::PUBLIC_KEY)])
            .map_err(|err| map_error(err, "C_FindObjects"))?;

        let mut pairs = Vec::with_capacity(handles.len());
        for handle in handles {
            match self.read_key_pair(handle) {
                Ok(pair) => pairs.push(pair),
                Err(err) if err.kind == TokenErrorKind::Other => {
                    warn!("Skipping unreadable public key object: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(pairs)
    }

    fn generate_key_pair(
        &mut self,
        key: &KeyRef,
        params: &KeyGenParams,
    ) -> Result<TokenKeyPair, TokenError> {
        let mut pub_template = vec![
            Attribute::Token(true),
            Attribute::Private(false),
            Attribute::Verify(true),
            Attribute::Label(key.label.as_bytes().to_vec()),
            Attribute::Id(key.id.clone()),
        ];
        let priv_template = vec![
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Sign(true),
            Attribute::Label(key.label.as_bytes().to_vec()),
            Attribute::Id(key.id.clone()),
        ];

        let mechanism = match params {
            KeyGenParams::Rsa { bits } => {
                pub_template.push(Attribute::ModulusBits(u64::from(*bits).into()));
                pub_template.push(Attribute::PublicExponent(RSA_PUBLIC_EXPONENT.to_vec()));
                Mechanism::RsaPkcsKeyPairGen
            }
            KeyGenParams::Ec { curve } => {
                let curve_der = curve.to_der().map_err(|err| {
                    TokenError::new(TokenErrorKind::Other, "BAD_EC_PARAMS", err.to_string())
                })?;
                pub_template.push(Attribute::EcParams(curve_der));
                Mechanism::EccKeyPairGen
            }
        };

        let (pub_handle, _priv_handle) = self
            .session
            .generate_key_pair(&mechanism, &pub_template, &priv_template)
            .map_err(|err| map_error(err, "C_GenerateKeyPair"))?;

        self.read_key_pair(pub_handle)
    }

    fn import_key_pair(
        &mut self,
        key: &KeyRef,
        parts: &PrivateKeyParts,
    ) -> Result<TokenKeyPair, TokenError> {
        let mut pub_template = vec![
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::Token(true),
            Attribute::Private(false),
            Attribute::Verify(true),
            Attribute::Label(key.label.as_bytes().to_vec()),
            Attribute::Id(key.id.clone()),
        ];
        let mut priv_template = vec![
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Sign(true),
            Attribute::Label(key.label.as_bytes().to_vec()),
            Attribute::Id(key.id.clone()),
        ];

        match parts {
            PrivateKeyParts::Rsa {
                modulus,
                public_exponent,
                private_exponent,
                prime_1,
                prime_2,
                exponent_1,
                exponent_2,
                coefficient,
            } => {
                pub_template.extend([
                    Attribute::KeyType(KeyType::RSA),
                    Attribute::Modulus(modulus.clone()),
                    Attribute::PublicExponent(public_exponent.clone()),
                ]);
                priv_template.extend([
                    Attribute::KeyType(KeyType::RSA),
                    Attribute::Modulus(modulus.clone()),
                    Attribute::PublicExponent(public_exponent.clone()),
                    Attribute::PrivateExponent(private_exponent.expose_secret().to_vec()),
                    Attribute::Prime1(prime_1.expose_secret().to_vec()),
                    Attribute::Prime2(prime_2.expose_secret().to_vec()),
                    Attribute::Exponent1(exponent_1.expose_secret().to_vec()),
                    Attribute::Exponent2(exponent_2.expose_secret().to_vec()),
                    Attribute::Coefficient(coefficient.expose_secret().to_vec()),
                ]);
            }
            PrivateKeyParts::Ec {
                curve,
                point,
                value,
            } => {
                let bad_params = |err: der::Error| {
                    TokenError::new(TokenErrorKind::Other, "BAD_EC_PARAMS", err.to_string())
                };
                let curve_der = curve.to_der().map_err(bad_params)?;
                let point_der = OctetString::new(point.clone())
                    .and_then(|octets| octets.to_der())
                    .map_err(bad_params)?;
                pub_template.extend([
                    Attribute::KeyType(KeyType::EC),
                    Attribute::EcParams(curve_der.clone()),
                    Attribute::EcPoint(point_der),
                ]);
                priv_template.extend([
                    Attribute::KeyType(KeyType::EC),
                    Attribute::EcParams(curve_der),
                    Attribute::Value(value.expose_secret().to_vec()),
                ]);
            }
        }

        let pub_handle = self
            .session
            .create_object(&pub_template)
            .map_err(|err| map_error(err, "C_CreateObject"))?;
        if let Err(err) = self.session.create_object(&priv_template) {
            if let Err(cleanup) = self.session.destroy_object(pub_handle) {
                warn!("Unable to remove public key {key} after failed import: {cleanup}");
            }
            return Err(map_error(err, "C_CreateObject"));
        }

        self.read_key_pair(pub_handle)
    }

    fn destroy_key_pair(&mut self, key: &KeyRef) -> Result<bool, TokenError> {
        let mut destroyed = false;
        for class in [ObjectClass::PRIVATE_KEY, ObjectClass::PUBLIC_KEY] {
            if let Some(handle) = self.find_one(&key_template(class, key), "C_FindObjects")? {
                self.session
                    .destroy_object(handle)
                    .map_err(|err| map_error(err, "C_DestroyObject"))?;
                destroyed = true;
            }
        }
        Ok(destroyed)
    }

    fn sign(
        &self,
        key: &KeyRef,
        mechanism: SignMechanism,
        data: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        let handle = self.private_key_handle(key)?;
        let mechanism = match mechanism {
            SignMechanism::RsaPkcs => Mechanism::RsaPkcs,
            SignMechanism::RsaPkcsPss { digest, salt_len } => {
                let (hash_alg, mgf) = match digest {
                    DigestAlgorithm::Sha256 => (MechanismType::SHA256, PkcsMgfType::MGF1_SHA256),
                    DigestAlgorithm::Sha384 => (MechanismType::SHA384, PkcsMgfType::MGF1_SHA384),
                    DigestAlgorithm::Sha512 => (MechanismType::SHA512, PkcsMgfType::MGF1_SHA512),
                };
                Mechanism::RsaPkcsPss(PkcsPssParams {
                    hash_alg,
                    mgf,
                    s_len: (salt_len as u64).into(),
                })
            }
            SignMechanism::Ecdsa => Mechanism::Ecdsa,
        };

        self.session
            .sign(&mechanism, handle, data)
            .map_err(|err| map_error(err, "C_Sign"))
    }

    fn import_certificate(&mut self, label: &str, der: &[u8]) -> Result<(), TokenError> {
        let cert = x509_cert::Certificate::from_der(der).map_err(|err| {
            TokenError::new(TokenErrorKind::Other, "BAD_CERTIFICATE", err.to_string())
        })?;
        let subject = cert.tbs_certificate.subject.to_der().map_err(|err| {
            TokenError::new(TokenErrorKind::Other, "BAD_CERTIFICATE", err.to_string())
        })?;

        self.session
            .create_object(&[
                Attribute::Class(ObjectClass::CERTIFICATE),
                Attribute::CertificateType(CertificateType::X_509),
                Attribute::Token(true),
                Attribute::Label(label.as_bytes().to_vec()),
                Attribute::Subject(subject),
                Attribute::Value(der.to_vec()),
            ])
            .map(|_| ())
            .map_err(|err| map_error(err, "C_CreateObject"))
    }

    fn export_certificate(&self, label: &str) -> Result<Option<Vec<u8>>, TokenError> {
        let Some(handle) = self.find_certificate(label)? else {
            return Ok(None);
        };
        let attrs = self
            .session
            .get_attributes(handle, &[AttributeType::Value])
            .map_err(|err| map_error(err, "C_GetAttributeValue"))?;
        for attr in attrs {
            if let Attribute::Value(value) = attr {
                return Ok(Some(value));
            }
        }
        Err(missing_attribute("CKA_VALUE"))
    }

    fn delete_certificate(&mut self, label: &str) -> Result<bool, TokenError> {
        match self.find_certificate(label)? {
            Some(handle) => {
                self.session
                    .destroy_object(handle)
                    .map_err(|err| map_error(err, "C_DestroyObject"))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn key_template(class: ObjectClass, key: &KeyRef) -> Vec<Attribute> {
    let mut template = vec![
        Attribute::Class(class),
        Attribute::Label(key.label.as_bytes().to_vec()),
    ];
    if !key.id.is_empty() {
        template.push(Attribute::Id(key.id.clone()));
    }
    template
}

/// `CKA_EC_POINT` is a DER OCTET STRING wrapping the SEC1 point, though some
/// modules return the bare point.
fn unwrap_ec_point(raw: Vec<u8>) -> Vec<u8> {
    match OctetString::from_der(&raw) {
        Ok(octets) if octets.as_bytes().first() == Some(&0x04) => octets.into_bytes(),
        _ => raw,
    }
}

fn missing_attribute(name: &str) -> TokenError {
    TokenError::new(
        TokenErrorKind::Other,
        "ATTRIBUTE_MISSING",
        format!("read {name}"),
    )
}

/// Translates a `cryptoki` error into the crate's closed error set.
fn map_error(err: CryptokiError, context: &str) -> TokenError {
    match err {
        CryptokiError::Pkcs11(rv, _) => TokenError::new(classify(rv), format!("{rv:?}"), context),
        CryptokiError::LibraryLoading(err) => TokenError::new(
            TokenErrorKind::LibraryUnavailable,
            "LIBRARY_LOADING",
            format!("{context}: {err}"),
        ),
        other => TokenError::new(TokenErrorKind::Other, "DRIVER", format!("{context}: {other}")),
    }
}

fn classify(rv: RvError) -> TokenErrorKind {
    match rv {
        RvError::SessionHandleInvalid | RvError::SessionClosed => TokenErrorKind::SessionInvalid,
        RvError::DeviceRemoved => TokenErrorKind::DeviceRemoved,
        RvError::TokenNotPresent | RvError::TokenNotRecognized => TokenErrorKind::TokenNotPresent,
        RvError::PinIncorrect
        | RvError::PinInvalid
        | RvError::PinLenRange
        | RvError::PinExpired
        | RvError::PinLocked => TokenErrorKind::PinRejected,
        RvError::UserAlreadyLoggedIn => TokenErrorKind::AlreadyLoggedIn,
        RvError::CryptokiNotInitialized | RvError::GeneralError => TokenErrorKind::LibraryUnavailable,
        RvError::MechanismInvalid | RvError::MechanismParamInvalid => {
            TokenErrorKind::MechanismInvalid
        }
        RvError::KeyFunctionNotPermitted | RvError::KeyTypeInconsistent => {
            TokenErrorKind::KeyNotPermitted
        }
        RvError::DataLenRange | RvError::DataInvalid => TokenErrorKind::DataTooLarge,
        RvError::ObjectHandleInvalid | RvError::KeyHandleInvalid => TokenErrorKind::ObjectNotFound,
        _ => TokenErrorKind::Other,
    }
}

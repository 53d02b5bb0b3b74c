//! Assembles, signs and finalizes certificates, CSRs and CRLs.
//!
//! Every object goes through the same stages:
//!
//! ```text
//! AssembleTbs -> Serialize -> Sign -> AssembleFinal -> Done
//!        \___________\__________\__________\_______-> Failed
//! ```
//!
//! All input validation happens in `AssembleTbs`, before any token call.
//! A [`CancelToken`] is honoured up to the `Sign` boundary. Once the token
//! has been asked to sign, the operation runs to completion. A failure in
//! any stage returns an error and never a partial object.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use der::Encode;
use der::asn1::BitString;
use log::{debug, info, trace, warn};
use x509_cert::certificate::CertificateInner;
use x509_cert::crl::CertificateList;
use x509_cert::request::CertReq;
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::cert::extensions::{
    AuthorityKeyIdentifier, BasicConstraints, CrlDistributionPoints, CrlNumber, ExtendedKeyUsage,
    KeyUsage, KeyUsages, SubjectAltName, SubjectKeyIdentifier, ToAndFromX509Extension,
};
use crate::cert::params::{CertificateParams, CrlParams, CsrParams, ExtensionParam, find_extension};
use crate::cert::{Certificate, CertificateRequest, RevocationList};
use crate::config::{Config, IssuanceConfig};
use crate::crl::TbsCrl;
use crate::csr::CertificationRequestInfo;
use crate::error::{HsmCertError, Result};
use crate::issuer::{CaIssuer, Issuer, SelfIssuer, key_identifier};
use crate::key::{KeyAlgorithm, KeyPair, KeyRegistry, KeySpec};
use crate::serial::{self, SerialAllocator};
use crate::session::SessionManager;
use crate::signer::{TokenSigner, check_algorithm_identifier};
use crate::store::CertificateStore;
use crate::tbs_certificate::TbsCertificate;
use crate::token::KeyRef;

/// Where an issuance currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IssuanceStage {
    AssembleTbs,
    Serialize,
    Sign,
    AssembleFinal,
    Done,
    Failed,
}

impl fmt::Display for IssuanceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Cooperative cancellation shared between a caller and an issuance.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Issuance<'a> {
    object: &'static str,
    stage: IssuanceStage,
    cancel: Option<&'a CancelToken>,
}

impl<'a> Issuance<'a> {
    fn start(object: &'static str, cancel: Option<&'a CancelToken>) -> Self {
        Self {
            object,
            stage: IssuanceStage::AssembleTbs,
            cancel,
        }
    }

    fn check_cancelled(&self, next: IssuanceStage) -> Result<()> {
        if next <= IssuanceStage::Sign && self.cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(HsmCertError::Cancelled(next.to_string()));
        }
        Ok(())
    }

    fn advance(&mut self, next: IssuanceStage) -> Result<()> {
        self.check_cancelled(next)?;
        trace!("{} issuance: {} -> {next}", self.object, self.stage);
        self.stage = next;
        Ok(())
    }

    fn run<T>(mut self, assemble: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = self
            .check_cancelled(IssuanceStage::AssembleTbs)
            .and_then(|()| assemble(&mut self));
        match result {
            Ok(object) => {
                trace!("{} issuance: {} -> {}", self.object, self.stage, IssuanceStage::Done);
                self.stage = IssuanceStage::Done;
                Ok(object)
            }
            Err(err) => {
                warn!(
                    "{} issuance failed in {} ({:?} stage): {err}",
                    self.object,
                    self.stage,
                    err.stage()
                );
                self.stage = IssuanceStage::Failed;
                Err(err)
            }
        }
    }
}

/// Issues certificates, CSRs and CRLs with keys held in the token.
pub struct CertificateAuthority {
    sessions: Arc<SessionManager>,
    keys: KeyRegistry,
    store: CertificateStore,
    serials: SerialAllocator,
    config: IssuanceConfig,
}

impl CertificateAuthority {
    pub fn new(sessions: Arc<SessionManager>, config: IssuanceConfig) -> Self {
        Self {
            keys: KeyRegistry::new(sessions.clone()),
            store: CertificateStore::new(sessions.clone()),
            serials: SerialAllocator::new(),
            sessions,
            config,
        }
    }

    /// Loads the PKCS#11 module named in `config` and logs in.
    pub fn open(config: Config) -> Result<Self> {
        let sessions = Arc::new(SessionManager::open(config.token)?);
        Ok(Self::new(sessions, config.issuance))
    }

    pub fn keys(&self) -> &KeyRegistry {
        &self.keys
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn config(&self) -> &IssuanceConfig {
        &self.config
    }

    /// A signer for `key` following the configured padding, digest and verification policy.
    pub fn signer(&self, key: KeyPair) -> TokenSigner {
        TokenSigner::new(
            self.sessions.clone(),
            key,
            self.config.rsa_padding,
            self.config.digest,
        )
        .verify_signatures(self.config.verify_signatures)
    }

    /// Pairs a CA certificate with its key in the token.
    pub fn ca_issuer(&self, certificate: Certificate, key: &KeyRef) -> Result<CaIssuer> {
        let key = self.keys.require(key)?;
        CaIssuer::new(certificate, self.signer(key))
    }

    /// Creates the key if it does not exist yet, then issues a self-signed CA certificate.
    ///
    /// An existing key is reused only when its algorithm matches `spec`.
    pub fn create_root_ca(
        &self,
        key: &KeyRef,
        spec: &KeySpec,
        params: &CertificateParams,
    ) -> Result<Certificate> {
        let algorithm = KeyAlgorithm::try_from(spec)?;
        if !params.is_ca {
            return Err(HsmCertError::ExtensionConsistencyError(
                "a root CA certificate must be a CA certificate".to_string(),
            ));
        }
        params.validity.check(serial::now(), self.config.clock_skew())?;
        profile_extensions(params)?;

        let pair = match self.keys.find(key)? {
            Some(pair) => {
                debug!("Root CA key {} already exists, reusing it", pair.key_ref);
                pair
            }
            None => match self.keys.generate(key, spec) {
                Ok(pair) => pair,
                Err(HsmCertError::KeyExistsError(_)) => self.keys.require(key)?,
                Err(err) => return Err(err),
            },
        };
        if pair.algorithm != algorithm {
            return Err(HsmCertError::KeyExistsError(format!(
                "{} holds a {} key, requested {algorithm}",
                pair.key_ref, pair.algorithm
            )));
        }

        self.issue_self_signed(&pair, params, None)
    }

    pub fn issue_self_signed(
        &self,
        key: &KeyPair,
        params: &CertificateParams,
        cancel: Option<&CancelToken>,
    ) -> Result<Certificate> {
        let issuer = SelfIssuer::new(&params.subject, self.signer(key.clone()))?;
        self.issue(&issuer, &key.public_key, params, cancel)
    }

    /// Issues a certificate for `subject_public_key` signed by a CA.
    pub fn issue_certificate(
        &self,
        issuer: &CaIssuer,
        subject_public_key: &SubjectPublicKeyInfoOwned,
        params: &CertificateParams,
        cancel: Option<&CancelToken>,
    ) -> Result<Certificate> {
        issuer.require_key_usage(KeyUsages::KeyCertSign)?;
        self.issue(issuer, subject_public_key, params, cancel)
    }

    /// Verifies a CSR and issues a certificate for its public key.
    ///
    /// Extensions requested in the CSR are carried over unless `params`
    /// already produces an extension with the same OID.
    pub fn sign_csr(
        &self,
        issuer: &CaIssuer,
        csr: &CertificateRequest,
        params: &CertificateParams,
        cancel: Option<&CancelToken>,
    ) -> Result<Certificate> {
        csr.verify()
            .map_err(|e| HsmCertError::InvalidInput(format!("CSR signature does not verify: {e}")))?;

        let mut produced: HashSet<_> = profile_extensions(params)?
            .iter()
            .map(|ext| ext.oid)
            .collect();
        produced.insert(SubjectKeyIdentifier::OID);
        produced.insert(AuthorityKeyIdentifier::OID);

        let mut params = params.clone();
        for requested in csr.requested_extensions()? {
            if produced.insert(requested.oid) {
                params.extensions.push(requested);
            } else {
                debug!("Replacing requested extension {} with the issuer's", requested.oid);
            }
        }

        self.issue_certificate(issuer, csr.public_key(), &params, cancel)
    }

    /// Creates a PKCS#10 request signed by a token key.
    pub fn create_csr(
        &self,
        key: &KeyRef,
        params: &CsrParams,
        cancel: Option<&CancelToken>,
    ) -> Result<CertificateRequest> {
        Issuance::start("CSR", cancel).run(|issuance| {
            let subject = params.subject.as_x509_name()?;
            let mut extensions = Vec::new();
            if !params.dns_names.is_empty() {
                extensions.push(ExtensionParam::from_extension(
                    &SubjectAltName {
                        names: params.dns_names.clone(),
                    },
                    false,
                )?);
            }
            if !params.usages.is_empty() {
                extensions.push(ExtensionParam::from_extension(
                    &ExtendedKeyUsage {
                        usage: params.usages.clone(),
                    },
                    false,
                )?);
            }
            extensions.extend(params.extensions.iter().cloned());
            reject_duplicates(&extensions)?;

            let signer = self.signer(self.keys.require(key)?);
            let info = CertificationRequestInfo {
                subject,
                public_key: signer.key().public_key.clone(),
                extensions,
            }
            .to_inner()?;

            issuance.advance(IssuanceStage::Serialize)?;
            let info_der = info.to_der()?;

            issuance.advance(IssuanceStage::Sign)?;
            let signature = signer.sign(&info_der)?;

            issuance.advance(IssuanceStage::AssembleFinal)?;
            let request = CertificateRequest {
                inner: CertReq {
                    info,
                    algorithm: signature.algorithm.algorithm_identifier()?,
                    signature: BitString::from_bytes(&signature.bytes)?,
                },
            };
            request.to_der()?;
            info!("Created CSR for '{}' with {}", params.subject.common_name, key);
            Ok(request)
        })
    }

    /// Creates a CRL signed by a CA.
    pub fn create_crl(
        &self,
        issuer: &CaIssuer,
        params: &CrlParams,
        cancel: Option<&CancelToken>,
    ) -> Result<RevocationList> {
        Issuance::start("CRL", cancel).run(|issuance| {
            issuer.require_key_usage(KeyUsages::CRLSign)?;
            let extensions = vec![
                ExtensionParam::from_extension(
                    &AuthorityKeyIdentifier::from_key_identifier(
                        issuer.authority_key_identifier().to_vec(),
                    ),
                    false,
                )?,
                ExtensionParam::from_extension(&CrlNumber(params.effective_crl_number()), false)?,
            ];
            let signer = issuer.signer();
            let tbs = TbsCrl::new(
                signer.signature_algorithm(),
                issuer.issuer_name().clone(),
                params.this_update,
                params.next_update,
                &params.entries,
                extensions,
            )?
            .to_inner()?;

            issuance.advance(IssuanceStage::Serialize)?;
            let tbs_der = tbs.to_der()?;

            issuance.advance(IssuanceStage::Sign)?;
            let signature = signer.sign(&tbs_der)?;

            issuance.advance(IssuanceStage::AssembleFinal)?;
            check_algorithm_identifier(&tbs.signature, signature.algorithm)?;
            let crl = RevocationList {
                inner: CertificateList {
                    tbs_cert_list: tbs,
                    signature_algorithm: signature.algorithm.algorithm_identifier()?,
                    signature: BitString::from_bytes(&signature.bytes)?,
                },
            };
            crl.to_der()?;
            info!(
                "Created CRL number {} with {} entries",
                params.effective_crl_number(),
                params.entries.len()
            );
            Ok(crl)
        })
    }

    fn issue<I: Issuer>(
        &self,
        issuer: &I,
        subject_public_key: &SubjectPublicKeyInfoOwned,
        params: &CertificateParams,
        cancel: Option<&CancelToken>,
    ) -> Result<Certificate> {
        Issuance::start("certificate", cancel).run(|issuance| {
            params.validity.check(serial::now(), self.config.clock_skew())?;
            let mut extensions = profile_extensions(params)?;
            extensions.push(ExtensionParam::from_extension(
                &SubjectKeyIdentifier(key_identifier(subject_public_key)),
                false,
            )?);
            extensions.push(ExtensionParam::from_extension(
                &AuthorityKeyIdentifier::from_key_identifier(
                    issuer.authority_key_identifier().to_vec(),
                ),
                false,
            )?);
            reject_duplicates(&extensions)?;

            let signer = issuer.signer();
            let tbs = TbsCertificate {
                serial_number: self.serials.next_serial()?,
                signature_algorithm: signer.signature_algorithm(),
                issuer: issuer.issuer_name().clone(),
                validity: params.validity,
                subject: params.subject.as_x509_name()?,
                subject_public_key: subject_public_key.clone(),
                extensions,
            }
            .to_tbs_certificate_inner()?;

            issuance.advance(IssuanceStage::Serialize)?;
            let tbs_der = tbs.to_der()?;

            issuance.advance(IssuanceStage::Sign)?;
            let signature = signer.sign(&tbs_der)?;

            issuance.advance(IssuanceStage::AssembleFinal)?;
            check_algorithm_identifier(&tbs.signature, signature.algorithm)?;
            let certificate = Certificate {
                inner: CertificateInner {
                    tbs_certificate: tbs,
                    signature_algorithm: signature.algorithm.algorithm_identifier()?,
                    signature: BitString::from_bytes(&signature.bytes)?,
                },
            };
            certificate.to_der()?;
            info!(
                "Issued {} certificate for '{}', serial {}",
                if params.is_ca { "CA" } else { "end-entity" },
                params.subject.common_name,
                hex::encode(certificate.serial_number())
            );
            Ok(certificate)
        })
    }
}

/// Extensions derived from the certificate profile plus the caller's own,
/// checked for consistency.
fn profile_extensions(params: &CertificateParams) -> Result<Vec<ExtensionParam>> {
    if !params.is_ca && params.path_len.is_some() {
        return Err(HsmCertError::ExtensionConsistencyError(
            "path length constraint on an end-entity certificate".to_string(),
        ));
    }

    let mut extensions = vec![
        ExtensionParam::from_extension(
            &BasicConstraints {
                is_ca: params.is_ca,
                max_path_length: params.path_len,
            },
            true,
        )?,
        ExtensionParam::from_extension(&KeyUsage(params.effective_key_usage()), true)?,
    ];
    if !params.dns_names.is_empty() {
        extensions.push(ExtensionParam::from_extension(
            &SubjectAltName {
                names: params.dns_names.clone(),
            },
            false,
        )?);
    }
    if !params.usages.is_empty() {
        extensions.push(ExtensionParam::from_extension(
            &ExtendedKeyUsage {
                usage: params.usages.clone(),
            },
            false,
        )?);
    }
    if !params.crl_distribution_points.is_empty() {
        extensions.push(ExtensionParam::from_extension(
            &CrlDistributionPoints {
                uris: params.crl_distribution_points.clone(),
            },
            false,
        )?);
    }
    extensions.extend(params.extensions.iter().cloned());

    check_extensions(&extensions, params.is_ca)?;
    Ok(extensions)
}

/// Checks that a certificate's extensions agree with its profile.
///
/// A CA certificate needs `basicConstraints CA=true` and `keyCertSign`. An
/// end-entity certificate may have neither, nor a path length constraint.
/// No extension may appear twice.
pub fn check_extensions(extensions: &[ExtensionParam], is_ca: bool) -> Result<()> {
    reject_duplicates(extensions)?;

    let malformed = |e: HsmCertError| {
        HsmCertError::ExtensionConsistencyError(format!("malformed extension: {e}"))
    };
    let basic_constraints = find_extension::<BasicConstraints>(extensions).map_err(malformed)?;
    let key_usage = find_extension::<KeyUsage>(extensions).map_err(malformed)?;
    let cert_sign = key_usage.is_some_and(|ku| ku.0.contains(KeyUsages::KeyCertSign));

    let problem = if is_ca {
        if !basic_constraints.is_some_and(|bc| bc.is_ca) {
            Some("a CA certificate requires basicConstraints CA=true")
        } else if !cert_sign {
            Some("a CA certificate requires keyUsage keyCertSign")
        } else {
            None
        }
    } else if basic_constraints.is_some_and(|bc| bc.is_ca) {
        Some("an end-entity certificate must not assert CA=true")
    } else if basic_constraints.is_some_and(|bc| bc.max_path_length.is_some()) {
        Some("an end-entity certificate must not carry a path length constraint")
    } else if cert_sign {
        Some("an end-entity certificate must not have keyUsage keyCertSign")
    } else {
        None
    };

    match problem {
        Some(problem) => Err(HsmCertError::ExtensionConsistencyError(problem.to_string())),
        None => Ok(()),
    }
}

fn reject_duplicates(extensions: &[ExtensionParam]) -> Result<()> {
    let mut seen = HashSet::new();
    for ext in extensions {
        if !seen.insert(ext.oid) {
            return Err(HsmCertError::ExtensionConsistencyError(format!(
                "extension {} appears more than once",
                ext.oid
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::params::{DistinguishedName, Validity};
    use crate::config::TokenConfig;
    use crate::error::ErrorStage;
    use crate::token::soft::{FnIdx, SoftToken};
    use time::Duration;

    fn authority(token: &SoftToken) -> CertificateAuthority {
        let config = TokenConfig::builder()
            .module_path("/dev/null")
            .token_label("test")
            .pin("1234")
            .session_timeout_secs(1)
            .build();
        let sessions = Arc::new(SessionManager::new(Arc::new(token.clone()), config).unwrap());
        CertificateAuthority::new(sessions, IssuanceConfig::default())
    }

    fn root_params() -> CertificateParams {
        CertificateParams::builder()
            .subject(DistinguishedName::builder().common_name("root").build())
            .validity(Validity::for_days(3650))
            .is_ca(true)
            .build()
    }

    fn leaf_params() -> CertificateParams {
        CertificateParams::builder()
            .subject(DistinguishedName::builder().common_name("leaf").build())
            .validity(Validity::for_days(90))
            .build()
    }

    #[test]
    fn test_check_extensions() {
        let ca = profile_extensions(&root_params()).unwrap();
        assert!(check_extensions(&ca, true).is_ok());
        assert!(matches!(
            check_extensions(&ca, false),
            Err(HsmCertError::ExtensionConsistencyError(_))
        ));

        let leaf = profile_extensions(&leaf_params()).unwrap();
        assert!(check_extensions(&leaf, false).is_ok());
        assert!(check_extensions(&leaf, true).is_err());
    }

    #[test]
    fn test_ca_without_key_cert_sign_is_rejected() {
        let params = CertificateParams {
            key_usage: Some(KeyUsages::CRLSign.into()),
            ..root_params()
        };
        assert!(matches!(
            profile_extensions(&params),
            Err(HsmCertError::ExtensionConsistencyError(_))
        ));
    }

    #[test]
    fn test_end_entity_path_length_is_rejected() {
        let params = CertificateParams {
            path_len: Some(0),
            ..leaf_params()
        };
        assert!(matches!(
            profile_extensions(&params),
            Err(HsmCertError::ExtensionConsistencyError(_))
        ));
    }

    #[test]
    fn test_duplicate_extension_is_rejected() {
        let extra = ExtensionParam::from_extension(&BasicConstraints::default(), false).unwrap();
        let params = CertificateParams {
            extensions: vec![extra],
            ..leaf_params()
        };
        assert!(matches!(
            profile_extensions(&params),
            Err(HsmCertError::ExtensionConsistencyError(_))
        ));
    }

    #[test]
    fn test_inconsistent_request_makes_no_token_call() {
        let token = SoftToken::new("test", "1234");
        let ca = authority(&token);
        let key = ca
            .keys()
            .generate(&KeyRef::labelled("root"), &KeySpec::ec("secp256r1"))
            .unwrap();

        let params = CertificateParams {
            key_usage: Some(KeyUsages::KeyCertSign.into()),
            ..leaf_params()
        };
        let err = ca.issue_self_signed(&key, &params, None).unwrap_err();
        assert!(matches!(err, HsmCertError::ExtensionConsistencyError(_)));
        assert_eq!(err.stage(), ErrorStage::Validation);
        assert_eq!(token.call_counts().get(FnIdx::Sign), 0);
    }

    #[test]
    fn test_validity_outside_now_is_rejected() {
        let token = SoftToken::new("test", "1234");
        let ca = authority(&token);
        let key = ca
            .keys()
            .generate(&KeyRef::labelled("root"), &KeySpec::ec("secp256r1"))
            .unwrap();

        let now = serial::now();
        let params = CertificateParams {
            validity: Validity::new(now + Duration::days(1), now + Duration::days(2)),
            ..root_params()
        };
        assert!(matches!(
            ca.issue_self_signed(&key, &params, None),
            Err(HsmCertError::InvalidInput(_))
        ));
        assert_eq!(token.call_counts().get(FnIdx::Sign), 0);
    }

    #[test]
    fn test_cancelled_before_sign() {
        let token = SoftToken::new("test", "1234");
        let ca = authority(&token);
        let key = ca
            .keys()
            .generate(&KeyRef::labelled("root"), &KeySpec::ec("secp384r1"))
            .unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = ca
            .issue_self_signed(&key, &root_params(), Some(&cancel))
            .unwrap_err();
        assert!(matches!(err, HsmCertError::Cancelled(_)));
        assert_eq!(token.call_counts().get(FnIdx::Sign), 0);
    }

    #[test]
    fn test_self_signed_aki_equals_ski() {
        let token = SoftToken::new("test", "1234");
        let ca = authority(&token);
        let key = ca
            .keys()
            .generate(&KeyRef::labelled("root"), &KeySpec::ec("secp256r1"))
            .unwrap();

        let cert = ca.issue_self_signed(&key, &root_params(), None).unwrap();
        let ski = cert.subject_key_identifier().unwrap().unwrap();
        assert_eq!(cert.authority_key_identifier().unwrap(), Some(ski.clone()));
        assert_eq!(ski, key.key_identifier());
        assert_eq!(cert.issuer(), cert.subject());
        cert.verify_signed_by(&key.public_key).unwrap();
    }

    #[test]
    fn test_signing_failure_returns_nothing() {
        let token = SoftToken::new("test", "1234");
        let ca = authority(&token);
        let key = ca
            .keys()
            .generate(&KeyRef::labelled("root"), &KeySpec::ec("secp256r1"))
            .unwrap();

        token.fail_next_sign(
            crate::token::TokenErrorKind::KeyNotPermitted,
            "CKR_KEY_FUNCTION_NOT_PERMITTED",
        );
        let err = ca.issue_self_signed(&key, &root_params(), None).unwrap_err();
        assert!(matches!(err, HsmCertError::SigningError(_)));
        assert_eq!(err.stage(), ErrorStage::Token);
        assert_eq!(
            err.token_error().map(|e| e.code.as_str()),
            Some("CKR_KEY_FUNCTION_NOT_PERMITTED")
        );
    }
}

#![allow(dead_code)]

use std::sync::Arc;

use der::Decode;
use p256::pkcs8::EncodePublicKey;
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use hsmcert::CertificateAuthority;
use hsmcert::cert::Certificate;
use hsmcert::cert::extensions::ExtendedKeyUsageOption;
use hsmcert::cert::params::{CertificateParams, DistinguishedName, Validity};
use hsmcert::config::{IssuanceConfig, TokenConfig};
use hsmcert::issuer::CaIssuer;
use hsmcert::key::KeySpec;
use hsmcert::session::SessionManager;
use hsmcert::token::KeyRef;
use hsmcert::token::soft::SoftToken;

pub const PIN: &str = "1234";

pub fn token_config() -> TokenConfig {
    TokenConfig::builder()
        .module_path("/dev/null")
        .token_label("hsmcert-test")
        .pin(PIN)
        .session_timeout_secs(2)
        .build()
}

pub fn soft_authority() -> (SoftToken, CertificateAuthority) {
    authority_with(token_config(), IssuanceConfig::default())
}

pub fn authority_with(
    token_config: TokenConfig,
    issuance: IssuanceConfig,
) -> (SoftToken, CertificateAuthority) {
    let token = SoftToken::new("hsmcert-test", PIN);
    let sessions = SessionManager::new(Arc::new(token.clone()), token_config).unwrap();
    (token, CertificateAuthority::new(Arc::new(sessions), issuance))
}

pub fn root_params(common_name: &str, days: i64) -> CertificateParams {
    CertificateParams::builder()
        .subject(
            DistinguishedName::builder()
                .common_name(common_name)
                .organization("hsmcert")
                .country("US")
                .build(),
        )
        .validity(Validity::for_days(days))
        .is_ca(true)
        .build()
}

pub fn server_params(common_name: &str, days: i64) -> CertificateParams {
    CertificateParams::builder()
        .subject(DistinguishedName::builder().common_name(common_name).build())
        .validity(Validity::for_days(days))
        .dns_names(vec![common_name.to_string()])
        .usages(vec![ExtendedKeyUsageOption::ServerAuth])
        .build()
}

/// Creates a root CA in the token and returns its certificate with an issuer for it.
pub fn root_ca(ca: &CertificateAuthority, label: &str, spec: KeySpec) -> (Certificate, CaIssuer) {
    let key = KeyRef::labelled(label);
    let cert = ca
        .create_root_ca(&key, &spec, &root_params(label, 3650))
        .unwrap();
    let issuer = ca.ca_issuer(cert.clone(), &key).unwrap();
    (cert, issuer)
}

/// A software P-256 public key standing in for a key held by a certificate subject.
pub fn subject_public_key() -> SubjectPublicKeyInfoOwned {
    let secret = p256::SecretKey::random(&mut rand_core::OsRng);
    let der = secret.public_key().to_public_key_der().unwrap();
    SubjectPublicKeyInfoOwned::from_der(der.as_bytes()).unwrap()
}

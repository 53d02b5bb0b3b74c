//! Issues a root CA, a server certificate and a CRL.
//!
//! Uses the PKCS#11 module named by `PKCS11_MODULE`, `PKCS11_TOKEN` and
//! `PKCS11_PIN` when they are set, and an in-memory token otherwise.
//!
//! ```sh
//! PKCS11_MODULE=/usr/lib/softhsm/libsofthsm2.so PKCS11_TOKEN=demo PKCS11_PIN=1234 \
//!     cargo run --example issue
//! ```

use std::sync::Arc;

use log::{LevelFilter, info};
use time::Duration;

use hsmcert::cert::extensions::ExtendedKeyUsageOption;
use hsmcert::cert::params::{
    CertificateParams, CrlParams, CsrParams, DistinguishedName, RevokedEntry, Validity,
};
use hsmcert::config::{ENV_MODULE, IssuanceConfig, TokenConfig};
use hsmcert::key::KeySpec;
use hsmcert::session::SessionManager;
use hsmcert::token::KeyRef;
use hsmcert::token::soft::SoftToken;
use hsmcert::{CertificateAuthority, HsmCertError, serial};

fn init_logging() -> Result<(), log::SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] [{}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::Info)
        .level_for("hsmcert", LevelFilter::Debug)
        .chain(std::io::stderr())
        .apply()
}

fn authority() -> Result<CertificateAuthority, HsmCertError> {
    if std::env::var(ENV_MODULE).is_ok() {
        let sessions = SessionManager::open(TokenConfig::from_env()?)?;
        return Ok(CertificateAuthority::new(Arc::new(sessions), IssuanceConfig::default()));
    }

    info!("{ENV_MODULE} is not set, using an in-memory token");
    let config = TokenConfig::builder()
        .module_path("/dev/null")
        .token_label("demo")
        .pin("1234")
        .build();
    let sessions = SessionManager::new(Arc::new(SoftToken::new("demo", "1234")), config)?;
    Ok(CertificateAuthority::new(Arc::new(sessions), IssuanceConfig::default()))
}

fn main() -> Result<(), HsmCertError> {
    if let Err(e) = init_logging() {
        eprintln!("Cannot initialize logging: {e}");
    }
    let ca = authority()?;

    let root_key = KeyRef::labelled("demo-root");
    let root = ca.create_root_ca(
        &root_key,
        &KeySpec::ec("p-384"),
        &CertificateParams::builder()
            .subject(
                DistinguishedName::builder()
                    .common_name("Demo Root CA")
                    .organization("hsmcert")
                    .country("US")
                    .build(),
            )
            .validity(Validity::for_days(3650))
            .is_ca(true)
            .path_len(1)
            .build(),
    )?;
    println!("{}", root.to_pem()?);
    let root_issuer = ca.ca_issuer(root, &root_key)?;

    let server_key = KeyRef::labelled("demo-server");
    if ca.keys().find(&server_key)?.is_none() {
        ca.keys().generate(&server_key, &KeySpec::rsa(2048))?;
    }
    let csr = ca.create_csr(
        &server_key,
        &CsrParams::builder()
            .subject(DistinguishedName::builder().common_name("www.example.com").build())
            .dns_names(vec!["www.example.com".to_string(), "example.com".to_string()])
            .build(),
        None,
    )?;
    println!("{}", csr.to_pem()?);

    let server = ca.sign_csr(
        &root_issuer,
        &csr,
        &CertificateParams::builder()
            .subject(csr.subject())
            .validity(Validity::for_days(90))
            .usages(vec![ExtendedKeyUsageOption::ServerAuth])
            .build(),
        None,
    )?;
    println!("{}", server.to_pem()?);

    let now = serial::now();
    let crl = ca.create_crl(
        &root_issuer,
        &CrlParams::builder()
            .this_update(now)
            .next_update(now + Duration::days(7))
            .entries(vec![RevokedEntry::new(server.serial_number(), now)])
            .build(),
        None,
    )?;
    println!("{}", crl.to_pem()?);

    Ok(())
}

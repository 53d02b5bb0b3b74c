//! # hsmcert - X.509 Issuance With Keys Held in a PKCS#11 Token
//!
//! hsmcert issues X.509 certificates, PKCS#10 certificate signing requests
//! and certificate revocation lists whose private keys never leave a
//! hardware security module. Every structure is assembled and encoded in
//! Rust with the RustCrypto `x509-cert` stack; only the raw signature is
//! produced by the token.
//!
//! ## Supported Key Types
//!
//! - **RSA**: 2048, 3072 and 4096-bit keys, signed with PKCS#1 v1.5 or PSS
//! - **ECDSA**: P-256, P-384 and P-521 curves
//!
//! ## Key Features
//!
//! - **Pooled Sessions**: a bounded session pool that retries an operation
//!   once on a fresh session when the token drops the old one
//! - **Staged Issuance**: every object is assembled, serialized, signed and
//!   finalized in order; a failure never yields a partial object
//! - **Consistent Extensions**: CA and end-entity profiles are checked
//!   before the token is asked to sign anything
//! - **Certificate Objects**: certificates can be stored in the token next
//!   to their keys
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hsmcert::{
//!     builder::CertificateAuthority,
//!     cert::params::{CertificateParams, DistinguishedName, Validity},
//!     config::Config,
//!     key::KeySpec,
//!     token::KeyRef,
//! };
//!
//! # fn main() -> Result<(), hsmcert::error::HsmCertError> {
//! let config = Config::from_file("hsmcert.toml".as_ref())?;
//! let ca = CertificateAuthority::open(config)?;
//!
//! let params = CertificateParams::builder()
//!     .subject(
//!         DistinguishedName::builder()
//!             .common_name("Example Root CA")
//!             .organization("Example Corp")
//!             .country("US")
//!             .build(),
//!     )
//!     .validity(Validity::for_days(3650))
//!     .is_ca(true)
//!     .build();
//!
//! let root = ca.create_root_ca(&KeyRef::labelled("root-ca"), &KeySpec::rsa(3072), &params)?;
//! println!("{}", root.to_pem()?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Every error reports the [`error::ErrorStage`] it belongs to, so callers
//! can tell bad input from token failures:
//!
//! ```rust
//! use hsmcert::error::{ErrorStage, HsmCertError};
//!
//! fn describe(err: &HsmCertError) -> &'static str {
//!     match err.stage() {
//!         ErrorStage::Validation => "rejected before any token call",
//!         ErrorStage::Token => "the token failed",
//!         ErrorStage::Assembly => "the signed object could not be assembled",
//!     }
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`config`]: TOML and environment configuration
//! - [`token`]: PKCS#11 access behind the [`token::Token`] trait, plus an in-memory token
//! - [`session`]: the session pool and its retry policy
//! - [`key`]: key specifications and the key registry
//! - [`signer`]: signature mechanisms and signature encoding
//! - [`serial`]: serial numbers and X.509 time
//! - [`cert`]: certificates, CSRs, CRLs and their extensions
//! - [`tbs_certificate`], [`csr`], [`crl`]: the to-be-signed structures
//! - [`issuer`]: what a certificate or CRL is issued by
//! - [`builder`]: the issuance pipeline and the [`builder::CertificateAuthority`] facade
//! - [`store`]: certificate objects in the token
//! - [`error`]: error types

pub mod builder;
pub mod cert;
pub mod config;
pub mod crl;
pub mod csr;
pub mod error;
pub mod issuer;
pub mod key;
pub mod serial;
pub mod session;
pub mod signer;
pub mod store;
pub mod tbs_certificate;
pub mod token;

pub use builder::{CancelToken, CertificateAuthority, IssuanceStage};
pub use error::{ErrorStage, HsmCertError, Result};

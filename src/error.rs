//! Errors returned by hsmcert operations.
//!
//! Every failure carries an [`ErrorStage`] so callers can tell bad input from
//! token trouble:
//!
//! ```
//! use hsmcert::error::{ErrorStage, HsmCertError};
//!
//! let err = HsmCertError::KeyNotFoundError("root-ca".to_string());
//! assert_eq!(err.stage(), ErrorStage::Validation);
//! assert!(err.token_error().is_none());
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::token::TokenError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, HsmCertError>;

/// Which part of an operation failed.
///
/// Lets callers tell a configuration or input problem (`Validation`) apart
/// from a token or hardware failure (`Token`) and from a failure after the
/// token already produced a signature (`Assembly`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStage {
    Validation,
    Token,
    Assembly,
}

/// Represents errors that can occur in the hsmcert library.
#[derive(Debug, Error, Clone)]
pub enum HsmCertError {
    /// The PKCS#11 module could not be loaded or the token could not be found.
    #[error("Token unavailable: {0}")]
    TokenUnavailableError(String),

    /// The token rejected the PIN.
    #[error("Login failed: {0}")]
    LoginError(TokenError),

    /// A session was lost twice in a row, or was lost and retries are disabled.
    #[error("Session error: {0}")]
    SessionError(TokenError),

    /// No session became available within the configured timeout.
    #[error("No token session available after {0:?}")]
    SessionTimeoutError(Duration),

    #[error("Key already exists: {0}")]
    KeyExistsError(String),

    #[error("Key not found: {0}")]
    KeyNotFoundError(String),

    #[error("Certificate already exists: {0}")]
    CertificateExistsError(String),

    #[error("Certificate not found: {0}")]
    CertificateNotFoundError(String),

    /// Rejected before any token call was made.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithmError(String),

    /// The token refused to sign. The token error code is preserved.
    #[error("Signing failed: {0}")]
    SigningError(TokenError),

    #[error("Inconsistent extensions: {0}")]
    ExtensionConsistencyError(String),

    #[error("Serial number generation failed: {0}")]
    SerialGenerationError(String),

    /// Any other token failure (key generation, attribute reads, object management).
    #[error("Token error: {0}")]
    TokenError(TokenError),

    /// Error due to invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Error during data encoding.
    #[error("Failed to encode data: {0}")]
    EncodingError(String),

    /// Error during data decoding.
    #[error("Failed to decode data: {0}")]
    DecodingError(String),

    /// A signature produced by the token did not verify.
    #[error("Signature verification failed: {0}")]
    VerificationError(String),

    #[error("Operation cancelled before {0}")]
    Cancelled(String),
}

impl HsmCertError {
    /// Returns the stage this error belongs to.
    pub fn stage(&self) -> ErrorStage {
        match self {
            HsmCertError::InvalidInput(_)
            | HsmCertError::UnsupportedAlgorithmError(_)
            | HsmCertError::ExtensionConsistencyError(_)
            | HsmCertError::KeyExistsError(_)
            | HsmCertError::KeyNotFoundError(_)
            | HsmCertError::CertificateExistsError(_)
            | HsmCertError::CertificateNotFoundError(_)
            | HsmCertError::SerialGenerationError(_)
            | HsmCertError::Cancelled(_) => ErrorStage::Validation,
            HsmCertError::TokenUnavailableError(_)
            | HsmCertError::LoginError(_)
            | HsmCertError::SessionError(_)
            | HsmCertError::SessionTimeoutError(_)
            | HsmCertError::SigningError(_)
            | HsmCertError::TokenError(_) => ErrorStage::Token,
            HsmCertError::EncodingError(_)
            | HsmCertError::DecodingError(_)
            | HsmCertError::VerificationError(_) => ErrorStage::Assembly,
        }
    }

    /// The underlying token error, if this error came from a token call.
    pub fn token_error(&self) -> Option<&TokenError> {
        match self {
            HsmCertError::LoginError(err)
            | HsmCertError::SessionError(err)
            | HsmCertError::SigningError(err)
            | HsmCertError::TokenError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<der::Error> for HsmCertError {
    /// Converts a `der::Error` into a `HsmCertError`.
    fn from(err: der::Error) -> Self {
        HsmCertError::DecodingError(err.to_string())
    }
}

impl From<x509_cert::spki::Error> for HsmCertError {
    fn from(err: x509_cert::spki::Error) -> Self {
        HsmCertError::EncodingError(err.to_string())
    }
}

impl From<rsa::Error> for HsmCertError {
    fn from(err: rsa::Error) -> Self {
        HsmCertError::InvalidInput(format!("RSA: {err}"))
    }
}

impl From<TokenError> for HsmCertError {
    fn from(err: TokenError) -> Self {
        HsmCertError::TokenError(err)
    }
}

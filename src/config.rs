//! Configuration for the token connection and for issuance.
//!
//! Loaded from TOML:
//!
//! ```toml
//! [token]
//! module_path = "/usr/lib/softhsm/libsofthsm2.so"
//! token_label = "my_test_token_1"
//! pin = "1234"
//! session_pool_size = 4
//!
//! [issuance]
//! rsa_padding = "pss"
//! clock_skew_secs = 300
//! ```
//!
//! or from the `PKCS11_MODULE`, `PKCS11_TOKEN` and `PKCS11_PIN` environment
//! variables with [`TokenConfig::from_env`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::error::{HsmCertError, Result};
use crate::signer::{DigestAlgorithm, RsaPadding};

pub const ENV_MODULE: &str = "PKCS11_MODULE";
pub const ENV_TOKEN: &str = "PKCS11_TOKEN";
pub const ENV_PIN: &str = "PKCS11_PIN";
pub const ENV_RECREATE_SESSION: &str = "PKCS11_TOKEN_SUPPORT_RECREATE_SESSION";

struct ConfigDefaults;

impl ConfigDefaults {
    fn session_pool_size() -> u32 {
        4
    }

    fn session_retry_on_invalid() -> bool {
        true
    }

    fn session_timeout_secs() -> u64 {
        10
    }

    fn clock_skew_secs() -> u64 {
        300
    }

    fn verify_signatures() -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub token: TokenConfig,

    #[serde(default)]
    pub issuance: IssuanceConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)
            .map_err(|e| HsmCertError::InvalidInput(format!("Invalid configuration: {e}")))?;
        config.token.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).map_err(|e| {
            HsmCertError::InvalidInput(format!("Cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&s)
    }
}

/// Where the token lives and how sessions to it are pooled.
#[derive(Debug, Deserialize, Builder)]
pub struct TokenConfig {
    #[builder(into)]
    pub module_path: PathBuf,

    #[builder(into)]
    pub token_label: String,

    #[serde(deserialize_with = "deserialize_secret")]
    #[builder(into)]
    pub pin: SecretString,

    /// Maximum number of concurrently open sessions.
    #[serde(default = "ConfigDefaults::session_pool_size")]
    #[builder(default = ConfigDefaults::session_pool_size())]
    pub session_pool_size: u32,

    /// Retry an operation once on a fresh session when its session is lost.
    #[serde(default = "ConfigDefaults::session_retry_on_invalid")]
    #[builder(default = ConfigDefaults::session_retry_on_invalid())]
    pub session_retry_on_invalid: bool,

    /// How long `acquire` waits for a free session.
    #[serde(default = "ConfigDefaults::session_timeout_secs")]
    #[builder(default = ConfigDefaults::session_timeout_secs())]
    pub session_timeout_secs: u64,
}

impl TokenConfig {
    /// Reads `PKCS11_MODULE`, `PKCS11_TOKEN`, `PKCS11_PIN` and optionally
    /// `PKCS11_TOKEN_SUPPORT_RECREATE_SESSION`.
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| {
            std::env::var(name)
                .map_err(|_| HsmCertError::InvalidInput(format!("{name} is not set")))
        };

        let session_retry_on_invalid = match std::env::var(ENV_RECREATE_SESSION) {
            Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
            Err(_) => ConfigDefaults::session_retry_on_invalid(),
        };

        let config = TokenConfig::builder()
            .module_path(var(ENV_MODULE)?)
            .token_label(var(ENV_TOKEN)?)
            .pin(var(ENV_PIN)?)
            .session_retry_on_invalid(session_retry_on_invalid)
            .build();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token_label.trim().is_empty() {
            return Err(HsmCertError::InvalidInput(
                "token_label must not be empty".to_string(),
            ));
        }
        if self.pin.expose_secret().is_empty() {
            return Err(HsmCertError::InvalidInput("pin must not be empty".to_string()));
        }
        if self.session_pool_size == 0 {
            return Err(HsmCertError::InvalidInput(
                "session_pool_size must be at least 1".to_string(),
            ));
        }
        if self.session_timeout_secs == 0 {
            return Err(HsmCertError::InvalidInput(
                "session_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

/// Issuance policy shared by every certificate, CSR and CRL.
#[derive(Clone, Debug, Deserialize, Builder)]
pub struct IssuanceConfig {
    #[serde(default)]
    #[builder(default)]
    pub rsa_padding: RsaPadding,

    #[serde(default)]
    #[builder(default)]
    pub digest: DigestAlgorithm,

    /// Tolerance when checking `notBefore <= now <= notAfter`.
    #[serde(default = "ConfigDefaults::clock_skew_secs")]
    #[builder(default = ConfigDefaults::clock_skew_secs())]
    pub clock_skew_secs: u64,

    /// Verify every token signature in software before returning it.
    #[serde(default = "ConfigDefaults::verify_signatures")]
    #[builder(default = ConfigDefaults::verify_signatures())]
    pub verify_signatures: bool,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        IssuanceConfig::builder().build()
    }
}

impl IssuanceConfig {
    pub fn clock_skew(&self) -> time::Duration {
        time::Duration::seconds(self.clock_skew_secs as i64)
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

//! Certificate objects kept in the token next to their keys.

use std::sync::{Arc, Mutex, PoisonError};

use log::info;

use crate::cert::Certificate;
use crate::error::{HsmCertError, Result};
use crate::session::SessionManager;

/// Imports, exports and deletes X.509 certificate objects by label.
pub struct CertificateStore {
    sessions: Arc<SessionManager>,
    import_lock: Mutex<()>,
}

impl CertificateStore {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            import_lock: Mutex::new(()),
        }
    }

    /// Stores `certificate` under `label`. An existing label is never overwritten.
    pub fn import(&self, label: &str, certificate: &Certificate) -> Result<()> {
        if label.is_empty() {
            return Err(HsmCertError::InvalidInput(
                "certificate label must not be empty".to_string(),
            ));
        }
        let der = certificate.to_der()?;

        let _guard = self.import_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.sessions.with_session("import certificate", |session| {
            if session.export_certificate(label)?.is_some() {
                return Err(HsmCertError::CertificateExistsError(label.to_string()));
            }
            Ok(session.import_certificate(label, &der)?)
        })?;
        info!("Imported certificate '{label}'");
        Ok(())
    }

    pub fn export(&self, label: &str) -> Result<Certificate> {
        let der = self
            .sessions
            .with_session("export certificate", |session| {
                Ok(session.export_certificate(label)?)
            })?
            .ok_or_else(|| HsmCertError::CertificateNotFoundError(label.to_string()))?;
        Certificate::from_der(&der)
    }

    pub fn delete(&self, label: &str) -> Result<()> {
        let deleted = self
            .sessions
            .with_session("delete certificate", |session| {
                Ok(session.delete_certificate(label)?)
            })?;
        if !deleted {
            return Err(HsmCertError::CertificateNotFoundError(label.to_string()));
        }
        info!("Deleted certificate '{label}'");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;
    use crate::token::soft::{FnIdx, SoftToken};

    fn store(token: &SoftToken) -> CertificateStore {
        let config = TokenConfig::builder()
            .module_path("/dev/null")
            .token_label("test")
            .pin("1234")
            .session_timeout_secs(1)
            .build();
        CertificateStore::new(Arc::new(
            SessionManager::new(Arc::new(token.clone()), config).unwrap(),
        ))
    }

    #[test]
    fn test_missing_certificate() {
        let token = SoftToken::new("test", "1234");
        let store = store(&token);

        assert!(matches!(
            store.export("nope"),
            Err(HsmCertError::CertificateNotFoundError(_))
        ));
        assert!(matches!(
            store.delete("nope"),
            Err(HsmCertError::CertificateNotFoundError(_))
        ));
        assert_eq!(token.call_counts().get(FnIdx::ExportCertificate), 1);
        assert_eq!(token.call_counts().get(FnIdx::DeleteCertificate), 1);
    }

    #[test]
    fn test_export_retries_after_session_loss() {
        let token = SoftToken::new("test", "1234");
        let store = store(&token);

        token.invalidate_next_sessions(1);
        assert!(matches!(
            store.export("nope"),
            Err(HsmCertError::CertificateNotFoundError(_))
        ));
        assert_eq!(token.call_counts().get(FnIdx::ExportCertificate), 2);
    }
}

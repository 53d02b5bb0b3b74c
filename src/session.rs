//! Pooled, logged-in token sessions.
//!
//! A [`SessionManager`] owns an `r2d2` pool of at most `session_pool_size`
//! sessions. Callers borrow one with [`SessionManager::acquire`] and hold it
//! exclusively until the [`SessionGuard`] is dropped or handed back with
//! [`SessionManager::release`]. A session that failed with a session-loss
//! error is marked dead and the pool discards it instead of reusing it.
//!
//! [`SessionManager::with_session`] wraps one logical operation: if it fails
//! because its session was lost, the operation is repeated exactly once on a
//! fresh session. A second loss is reported as
//! [`HsmCertError::SessionError`].

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use r2d2::{LoggingErrorHandler, ManageConnection, Pool, PooledConnection};
use secrecy::SecretString;

use crate::config::TokenConfig;
use crate::error::{HsmCertError, Result};
use crate::token::pkcs11::Pkcs11Token;
use crate::token::{Token, TokenError, TokenErrorKind, TokenSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    LoggedOut,
    LoggedIn,
}

/// A session as held in the pool.
struct PooledSession {
    inner: Box<dyn TokenSession>,
    slot_id: u64,
    state: LoginState,
    alive: bool,
}

/// Failure of one numbered connect attempt.
#[derive(Debug)]
struct ConnectFailure {
    attempt: u64,
    error: HsmCertError,
}

/// Connect attempts and the most recent failure among them.
///
/// `r2d2` only reports "timed out" when it cannot create a connection. An
/// acquire reports the recorded failure only if that attempt started after
/// the acquire did.
#[derive(Debug, Default)]
struct ConnectLog {
    attempts: AtomicU64,
    last_failure: Mutex<Option<ConnectFailure>>,
}

impl ConnectLog {
    fn begin(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn fail(&self, attempt: u64, error: HsmCertError) {
        let mut last = self.last_failure.lock().unwrap_or_else(PoisonError::into_inner);
        if last.as_ref().is_none_or(|f| f.attempt < attempt) {
            *last = Some(ConnectFailure { attempt, error });
        }
    }

    /// The latest failure of an attempt numbered above `after`.
    fn failure_since(&self, after: u64) -> Option<HsmCertError> {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|f| f.attempt > after)
            .map(|f| f.error.clone())
    }
}

/// Opens and logs in sessions on behalf of the pool.
struct TokenConnector {
    token: Arc<dyn Token>,
    pin: SecretString,
    log: Arc<ConnectLog>,
}

impl TokenConnector {
    fn open_logged_in(&self) -> std::result::Result<PooledSession, (TokenError, HsmCertError)> {
        let mut inner = self.token.open_session().map_err(|err| {
            let mapped = HsmCertError::TokenUnavailableError(format!(
                "{}: {err}",
                self.token.description()
            ));
            (err, mapped)
        })?;

        match inner.login(&self.pin) {
            Ok(()) => {}
            Err(err) if err.kind == TokenErrorKind::AlreadyLoggedIn => {
                debug!("Token {} reports user already logged in", self.token.description());
            }
            Err(err) => {
                let mapped = match err.kind {
                    TokenErrorKind::LibraryUnavailable
                    | TokenErrorKind::TokenNotPresent
                    | TokenErrorKind::DeviceRemoved => HsmCertError::TokenUnavailableError(
                        format!("{}: {err}", self.token.description()),
                    ),
                    _ => HsmCertError::LoginError(err.clone()),
                };
                return Err((err, mapped));
            }
        }

        let slot_id = inner.slot_id();
        debug!("Opened session on slot {slot_id} of {}", self.token.description());
        Ok(PooledSession {
            inner,
            slot_id,
            state: LoginState::LoggedIn,
            alive: true,
        })
    }
}

impl ManageConnection for TokenConnector {
    type Connection = PooledSession;
    type Error = TokenError;

    fn connect(&self) -> std::result::Result<PooledSession, TokenError> {
        let attempt = self.log.begin();
        self.open_logged_in().map_err(|(err, mapped)| {
            self.log.fail(attempt, mapped);
            err
        })
    }

    fn is_valid(&self, conn: &mut PooledSession) -> std::result::Result<(), TokenError> {
        conn.inner.ping().inspect_err(|_| conn.alive = false)
    }

    fn has_broken(&self, conn: &mut PooledSession) -> bool {
        !conn.alive
    }
}

/// Exclusive loan of one logged-in session.
///
/// Dereferences to the [`TokenSession`]. Dropping it returns the session to
/// the pool, or discards it if it was invalidated.
pub struct SessionGuard {
    conn: PooledConnection<TokenConnector>,
}

impl SessionGuard {
    pub fn slot_id(&self) -> u64 {
        self.conn.slot_id
    }

    pub fn login_state(&self) -> LoginState {
        self.conn.state
    }

    pub fn is_alive(&self) -> bool {
        self.conn.alive
    }

    fn mark_dead(&mut self) {
        self.conn.alive = false;
        self.conn.state = LoginState::LoggedOut;
    }
}

impl Deref for SessionGuard {
    type Target = dyn TokenSession;

    fn deref(&self) -> &Self::Target {
        self.conn.inner.as_ref()
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.inner.as_mut()
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("slot_id", &self.conn.slot_id)
            .field("state", &self.conn.state)
            .field("alive", &self.conn.alive)
            .finish()
    }
}

/// Counters describing pool activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub acquired: u64,
    pub invalidated: u64,
    pub retries: u64,
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    invalidated: AtomicU64,
    retries: AtomicU64,
}

pub struct SessionManager {
    pool: Pool<TokenConnector>,
    description: String,
    retry_on_invalid: bool,
    timeout: Duration,
    connects: Arc<ConnectLog>,
    counters: Counters,
}

impl SessionManager {
    /// Loads the PKCS#11 module named in `config` and builds a pool over it.
    pub fn open(config: TokenConfig) -> Result<Self> {
        config.validate()?;
        let token = Pkcs11Token::open(&config.module_path, &config.token_label)
            .map_err(|err| HsmCertError::TokenUnavailableError(err.to_string()))?;
        Self::new(Arc::new(token), config)
    }

    /// Builds a pool over an already opened token.
    ///
    /// One session is opened and logged in up front so that an unreachable
    /// token or a wrong PIN is reported here rather than on first use.
    pub fn new(token: Arc<dyn Token>, config: TokenConfig) -> Result<Self> {
        config.validate()?;
        let description = token.description();
        let timeout = config.session_timeout();
        let pool_size = config.session_pool_size;
        let retry_on_invalid = config.session_retry_on_invalid;
        let connects = Arc::new(ConnectLog::default());
        let connector = TokenConnector {
            token,
            pin: config.pin,
            log: connects.clone(),
        };

        connector.open_logged_in().map_err(|(_, mapped)| {
            warn!("Unable to use token {description}: {mapped}");
            mapped
        })?;

        let pool = Pool::builder()
            .max_size(pool_size)
            .min_idle(Some(0))
            .max_lifetime(None)
            .idle_timeout(None)
            .connection_timeout(timeout)
            .error_handler(Box::new(LoggingErrorHandler))
            .build_unchecked(connector);

        info!(
            "Session pool for token {description} ready (max {pool_size} sessions, retry on invalid: {retry_on_invalid})"
        );

        Ok(Self {
            pool,
            description,
            retry_on_invalid,
            timeout,
            connects,
            counters: Counters::default(),
        })
    }

    /// Borrows a live, logged-in session, waiting up to the configured timeout.
    ///
    /// A timeout is reported as the connect failure that caused it, provided
    /// that connect attempt started during this call.
    pub fn acquire(&self) -> Result<SessionGuard> {
        let before = self.connects.attempts();
        match self.pool.get() {
            Ok(conn) => {
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                Ok(SessionGuard { conn })
            }
            Err(err) => match self.connects.failure_since(before) {
                Some(cause) => {
                    warn!("No session for token {}: {cause}", self.description);
                    Err(cause)
                }
                None => {
                    warn!("No session for token {} within {:?}: {err}", self.description, self.timeout);
                    Err(HsmCertError::SessionTimeoutError(self.timeout))
                }
            },
        }
    }

    /// Returns a session to the pool.
    pub fn release(&self, session: SessionGuard) {
        drop(session);
    }

    /// Marks a session dead. It is closed instead of being returned to the pool.
    pub fn invalidate(&self, session: &mut SessionGuard) {
        if session.is_alive() {
            self.counters.invalidated.fetch_add(1, Ordering::Relaxed);
            session.mark_dead();
            debug!("Invalidated session on slot {}", session.slot_id());
        }
    }

    /// Runs `op` on a borrowed session.
    ///
    /// A session-loss failure invalidates the session and runs `op` once more
    /// on a fresh one. Any other error is returned unchanged.
    pub fn with_session<T, F>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(&mut SessionGuard) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut session = self.acquire()?;
            let err = match op(&mut session) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let lost = match err.token_error() {
                Some(token_err) if token_err.is_session_loss() => token_err.clone(),
                _ => return Err(err),
            };
            self.invalidate(&mut session);
            drop(session);

            if !self.retry_on_invalid || attempt > 1 {
                warn!("{operation} failed after session loss on attempt {attempt}: {lost}");
                return Err(HsmCertError::SessionError(lost));
            }

            warn!("{operation} lost its session ({lost}), retrying on a new session");
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            invalidated: self.counters.invalidated.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }

    /// Sessions currently held by the pool (idle plus borrowed).
    pub fn open_sessions(&self) -> u32 {
        self.pool.state().connections
    }

    pub fn max_sessions(&self) -> u32 {
        self.pool.max_size()
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("token", &self.description)
            .field("state", &self.pool.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::soft::{FnIdx, SoftToken};

    fn config(pin: &str, pool_size: u32) -> TokenConfig {
        TokenConfig::builder()
            .module_path("/dev/null")
            .token_label("test")
            .pin(pin)
            .session_pool_size(pool_size)
            .session_timeout_secs(1)
            .build()
    }

    fn manager(token: &SoftToken, pool_size: u32) -> SessionManager {
        SessionManager::new(Arc::new(token.clone()), config("1234", pool_size)).unwrap()
    }

    #[test]
    fn test_wrong_pin_fails_with_login_error() {
        let token = SoftToken::new("test", "1234");
        let err = SessionManager::new(Arc::new(token), config("9999", 2)).unwrap_err();
        assert!(matches!(err, HsmCertError::LoginError(_)));
    }

    #[test]
    fn test_unavailable_token() {
        let token = SoftToken::new("test", "1234");
        token.set_unavailable(true);
        let err = SessionManager::new(Arc::new(token), config("1234", 2)).unwrap_err();
        assert!(matches!(err, HsmCertError::TokenUnavailableError(_)));
    }

    #[test]
    fn test_released_session_is_reused() {
        let token = SoftToken::new("test", "1234");
        let sessions = manager(&token, 2);
        let opened = token.call_counts().get(FnIdx::OpenSession);

        let session = sessions.acquire().unwrap();
        assert_eq!(session.login_state(), LoginState::LoggedIn);
        sessions.release(session);
        let session = sessions.acquire().unwrap();
        drop(session);

        assert_eq!(token.call_counts().get(FnIdx::OpenSession), opened + 1);
        assert_eq!(sessions.stats().acquired, 2);
    }

    #[test]
    fn test_invalidated_session_is_replaced() {
        let token = SoftToken::new("test", "1234");
        let sessions = manager(&token, 2);
        let opened = token.call_counts().get(FnIdx::OpenSession);

        let mut session = sessions.acquire().unwrap();
        sessions.invalidate(&mut session);
        assert!(!session.is_alive());
        drop(session);

        let session = sessions.acquire().unwrap();
        assert!(session.is_alive());
        assert_eq!(token.call_counts().get(FnIdx::OpenSession), opened + 2);
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let token = SoftToken::new("test", "1234");
        let sessions = manager(&token, 1);

        let held = sessions.acquire().unwrap();
        let err = sessions.acquire().unwrap_err();
        assert!(matches!(err, HsmCertError::SessionTimeoutError(_)));
        drop(held);

        assert!(sessions.acquire().is_ok());
    }

    #[test]
    fn test_earlier_connect_failure_does_not_explain_timeout() {
        let token = SoftToken::new("test", "1234");
        let sessions = manager(&token, 1);
        let held = sessions.acquire().unwrap();

        let stale = sessions.connects.begin();
        let rejected = TokenError::new(TokenErrorKind::PinRejected, "CKR_PIN_INCORRECT", "C_Login");
        sessions.connects.fail(stale, HsmCertError::LoginError(rejected));

        let err = sessions.acquire().unwrap_err();
        assert!(matches!(err, HsmCertError::SessionTimeoutError(_)), "{err:?}");
        drop(held);
    }

    #[test]
    fn test_connect_failure_during_acquire_is_reported() {
        let token = SoftToken::new("test", "1234");
        let sessions = manager(&token, 2);
        token.set_unavailable(true);

        let err = sessions.acquire().unwrap_err();
        assert!(matches!(err, HsmCertError::TokenUnavailableError(_)), "{err:?}");
    }

    #[test]
    fn test_single_session_loss_is_retried() {
        let token = SoftToken::new("test", "1234");
        let sessions = manager(&token, 2);
        token.invalidate_next_sessions(1);

        let keys = sessions
            .with_session("list keys", |s| Ok(s.list_key_pairs()?))
            .unwrap();
        assert!(keys.is_empty());
        assert_eq!(token.call_counts().get(FnIdx::ListKeyPairs), 2);
        assert_eq!(sessions.stats().retries, 1);
        assert_eq!(sessions.stats().invalidated, 1);
    }

    #[test]
    fn test_second_session_loss_is_surfaced() {
        let token = SoftToken::new("test", "1234");
        let sessions = manager(&token, 2);
        token.invalidate_next_sessions(2);

        let err = sessions
            .with_session("list keys", |s| Ok(s.list_key_pairs()?))
            .unwrap_err();
        assert!(matches!(err, HsmCertError::SessionError(_)));
        assert_eq!(token.call_counts().get(FnIdx::ListKeyPairs), 2);
    }

    #[test]
    fn test_retry_can_be_disabled() {
        let token = SoftToken::new("test", "1234");
        let mut cfg = config("1234", 2);
        cfg.session_retry_on_invalid = false;
        let sessions = SessionManager::new(Arc::new(token.clone()), cfg).unwrap();
        token.invalidate_next_sessions(1);

        let err = sessions
            .with_session("list keys", |s| Ok(s.list_key_pairs()?))
            .unwrap_err();
        assert!(matches!(err, HsmCertError::SessionError(_)));
        assert_eq!(token.call_counts().get(FnIdx::ListKeyPairs), 1);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let token = SoftToken::new("test", "1234");
        let sessions = manager(&token, 2);

        let err = sessions
            .with_session("fail", |_| -> Result<()> {
                Err(HsmCertError::KeyNotFoundError("nope".into()))
            })
            .unwrap_err();
        assert!(matches!(err, HsmCertError::KeyNotFoundError(_)));
        assert_eq!(sessions.stats().retries, 0);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;
use crate::transport::{Credentials, SessionToken, Transport};

/// Authenticated session with its local expiry deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: SessionToken,
    pub expires_at: Instant,
}

impl Session {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Owns the login handshake and the single active token/cookie pair.
///
/// Renewal happens under an async mutex: concurrent callers that find the
/// session missing or expired wait for one login instead of racing.
pub struct SessionManager {
    credentials: Credentials,
    cookie_timeout: Duration,
    current: Mutex<Option<Session>>,
    logins: AtomicU64,
}

impl SessionManager {
    pub fn new(credentials: Credentials, cookie_timeout: Duration) -> Self {
        Self {
            credentials,
            cookie_timeout,
            current: Mutex::new(None),
            logins: AtomicU64::new(0),
        }
    }

    /// Returns a valid session, logging in first when none is active or the
    /// cookie expired. `on_login` runs after every successful login while the
    /// renewal lock is still held.
    pub async fn ensure<F>(&self, transport: &dyn Transport, on_login: F) -> Result<SessionToken>
    where
        F: FnOnce(),
    {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            if !session.is_expired(Instant::now()) {
                return Ok(session.token.clone());
            }
            tracing::info!(
                "Session for {} expired, logging in again",
                self.credentials.principal()
            );
        }

        tracing::debug!("Logging in as {}", self.credentials.principal());
        let token = transport.authenticate(&self.credentials).await?;
        let session = Session {
            token: token.clone(),
            expires_at: Instant::now() + self.cookie_timeout,
        };
        *current = Some(session);
        self.logins.fetch_add(1, Ordering::SeqCst);
        on_login();

        tracing::info!("Logged in as {}", self.credentials.principal());
        Ok(token)
    }

    /// Drops the active session only if it still holds `token`, so a renewal
    /// done by another caller in the meantime is kept.
    pub async fn invalidate(&self, token: &SessionToken) {
        let mut current = self.current.lock().await;
        if current.as_ref().map(|s| &s.token) == Some(token) {
            tracing::debug!("Invalidating session for {}", self.credentials.principal());
            *current = None;
        }
    }

    pub async fn current(&self) -> Option<Session> {
        self.current.lock().await.clone()
    }

    /// Number of successful login exchanges so far.
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::SeqCst)
    }
}

//! Per-user session store
//!
//! Owns the lifecycle of every operator's secondary authenticated session:
//! the login state machine, the exclusively-owned credential handle, and
//! the proxy binding. All mutating operations on one user run under that
//! user's lock, held only for short critical sections; a worker takes the
//! credential out via [`SessionStore::checkout_credential`] instead of
//! holding the lock across a transfer, so auth checks, proxy edits, and
//! revocation stay responsive while a job streams.

use crate::error::SessionError;
use crate::transport::{CredentialHandle, LoginOutcome, PendingLogin, UserTransport};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// Authentication state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No login has succeeded yet
    Unauthenticated,
    /// First login step passed; waiting for the second-factor code
    AwaitingSecondFactor,
    /// Live authenticated connection available
    Active,
    /// Logged out; holds no live credential
    Revoked,
}

/// One operator's session record
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    credential: Option<CredentialHandle>,
    // True while a worker holds the checked-out credential.
    leased: bool,
    pending: Option<PendingLogin>,
    proxy: Option<String>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Unauthenticated,
            credential: None,
            leased: false,
            pending: None,
            proxy: None,
        }
    }

    /// Current authentication state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Currently bound proxy address, if any
    #[must_use]
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }
}

/// Successful outcomes of the first login step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginResult {
    /// Session is live
    Active,
    /// Caller must follow up with `complete_login`
    AwaitingSecondFactor,
}

/// Keyed store mapping `user_id` to its session, one entry per user
pub struct SessionStore {
    transport: Arc<dyn UserTransport>,
    sessions: RwLock<HashMap<i64, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    /// Create an empty store backed by the given transport
    #[must_use]
    pub fn new(transport: Arc<dyn UserTransport>) -> Self {
        Self {
            transport,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, user_id: i64) -> Arc<Mutex<Session>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&user_id) {
                return session.clone();
            }
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(Session::new())))
            .clone()
    }

    /// Get the session record for a user, if one exists
    pub async fn get(&self, user_id: i64) -> Option<Arc<Mutex<Session>>> {
        let sessions = self.sessions.read().await;
        sessions.get(&user_id).cloned()
    }

    /// Begin authentication with a phone number.
    ///
    /// A repeated login while already `Active` replaces the old connection.
    /// On failure the session keeps its prior state.
    ///
    /// # Errors
    ///
    /// Returns a `SessionError` if the credentials are malformed or the
    /// transport rejects them.
    pub async fn begin_login(
        &self,
        user_id: i64,
        phone_number: &str,
    ) -> Result<LoginResult, SessionError> {
        let entry = self.entry(user_id).await;
        let mut session = entry.lock().await;
        let proxy = session.proxy.clone();

        match self.transport.connect(phone_number, proxy.as_deref()).await? {
            LoginOutcome::Connected(handle) => {
                if let Some(old) = session.credential.replace(handle) {
                    self.transport.disconnect(old).await;
                }
                session.pending = None;
                session.state = SessionState::Active;
                info!(user_id, "user session active");
                Ok(LoginResult::Active)
            }
            LoginOutcome::SecondFactorRequired(pending) => {
                session.pending = Some(pending);
                session.state = SessionState::AwaitingSecondFactor;
                info!(user_id, "user session awaiting second factor");
                Ok(LoginResult::AwaitingSecondFactor)
            }
        }
    }

    /// Complete a login that is waiting for a second-factor code.
    ///
    /// On a rejected code the session stays in `AwaitingSecondFactor` so
    /// the operator can try again.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NoPendingLogin` if no second factor is
    /// expected, or the transport's rejection.
    pub async fn complete_login(&self, user_id: i64, code: &str) -> Result<(), SessionError> {
        let entry = self.entry(user_id).await;
        let mut session = entry.lock().await;

        if session.state != SessionState::AwaitingSecondFactor {
            return Err(SessionError::NoPendingLogin);
        }
        let Some(pending) = session.pending.clone() else {
            return Err(SessionError::NoPendingLogin);
        };

        let handle = self.transport.submit_second_factor(&pending, code).await?;
        if let Some(old) = session.credential.replace(handle) {
            self.transport.disconnect(old).await;
        }
        session.pending = None;
        session.state = SessionState::Active;
        info!(user_id, "user session active");
        Ok(())
    }

    /// Bind a proxy address for this user.
    ///
    /// Always succeeds, independent of auth state. The address is read at
    /// connection-establishment time only: an existing `Active` session
    /// keeps its current transport path, because rebinding a live
    /// connection is unsafe.
    pub async fn bind_proxy(&self, user_id: i64, address: String) {
        let entry = self.entry(user_id).await;
        let mut session = entry.lock().await;
        info!(user_id, %address, "proxy bound for future connections");
        session.proxy = Some(address);
    }

    /// Remove the proxy binding for this user
    pub async fn clear_proxy(&self, user_id: i64) {
        let entry = self.entry(user_id).await;
        let mut session = entry.lock().await;
        session.proxy = None;
    }

    /// Take the credential out of an `Active` session for one job.
    ///
    /// Moving the handle out (instead of borrowing it under the session
    /// lock) keeps it exclusive to the single worker while leaving the
    /// session lock free for auth checks, proxy edits, and revocation.
    /// Returns `None` when the session is not `Active` or the handle is
    /// already leased.
    pub async fn checkout_credential(&self, user_id: i64) -> Option<CredentialHandle> {
        let entry = self.get(user_id).await?;
        let mut session = entry.lock().await;
        if session.state != SessionState::Active {
            return None;
        }
        let handle = session.credential.take()?;
        session.leased = true;
        Some(handle)
    }

    /// Return a checked-out credential.
    ///
    /// If the session was revoked or replaced by a relogin while the lease
    /// was out, the handle is stale and gets disconnected instead of
    /// restored.
    pub async fn checkin_credential(&self, user_id: i64, handle: CredentialHandle) {
        let Some(entry) = self.get(user_id).await else {
            self.transport.disconnect(handle).await;
            return;
        };
        let mut session = entry.lock().await;
        session.leased = false;
        if session.state == SessionState::Active && session.credential.is_none() {
            session.credential = Some(handle);
        } else {
            drop(session);
            self.transport.disconnect(handle).await;
        }
    }

    /// Release the credential and mark the session `Revoked`.
    ///
    /// Idempotent: revoking twice, or revoking a user who never logged in,
    /// is a no-op. A credential that is out on lease is disconnected when
    /// the worker checks it back in.
    pub async fn revoke(&self, user_id: i64) {
        let Some(entry) = self.get(user_id).await else {
            return;
        };
        let mut session = entry.lock().await;
        if let Some(handle) = session.credential.take() {
            self.transport.disconnect(handle).await;
        }
        session.pending = None;
        if session.state != SessionState::Revoked {
            info!(user_id, "user session revoked");
        }
        session.state = SessionState::Revoked;
    }

    /// Whether this user currently holds a live authenticated session.
    ///
    /// A leased credential still counts: the session is live while its
    /// worker streams a job.
    pub async fn is_active(&self, user_id: i64) -> bool {
        let Some(entry) = self.get(user_id).await else {
            return false;
        };
        let session = entry.lock().await;
        session.state == SessionState::Active && (session.credential.is_some() || session.leased)
    }
}

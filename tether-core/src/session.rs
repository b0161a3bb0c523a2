// ABOUTME: Session manager owning the access token lifecycle: login, expiry detection, renewal.
// ABOUTME: Renewal is serialized so concurrent callers share one in-flight reauthentication.

use crate::error::{Error, Result, TransportError};
use crate::transport::{Homeserver, LoginResponse};
use matrix_sdk::ruma::OwnedUserId;
use parking_lot::RwLock;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Account credentials kept in memory for silent renewal
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub device_name: String,
}

// Custom Debug impl to redact the password
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("device_name", &self.device_name)
            .finish()
    }
}

/// Lifecycle of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
    Reauthenticating,
    /// Credentials permanently rejected; nothing will be retried
    Failed,
}

/// Token plus the generation it was issued in
#[derive(Clone, PartialEq, Eq)]
pub struct TokenLease {
    pub token: String,
    pub generation: u64,
}

impl fmt::Debug for TokenLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenLease")
            .field("token", &"[REDACTED]")
            .field("generation", &self.generation)
            .finish()
    }
}

struct SessionInner {
    state: SessionState,
    user_id: Option<OwnedUserId>,
    device_id: Option<String>,
    token: Option<String>,
    generation: u64,
    /// Consecutive failed renewals since the last success
    renewal_failures: u32,
    /// Bumped when a renewal attempt completes, successful or not
    renewal_attempts: u64,
    /// Outcome of the last failed renewal, handed to callers queued behind it
    last_renewal_error: Option<Error>,
}

impl SessionInner {
    fn lease(&self) -> Option<TokenLease> {
        match (&self.state, &self.token) {
            (SessionState::Authenticated, Some(token)) => Some(TokenLease {
                token: token.clone(),
                generation: self.generation,
            }),
            _ => None,
        }
    }
}

/// Owns credentials and the current access token.
///
/// Components call [`SessionManager::call`] for authenticated operations; a
/// token rejection there is converted into a single silent renewal and retry.
pub struct SessionManager {
    transport: Arc<dyn Homeserver>,
    credentials: Credentials,
    inner: RwLock<SessionInner>,
    /// Held for the whole login exchange; serializes renewals
    refresh_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Homeserver>, credentials: Credentials) -> Self {
        Self {
            transport,
            credentials,
            inner: RwLock::new(SessionInner {
                state: SessionState::Unauthenticated,
                user_id: None,
                device_id: None,
                token: None,
                generation: 0,
                renewal_failures: 0,
                renewal_attempts: 0,
                last_renewal_error: None,
            }),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().state
    }

    /// Own user id, known once authenticated
    pub fn user_id(&self) -> Option<OwnedUserId> {
        self.inner.read().user_id.clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.inner.read().device_id.clone()
    }

    /// Number of tokens issued so far
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Exchange the stored credentials for a token.
    pub async fn authenticate(&self) -> Result<OwnedUserId> {
        let _guard = self.refresh_lock.lock().await;

        {
            let mut inner = self.inner.write();
            match inner.state {
                SessionState::Failed => return Err(permanent("credentials were rejected")),
                SessionState::Authenticated => {
                    if let Some(user_id) = inner.user_id.clone() {
                        return Ok(user_id);
                    }
                }
                _ => {}
            }
            inner.state = SessionState::Authenticating;
        }

        tracing::info!(user = %self.credentials.user, "Logging in with password");
        match self.login(None).await {
            Ok(login) => {
                let user_id = login.user_id.clone();
                self.install(login);
                tracing::info!(user_id = %user_id, "Logged in successfully");
                Ok(user_id)
            }
            Err(err) => {
                let mut inner = self.inner.write();
                if is_credential_rejection(&err) {
                    inner.state = SessionState::Failed;
                    tracing::error!(error = %err, "Login rejected");
                    Err(permanent(&err.to_string()))
                } else {
                    inner.state = SessionState::Unauthenticated;
                    tracing::warn!(error = %err, "Login failed");
                    Err(err.into())
                }
            }
        }
    }

    /// Current token, renewing first if the session is expired.
    pub async fn ensure_valid(&self) -> Result<TokenLease> {
        let seen_attempts = {
            let inner = self.inner.read();
            if let Some(lease) = inner.lease() {
                return Ok(lease);
            }
            inner.renewal_attempts
        };

        // Everyone who saw an expired token queues here; only the first one logs in.
        // The rest take over its outcome, a fresh lease or the same error.
        let _guard = self.refresh_lock.lock().await;

        let device_id = {
            let mut inner = self.inner.write();
            if let Some(lease) = inner.lease() {
                return Ok(lease);
            }
            if inner.renewal_attempts != seen_attempts {
                if let Some(err) = inner.last_renewal_error.clone() {
                    tracing::debug!(error = %err, "Sharing outcome of concurrent renewal");
                    return Err(err);
                }
            }
            match inner.state {
                SessionState::Failed => return Err(permanent("session failed permanently")),
                SessionState::Unauthenticated | SessionState::Authenticating => {
                    return Err(Error::Auth {
                        message: "not authenticated".to_string(),
                        retryable: false,
                    });
                }
                _ => {}
            }
            inner.state = SessionState::Reauthenticating;
            inner.device_id.clone()
        };

        tracing::info!(user = %self.credentials.user, "Access token expired, reauthenticating");
        match self.login(device_id.as_deref()).await {
            Ok(login) => {
                self.install(login);
                let lease = self
                    .current_lease()
                    .ok_or_else(|| permanent("token missing after renewal"))?;
                tracing::info!(generation = lease.generation, "Session renewed");
                Ok(lease)
            }
            Err(err) => {
                let mut inner = self.inner.write();
                inner.renewal_failures += 1;
                let outcome = if inner.renewal_failures > 1 {
                    inner.state = SessionState::Failed;
                    tracing::error!(error = %err, "Reauthentication failed permanently");
                    permanent(&err.to_string())
                } else {
                    inner.state = SessionState::Expired;
                    tracing::warn!(error = %err, "Reauthentication failed, will retry");
                    Error::Auth {
                        message: err.to_string(),
                        retryable: true,
                    }
                };
                inner.renewal_attempts += 1;
                inner.last_renewal_error = Some(outcome.clone());
                Err(outcome)
            }
        }
    }

    /// Mark the token of `generation` as rejected by the server.
    ///
    /// A rejection observed for an older generation is ignored.
    pub fn mark_expired(&self, generation: u64) {
        let mut inner = self.inner.write();
        if inner.generation == generation && inner.state == SessionState::Authenticated {
            tracing::debug!(generation, "Token marked expired");
            inner.state = SessionState::Expired;
        }
    }

    /// Run an authenticated transport operation, renewing the token once on rejection.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        self.call_mapped(op, Error::from).await
    }

    /// Like [`SessionManager::call`], with `map_err` classifying non-token failures.
    pub async fn call_mapped<T, F, Fut, M>(&self, mut op: F, map_err: M) -> Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
        M: Fn(TransportError) -> Error,
    {
        let lease = self.ensure_valid().await?;
        match op(lease.token).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_unauthorized() => {
                self.mark_expired(lease.generation);
                let renewed = self.ensure_valid().await?;
                match op(renewed.token).await {
                    Ok(value) => Ok(value),
                    Err(err) if err.is_unauthorized() => {
                        self.mark_expired(renewed.generation);
                        Err(permanent(&format!("token rejected after renewal: {}", err)))
                    }
                    Err(err) => Err(map_err(err)),
                }
            }
            Err(err) => Err(map_err(err)),
        }
    }

    /// Invalidate the token server-side. Best effort.
    pub async fn logout(&self) {
        let Some(lease) = self.current_lease() else {
            return;
        };
        if let Err(e) = self.transport.logout(&lease.token).await {
            tracing::warn!(error = %e, "Logout failed");
        }
        let mut inner = self.inner.write();
        inner.token = None;
        inner.state = SessionState::Unauthenticated;
    }

    fn current_lease(&self) -> Option<TokenLease> {
        self.inner.read().lease()
    }

    async fn login(&self, device_id: Option<&str>) -> std::result::Result<LoginResponse, TransportError> {
        self.transport
            .login(
                &self.credentials.user,
                &self.credentials.password,
                &self.credentials.device_name,
                device_id,
            )
            .await
    }

    fn install(&self, login: LoginResponse) {
        let mut inner = self.inner.write();
        inner.user_id = Some(login.user_id);
        inner.device_id = Some(login.device_id);
        inner.token = Some(login.access_token);
        inner.generation += 1;
        inner.renewal_failures = 0;
        inner.renewal_attempts += 1;
        inner.last_renewal_error = None;
        inner.state = SessionState::Authenticated;
    }
}

fn is_credential_rejection(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::Forbidden(_) | TransportError::Unauthorized { .. }
    )
}

fn permanent(message: &str) -> Error {
    Error::Auth {
        message: message.to_string(),
        retryable: false,
    }
}

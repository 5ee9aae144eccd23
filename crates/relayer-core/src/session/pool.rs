use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::error::RelayError;
use crate::ratelimit::controller::RateLimitController;
use crate::session::state::SessionState;
use crate::session::transport::{AuthArtifact, RemoteClient};

/// Per-session bookkeeping the Pool owns.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub name: String,
    pub enabled: bool,
    pub state: SessionState,
    pub is_premium: bool,
    pub last_active: Option<DateTime<Utc>>,
    pub login_failure_reason: Option<String>,
}

impl SessionRecord {
    fn new(name: String, enabled: bool) -> Self {
        Self {
            name,
            enabled,
            state: if enabled {
                SessionState::NotLoggedIn
            } else {
                SessionState::Disabled
            },
            is_premium: false,
            last_active: None,
            login_failure_reason: None,
        }
    }
}

/// Caption length cap, governed by Premium capability.
pub const CAPTION_CAP_NORMAL: usize = 1024;
pub const CAPTION_CAP_PREMIUM: usize = 4096;

/// The Session Pool (C3): owns all Sessions, enforces the at-least-one-
/// enabled invariant, and elects sessions for lease.
pub struct SessionPool {
    client: Arc<dyn RemoteClient>,
    sessions: DashMap<String, SessionRecord>,
    artifacts: DashMap<String, AuthArtifact>,
    /// One outstanding call per session — the remote transport is not
    /// re-entrant per session.
    call_locks: DashMap<String, Arc<Semaphore>>,
    /// Serializes interactive login so only one session is `logging-in` at a
    /// time.
    login_serializer: Mutex<()>,
    pub rate_limiter: Arc<RateLimitController>,
}

impl SessionPool {
    pub fn new(client: Arc<dyn RemoteClient>, rate_limiter: Arc<RateLimitController>) -> Self {
        Self {
            client,
            sessions: DashMap::new(),
            artifacts: DashMap::new(),
            call_locks: DashMap::new(),
            login_serializer: Mutex::new(()),
            rate_limiter,
        }
    }

    /// Register a configured session. `artifact` is `Some` when a persisted
    /// auth blob exists for it.
    pub fn register(&self, name: &str, enabled: bool, artifact: Option<AuthArtifact>) {
        self.sessions
            .insert(name.to_string(), SessionRecord::new(name.to_string(), enabled));
        self.call_locks
            .insert(name.to_string(), Arc::new(Semaphore::new(1)));
        if let Some(a) = artifact {
            self.artifacts.insert(name.to_string(), a);
        }
    }

    /// Initialise all enabled sessions; silently re-logs in any with a
    /// persisted artifact, leaves the rest `not-logged-in`. Succeeds if at
    /// least one session ends `logged-in`.
    pub async fn start_enabled(&self) -> Result<(), RelayError> {
        let enabled_names: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.name.clone())
            .collect();

        for name in &enabled_names {
            if self.artifacts.contains_key(name) {
                self.silent_relogin(name).await;
            }
        }

        if self.list_logged_in().is_empty() {
            return Err(RelayError::NoSessionsAvailable);
        }
        Ok(())
    }

    async fn silent_relogin(&self, name: &str) {
        // Sequential-login invariant: only one session may be `logging-in`.
        let _guard = self.login_serializer.lock().await;

        if let Some(mut rec) = self.sessions.get_mut(name) {
            rec.state = SessionState::LoggingIn;
        }

        let artifact = match self.artifacts.get(name) {
            Some(a) => a.clone(),
            None => return,
        };

        match self.client.connect(&artifact).await {
            Ok(identity) => {
                if let Some(mut rec) = self.sessions.get_mut(name) {
                    rec.state = SessionState::LoggedIn;
                    rec.is_premium = identity.is_premium;
                    rec.last_active = Some(Utc::now());
                    rec.login_failure_reason = None;
                }
                info!(session = %name, premium = identity.is_premium, "session logged in");
            }
            Err(e) => {
                if let Some(mut rec) = self.sessions.get_mut(name) {
                    rec.state = SessionState::LoginFailed;
                    rec.login_failure_reason = Some(e.to_string());
                }
                warn!(session = %name, error = %e, "silent re-login failed");
            }
        }
    }

    /// Drain in-flight work and terminate every session.
    pub async fn stop_all(&self) -> Result<(), RelayError> {
        let names: Vec<String> = self.sessions.iter().map(|e| e.name.clone()).collect();
        for name in names {
            // Take the call lock so we don't disconnect mid-call; transient
            // errors from the transport's background cleanup are swallowed,
            // matching the documented expected-on-shutdown behavior.
            if let Some(lock) = self.call_locks.get(&name) {
                let _permit = lock.acquire().await;
                self.client.disconnect(&name).await;
            }
            if let Some(mut rec) = self.sessions.get_mut(&name) {
                if rec.state == SessionState::LoggedIn {
                    rec.state = SessionState::NotLoggedIn;
                }
            }
        }
        Ok(())
    }

    pub fn list_logged_in(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.state.is_logged_in())
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn record(&self, name: &str) -> Option<SessionRecord> {
        self.sessions.get(name).map(|e| e.clone())
    }

    pub async fn enable(&self, name: &str) -> Result<(), RelayError> {
        let mut rec = self
            .sessions
            .get_mut(name)
            .ok_or_else(|| RelayError::SessionNotFound(name.to_string()))?;
        rec.enabled = true;
        if rec.state == SessionState::Disabled {
            rec.state = SessionState::NotLoggedIn;
        }
        Ok(())
    }

    pub async fn disable(&self, name: &str) -> Result<(), RelayError> {
        let logged_in = self.list_logged_in();
        let is_sole = logged_in.len() == 1 && logged_in[0] == name;
        if is_sole {
            return Err(RelayError::LastSessionProtected);
        }

        let mut rec = self
            .sessions
            .get_mut(name)
            .ok_or_else(|| RelayError::SessionNotFound(name.to_string()))?;
        rec.enabled = false;
        rec.state = SessionState::Disabled;
        Ok(())
    }

    /// Mark a session `error` — e.g. on an unrecoverable auth failure. It is
    /// dropped from `list_logged_in` but kept in the pool for inspection.
    pub fn mark_error(&self, name: &str, reason: impl Into<String>) {
        if let Some(mut rec) = self.sessions.get_mut(name) {
            rec.state = SessionState::Error;
            rec.login_failure_reason = Some(reason.into());
        }
        error!(session = %name, "session entered error state");
    }

    pub fn mark_active(&self, name: &str) {
        if let Some(mut rec) = self.sessions.get_mut(name) {
            rec.last_active = Some(Utc::now());
        }
    }

    pub fn caption_cap(&self, name: &str) -> usize {
        match self.sessions.get(name) {
            Some(rec) if rec.is_premium => CAPTION_CAP_PREMIUM,
            _ => CAPTION_CAP_NORMAL,
        }
    }

    /// Lease a session for exclusive use by the caller. Blocks until the
    /// session's single outstanding-call slot is free.
    pub async fn lease(self: &Arc<Self>, name: &str) -> Result<SessionHandle, RelayError> {
        if self.record(name).is_none() {
            return Err(RelayError::SessionNotFound(name.to_string()));
        }
        let lock = self
            .call_locks
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| RelayError::SessionNotFound(name.to_string()))?;
        let permit = lock
            .acquire_owned()
            .await
            .map_err(|_| RelayError::Internal("session call lock closed".to_string()))?;
        Ok(SessionHandle {
            pool: Arc::clone(self),
            client: Arc::clone(&self.client),
            session: name.to_string(),
            _permit: permit,
        })
    }
}

/// A handle scoped to one call (or one sequential stretch of calls) against
/// a session, returned by [`SessionPool::lease`]. Dropping it releases the
/// per-session exclusivity slot.
pub struct SessionHandle {
    pool: Arc<SessionPool>,
    pub client: Arc<dyn RemoteClient>,
    pub session: String,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl SessionHandle {
    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn caption_cap(&self) -> usize {
        self.pool.caption_cap(&self.session)
    }

    pub fn touch(&self) {
        self.pool.mark_active(&self.session);
    }
}

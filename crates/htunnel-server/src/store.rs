//! Session store: the shared mailbox between request handlers and engines.
//!
//! Every session lives in its own async mutex. Handlers and the engine only
//! ever read or modify a session through a [`SessionGuard`], so all access to
//! one session is serialized and a partially applied update is never
//! observable. Dropping the guard releases the session on every exit path,
//! including `?` returns and panics.

use htunnel_core::{Session, TunnelError, TunnelResult};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Opaque session identity taken from the request's session token.
pub type SessionId = String;

/// Session state plus bookkeeping that is not part of the dump.
#[derive(Debug)]
struct SessionEntry {
    state: Session,
    last_activity: Instant,
}

/// Shared handle to one session's state.
///
/// The engine keeps the handle of the session it serves, so a later
/// `destroy` + `create` under the same id never reaches the old engine.
#[derive(Debug, Clone)]
pub struct SessionCell {
    inner: Arc<Mutex<SessionEntry>>,
}

impl SessionCell {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionEntry {
                state: Session::new(),
                last_activity: Instant::now(),
            })),
        }
    }

    /// Wait for exclusive access to the session.
    pub async fn lock(&self) -> SessionGuard {
        SessionGuard {
            inner: self.inner.clone().lock_owned().await,
        }
    }
}

/// Exclusive, scoped access to one session. Released on drop.
pub struct SessionGuard {
    inner: OwnedMutexGuard<SessionEntry>,
}

impl SessionGuard {
    /// Mark the session as used by a client request.
    pub fn touch(&mut self) {
        self.inner.last_activity = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.inner.last_activity.elapsed()
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.inner.state
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.inner.state
    }
}

/// All live sessions, keyed by session id.
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, SessionCell>>,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Look up the session for `id`.
    pub async fn open(&self, id: &str) -> TunnelResult<SessionCell> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TunnelError::SessionNotFound(id.to_string()))
    }

    /// Create a fresh running session for `id`.
    ///
    /// Fails if a running session already exists. A stopped session under
    /// the same id is superseded. Only running sessions count against the
    /// cap: at the cap, stopped sessions are evicted to make room.
    pub async fn create(&self, id: &str) -> TunnelResult<SessionCell> {
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(id) {
            if existing.lock().await.is_running() {
                return Err(TunnelError::SessionExists(id.to_string()));
            }
            debug!(session_id = %id, "superseding stopped session");
        } else if sessions.len() >= self.max_sessions {
            let mut stopped = Vec::new();
            for (other, cell) in sessions.iter() {
                if !cell.lock().await.is_running() {
                    stopped.push(other.clone());
                }
            }
            for other in &stopped {
                sessions.remove(other);
            }
            if !stopped.is_empty() {
                debug!(count = stopped.len(), "evicted stopped sessions");
            }
            if sessions.len() >= self.max_sessions {
                return Err(TunnelError::SessionLimit(self.max_sessions));
            }
        }

        let cell = SessionCell::new();
        sessions.insert(id.to_string(), cell.clone());
        info!(session_id = %id, "session created");
        Ok(cell)
    }

    /// Exclusive access to the session for `id`.
    pub async fn acquire(&self, id: &str) -> TunnelResult<SessionGuard> {
        let cell = self.open(id).await?;
        Ok(cell.lock().await)
    }

    /// Copy of the session state, for diagnostics.
    pub async fn snapshot(&self, id: &str) -> TunnelResult<Session> {
        let guard = self.acquire(id).await?;
        Ok(Session::clone(&guard))
    }

    /// Remove the session. Its engine, if any, sees `running == false` on
    /// its next iteration and closes every socket it owns.
    pub async fn destroy(&self, id: &str) -> TunnelResult<()> {
        let cell = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| TunnelError::SessionNotFound(id.to_string()))?;
        cell.lock().await.stop();
        info!(session_id = %id, "session destroyed");
        Ok(())
    }

    /// Destroy sessions no request has touched for longer than `max_idle`.
    ///
    /// Returns the ids of the sessions that were removed.
    pub async fn reap_idle(&self, max_idle: Duration) -> Vec<SessionId> {
        let mut sessions = self.sessions.write().await;
        let mut removed = Vec::new();

        for (id, cell) in sessions.iter() {
            let mut guard = cell.lock().await;
            let idle = guard.idle_for();
            if idle > max_idle {
                warn!(session_id = %id, idle_secs = idle.as_secs(), "session expired (idle)");
                guard.stop();
                removed.push(id.clone());
            }
        }
        for id in &removed {
            sessions.remove(id);
        }

        if !removed.is_empty() {
            debug!(count = removed.len(), "GC removed sessions");
        }
        removed
    }

    /// Clear `running` on every session, leaving the state in place.
    /// Returns how many were running.
    pub async fn stop_all(&self) -> usize {
        let sessions = self.sessions.read().await;
        let mut stopped = 0;
        for cell in sessions.values() {
            let mut guard = cell.lock().await;
            if guard.is_running() {
                guard.stop();
                stopped += 1;
            }
        }
        stopped
    }

    /// Get the number of sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

// Session registry for the streamable HTTP transport

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Messages buffered per session before `push` starts failing
const STREAM_BUFFER: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session capacity reached ({0} sessions)")]
    AtCapacity(usize),

    #[error("session not found")]
    NotFound,

    #[error("session has no open stream")]
    NoStream,

    #[error("session stream is full")]
    StreamFull,
}

struct Session {
    last_seen: Instant,
    stream: Option<mpsc::Sender<Value>>,
    closed: CancellationToken,
}

impl Session {
    fn new(now: Instant) -> Self {
        Self {
            last_seen: now,
            stream: None,
            closed: CancellationToken::new(),
        }
    }
}

/// Receiving half of a session stream
pub struct SessionStream {
    pub messages: mpsc::Receiver<Value>,
    /// Cancelled when the session is evicted or deleted
    pub closed: CancellationToken,
}

/// Bounded, idle-expiring set of sessions keyed by an opaque token.
///
/// The lock is only held for map operations, never across an await.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    timeout: Duration,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(timeout: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout,
            max_sessions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expired(&self, session: &Session, now: Instant) -> bool {
        now.duration_since(session.last_seen) >= self.timeout
    }

    /// Create a session and return its token
    pub fn create(&self) -> Result<String, SessionError> {
        let now = Instant::now();
        let mut sessions = self.lock();
        if sessions.len() >= self.max_sessions {
            // Make room from sessions the reaper has not reached yet.
            self.evict_idle(&mut sessions, now);
            if sessions.len() >= self.max_sessions {
                return Err(SessionError::AtCapacity(self.max_sessions));
            }
        }

        let id = Uuid::new_v4().to_string();
        sessions.insert(id.clone(), Session::new(now));
        Ok(id)
    }

    /// Refresh a session; an expired one is evicted and reported missing
    pub fn touch(&self, id: &str) -> Result<(), SessionError> {
        let now = Instant::now();
        let mut sessions = self.lock();
        let session = sessions.get_mut(id).ok_or(SessionError::NotFound)?;
        if !self.expired(session, now) {
            session.last_seen = now;
            return Ok(());
        }

        if let Some(session) = sessions.remove(id) {
            session.closed.cancel();
        }
        tracing::debug!(session = %id, "Evicted expired session on lookup");
        Err(SessionError::NotFound)
    }

    /// Open the server-to-client stream. A second open replaces the first,
    /// which then ends.
    pub fn open_stream(&self, id: &str) -> Result<SessionStream, SessionError> {
        self.touch(id)?;
        let mut sessions = self.lock();
        let session = sessions.get_mut(id).ok_or(SessionError::NotFound)?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        session.stream = Some(tx);
        Ok(SessionStream {
            messages: rx,
            closed: session.closed.clone(),
        })
    }

    /// Queue a message for the session's open stream
    pub fn push(&self, id: &str, message: Value) -> Result<(), SessionError> {
        let sessions = self.lock();
        let session = sessions.get(id).ok_or(SessionError::NotFound)?;
        let stream = session.stream.as_ref().ok_or(SessionError::NoStream)?;
        stream.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::StreamFull,
            mpsc::error::TrySendError::Closed(_) => SessionError::NoStream,
        })
    }

    pub fn remove(&self, id: &str) -> bool {
        match self.lock().remove(id) {
            Some(session) => {
                session.closed.cancel();
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Evict every idle session; returns how many went
    pub fn reap(&self) -> usize {
        let mut sessions = self.lock();
        self.evict_idle(&mut sessions, Instant::now())
    }

    fn evict_idle(&self, sessions: &mut HashMap<String, Session>, now: Instant) -> usize {
        let before = sessions.len();
        sessions.retain(|_, s| {
            let keep = !self.expired(s, now);
            if !keep {
                s.closed.cancel();
            }
            keep
        });
        before - sessions.len()
    }

    /// Half the idle timeout, kept within one second and one minute
    pub fn reap_interval(&self) -> Duration {
        (self.timeout / 2).clamp(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Periodically reap until `shutdown` fires
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.reap_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = store.reap();
                        if evicted > 0 {
                            tracing::info!(evicted, remaining = store.count(), "Reaped idle sessions");
                        }
                    }
                }
            }
        })
    }
}

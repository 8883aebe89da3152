//! Session record and state machine.
//!
//! A session pairs one engine process with the local bookkeeping around it.
//! The key is assigned locally and never changes; the engine-side uid arrives
//! with the first protocol message and may differ across engine restarts.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::comm_log::CommunicationLog;
use crate::process::EngineProcess;
use crate::program::Program;

/// Locally assigned session identifier (`session-N`), stable for the
/// session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(Arc<str>);

impl SessionKey {
    pub(crate) fn from_index(index: u64) -> Self {
        Self(format!("session-{index}").into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
    /// Process spawned, no protocol traffic yet.
    Starting,
    /// A command is executing.
    Running,
    /// Engine is idle and will accept the next command.
    Ready,
    /// Process died, stderr went critical, or the protocol broke down.
    Error,
    /// Explicitly terminated.
    Terminated,
}

impl SessionState {
    /// Terminal states accept no further commands and are never left.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Terminated)
    }
}

/// One engine process plus its local bookkeeping.
pub struct Session {
    key: SessionKey,
    process: EngineProcess,
    state: RwLock<SessionState>,
    engine_uid: RwLock<Option<String>>,
    status: Mutex<Option<String>>,
    program: Mutex<Option<Program>>,
    log: CommunicationLog,
    started_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    protocol_errors: AtomicU32,
}

impl Session {
    pub(crate) fn new(key: SessionKey, process: EngineProcess) -> Self {
        Self {
            key,
            process,
            state: RwLock::new(SessionState::Starting),
            engine_uid: RwLock::new(None),
            status: Mutex::new(None),
            program: Mutex::new(None),
            log: CommunicationLog::default(),
            started_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            protocol_errors: AtomicU32::new(0),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub(crate) fn process(&self) -> &EngineProcess {
        &self.process
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Apply a state change. Terminal states are absorbing. When the state
    /// actually changes, `notify` runs while the lock is still held so
    /// observers see transitions in order.
    pub(crate) fn transition<F>(&self, new: SessionState, notify: F) -> bool
    where
        F: FnOnce(SessionState, SessionState),
    {
        let mut state = self.state.write();
        let old = *state;
        if old == new || old.is_terminal() {
            return false;
        }
        *state = new;
        notify(old, new);
        true
    }

    pub fn engine_uid(&self) -> Option<String> {
        self.engine_uid.read().clone()
    }

    /// Record the engine-assigned uid. First writer wins; returns true when
    /// this call set it.
    pub(crate) fn note_engine_uid(&self, uid: &str) -> bool {
        let mut slot = self.engine_uid.write();
        if slot.is_none() {
            *slot = Some(uid.to_string());
            true
        } else {
            false
        }
    }

    /// Most recent human-readable status line.
    pub fn status(&self) -> Option<String> {
        self.status.lock().clone()
    }

    pub(crate) fn set_status(&self, message: impl Into<String>) {
        *self.status.lock() = Some(message.into());
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last wire traffic in either direction.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn log(&self) -> &CommunicationLog {
        &self.log
    }

    pub(crate) fn program(&self) -> &Mutex<Option<Program>> {
        &self.program
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub(crate) fn protocol_errors(&self) -> &AtomicU32 {
        &self.protocol_errors
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            key: self.key.clone(),
            engine_uid: self.engine_uid(),
            state: self.state(),
            status: self.status(),
            started_at: self.started_at,
            pid: self.process.pid(),
            program: self
                .program
                .lock()
                .as_ref()
                .map(|p| p.state_description().to_string()),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("engine_uid", &self.engine_uid())
            .finish_non_exhaustive()
    }
}

/// Read-only view of a session, safe to hand to any caller.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub engine_uid: Option<String>,
    pub state: SessionState,
    pub status: Option<String>,
    pub started_at: DateTime<Utc>,
    pub pid: Option<u32>,
    /// State description of the attached program, if any.
    pub program: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_strings() {
        let key = SessionKey::from_index(7);
        assert_eq!(key.as_str(), "session-7");
        assert_eq!(key.to_string(), "session-7");
        assert_eq!(key, key.clone());
    }

    #[test]
    fn terminal_states_are_identified() {
        assert!(SessionState::Error.is_terminal());
        assert!(SessionState::Terminated.is_terminal());
        assert!(!SessionState::Starting.is_terminal());
        assert!(!SessionState::Running.is_terminal());
        assert!(!SessionState::Ready.is_terminal());
    }
}

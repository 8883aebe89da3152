//! Pattern-filtered pub/sub for session lifecycle events.
//!
//! Consumers subscribe with NATS-style subject patterns and receive only the
//! events they asked for:
//! - `*` matches exactly one token: `session.*` matches `session.state`
//! - `>` matches one or more tokens (only at end): `session.>` matches all
//! - exact subjects match themselves
//!
//! Delivery rides a broadcast channel, so publishing never blocks the
//! protocol reader. A subscriber that falls behind is lagged (and warned),
//! never waited on.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use kalix_protocol::TaskKind;

use crate::session::{SessionKey, SessionState};

/// Check if a subject matches a pattern.
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            ">" => {
                // `>` must be last and consumes one or more remaining tokens
                return pi == pattern_tokens.len() - 1;
            }
            "*" => {
                pi += 1;
                si += 1;
            }
            token => {
                if token != subject_tokens[si] {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    pi == pattern_tokens.len() && si == subject_tokens.len()
}

/// Trait for payloads that know their subject.
pub trait HasSubject {
    fn subject(&self) -> &str;
}

/// A message published to the flow bus.
#[derive(Clone, Debug)]
pub struct FlowMessage<T> {
    /// The subject (derived from the payload).
    pub subject: String,
    pub payload: T,
    /// When this message was published.
    pub timestamp: Instant,
}

impl<T: HasSubject> FlowMessage<T> {
    fn new(payload: T) -> Self {
        let subject = payload.subject().to_string();
        Self {
            subject,
            payload,
            timestamp: Instant::now(),
        }
    }
}

/// Session lifecycle events.
#[derive(Clone, Debug)]
pub enum SessionFlow {
    /// A session changed state. `old_state` is None for the creation event.
    StateChanged {
        session: SessionKey,
        old_state: Option<SessionState>,
        new_state: SessionState,
        message: Option<String>,
    },
    /// Progress on a session's executing command.
    Progress {
        session: SessionKey,
        command: String,
        fraction: f64,
        task: Option<TaskKind>,
        data: Vec<f64>,
    },
    /// A raw stderr line from the engine.
    StderrLine { session: SessionKey, line: String },
    /// A protocol-level log message from the engine.
    EngineLog { session: SessionKey, line: String },
}

impl SessionFlow {
    pub fn subject(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "session.state",
            Self::Progress { .. } => "session.progress",
            Self::StderrLine { .. } => "session.stderr",
            Self::EngineLog { .. } => "session.log",
        }
    }

    pub fn session(&self) -> &SessionKey {
        match self {
            Self::StateChanged { session, .. }
            | Self::Progress { session, .. }
            | Self::StderrLine { session, .. }
            | Self::EngineLog { session, .. } => session,
        }
    }
}

impl HasSubject for SessionFlow {
    fn subject(&self) -> &str {
        SessionFlow::subject(self)
    }
}

/// Type-parameterized pub/sub bus for one flow domain.
#[derive(Debug)]
pub struct FlowBus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<FlowMessage<T>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> FlowBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + HasSubject + 'static> FlowBus<T> {
    /// Publish a payload. Returns how many subscribers received it.
    /// Never blocks; with no subscribers the message is dropped.
    pub fn publish(&self, payload: T) -> usize {
        self.tx.send(FlowMessage::new(payload)).unwrap_or(0)
    }

    /// Subscribe to messages whose subject matches `pattern`.
    pub fn subscribe(&self, pattern: &str) -> Subscription<T> {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone + Send + 'static> Clone for FlowBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

/// A subscription with pattern filtering.
pub struct Subscription<T: Clone> {
    pattern: String,
    rx: broadcast::Receiver<FlowMessage<T>>,
}

impl<T: Clone> Subscription<T> {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next matching message, waiting if necessary.
    /// Returns None once the bus is gone.
    pub async fn recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "session flow subscription lagged behind"
                    );
                }
            }
        }
    }

    /// Receive the next matching message without blocking.
    pub fn try_recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "session flow subscription lagged behind"
                    );
                }
            }
        }
    }
}

impl<T: Clone> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Thread-safe handle to a SessionFlow bus.
pub type SharedSessionFlowBus = Arc<FlowBus<SessionFlow>>;

pub fn shared_session_flow_bus(capacity: usize) -> SharedSessionFlowBus {
    Arc::new(FlowBus::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::from_index(1)
    }

    #[test]
    fn pattern_matching_exact() {
        assert!(matches_pattern("session.state", "session.state"));
        assert!(!matches_pattern("session.state", "session.progress"));
        assert!(!matches_pattern("session.state", "session.state.extra"));
    }

    #[test]
    fn pattern_matching_single_wildcard() {
        assert!(matches_pattern("session.*", "session.state"));
        assert!(matches_pattern("session.*", "session.stderr"));
        assert!(!matches_pattern("session.*", "session.a.b"));
        assert!(!matches_pattern("session.*", "engine.state"));
        assert!(matches_pattern("*.state", "session.state"));
    }

    #[test]
    fn pattern_matching_tail_wildcard() {
        assert!(matches_pattern("session.>", "session.state"));
        assert!(matches_pattern("session.>", "session.a.b.c"));
        assert!(!matches_pattern("session.>", "engine.state"));
        assert!(matches_pattern(">", "session.state"));
    }

    #[test]
    fn flow_subjects() {
        let state = SessionFlow::StateChanged {
            session: key(),
            old_state: None,
            new_state: SessionState::Starting,
            message: None,
        };
        assert_eq!(state.subject(), "session.state");
        assert_eq!(state.session().as_str(), "session-1");

        let progress = SessionFlow::Progress {
            session: key(),
            command: "run_simulation".into(),
            fraction: 0.5,
            task: Some(TaskKind::Simulation),
            data: vec![],
        };
        assert_eq!(progress.subject(), "session.progress");
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscriber() {
        let bus: FlowBus<SessionFlow> = FlowBus::new(16);
        let mut sub = bus.subscribe("session.*");

        let bus_clone = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            bus_clone.publish(SessionFlow::StateChanged {
                session: key(),
                old_state: None,
                new_state: SessionState::Starting,
                message: Some("Engine starting".into()),
            });
        });

        let msg = tokio::time::timeout(std::time::Duration::from_millis(500), sub.recv())
            .await
            .expect("timeout")
            .expect("bus closed");
        assert_eq!(msg.subject, "session.state");
    }

    #[tokio::test]
    async fn subscriptions_filter_by_pattern() {
        let bus = shared_session_flow_bus(16);
        let mut state_sub = bus.subscribe("session.state");
        let mut stderr_sub = bus.subscribe("session.stderr");

        bus.publish(SessionFlow::StateChanged {
            session: key(),
            old_state: Some(SessionState::Starting),
            new_state: SessionState::Ready,
            message: None,
        });
        bus.publish(SessionFlow::StderrLine {
            session: key(),
            line: "warning".into(),
        });

        let msg = state_sub.try_recv().expect("state event");
        assert_eq!(msg.subject, "session.state");
        assert!(state_sub.try_recv().is_none());

        let msg = stderr_sub.try_recv().expect("stderr event");
        assert_eq!(msg.subject, "session.stderr");
        assert!(stderr_sub.try_recv().is_none());
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = shared_session_flow_bus(4);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(
            bus.publish(SessionFlow::EngineLog {
                session: key(),
                line: "hello".into()
            }),
            0
        );
    }
}

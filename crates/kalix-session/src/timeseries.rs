//! Coalesced, cached `get_result` fetches.
//!
//! Many callers want the same output series at once (plots, tables, exports),
//! and a fetch is expensive for long runs. The first caller for a given
//! (session, series) pair becomes the leader and issues the command; everyone
//! else joins its pending entry and shares the reply. Completed series stay
//! cached until explicitly invalidated or their session closes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use kalix_protocol::{EngineEvent, SeriesData, SeriesPayload, commands};

use crate::error::SessionError;
use crate::manager::{SeriesRouting, SessionManager};
use crate::session::SessionKey;

type SeriesReply = Result<Arc<SeriesData>, SessionError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesRequestKey {
    session: SessionKey,
    series: String,
}

struct PendingRequest {
    waiters: Vec<oneshot::Sender<SeriesReply>>,
    issued_at: Instant,
}

/// Deduplicating front-end for time-series fetches.
pub struct TimeSeriesRequestManager {
    sessions: Arc<SessionManager>,
    pending: DashMap<SeriesRequestKey, PendingRequest>,
    completed: DashMap<SeriesRequestKey, Arc<SeriesData>>,
    /// Series names in the order their fetch commands were issued, per
    /// session. The engine works its queue sequentially and replies in that
    /// order, so an error reply (which names no series) is attributed to the
    /// oldest fetch still in flight.
    in_flight: DashMap<SessionKey, VecDeque<String>>,
}

impl TimeSeriesRequestManager {
    /// Build the manager and register it as the series router. Must be called
    /// from within a tokio runtime.
    pub fn new(sessions: Arc<SessionManager>) -> Arc<Self> {
        let this = Arc::new(Self {
            sessions,
            pending: DashMap::new(),
            completed: DashMap::new(),
            in_flight: DashMap::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        this.sessions.set_series_router(tx);
        let router = this.clone();
        tokio::spawn(async move {
            router.route(rx).await;
        });
        this
    }

    /// Fetch one series, coalescing with any identical in-flight request and
    /// serving from cache when possible.
    pub async fn request_series(
        &self,
        session: &SessionKey,
        series: &str,
    ) -> Result<Arc<SeriesData>, SessionError> {
        let key = SeriesRequestKey {
            session: session.clone(),
            series: series.to_string(),
        };
        if let Some(cached) = self.completed.get(&key) {
            return Ok(cached.value().clone());
        }

        let (tx, rx) = oneshot::channel();
        let leader = match self.pending.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().waiters.push(tx);
                false
            }
            Entry::Vacant(entry) => {
                // a reply may have landed between the cache check above and
                // taking this entry; the cache is populated before the
                // pending entry is cleared, so this re-check cannot miss
                if let Some(cached) = self.completed.get(&key) {
                    return Ok(cached.value().clone());
                }
                entry.insert(PendingRequest {
                    waiters: vec![tx],
                    issued_at: Instant::now(),
                });
                true
            }
        };

        if leader {
            debug!(session = %session, series, "issuing series fetch");
            self.in_flight
                .entry(session.clone())
                .or_default()
                .push_back(series.to_string());
            let command = commands::get_result(series);
            if let Err(e) = self.sessions.send(session, &command).await {
                // joiners that raced in see a closed channel; the leader
                // reports the send failure directly
                self.pending.remove(&key);
                self.unqueue(session, series);
                return Err(e);
            }
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(SessionError::ChannelClosed),
        }
    }

    /// Cached copy, if a fetch already completed.
    pub fn cached(&self, session: &SessionKey, series: &str) -> Option<Arc<SeriesData>> {
        self.completed
            .get(&SeriesRequestKey {
                session: session.clone(),
                series: series.to_string(),
            })
            .map(|entry| entry.value().clone())
    }

    pub fn is_request_in_progress(&self, session: &SessionKey, series: &str) -> bool {
        self.pending.contains_key(&SeriesRequestKey {
            session: session.clone(),
            series: series.to_string(),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop every cached series for a session, typically after a re-run
    /// changes the outputs. In-flight requests are left to complete. Returns
    /// how many entries were dropped.
    pub fn clear_cache_for_session(&self, session: &SessionKey) -> usize {
        let before = self.completed.len();
        self.completed.retain(|key, _| key.session != *session);
        before - self.completed.len()
    }

    async fn route(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SeriesRouting>) {
        while let Some(message) = rx.recv().await {
            match message {
                SeriesRouting::Response { session, event } => {
                    self.handle_response(&session, event);
                }
                SeriesRouting::SessionClosed { session } => {
                    self.fail_session(&session);
                }
            }
        }
    }

    fn handle_response(&self, session: &SessionKey, event: EngineEvent) {
        match event {
            EngineEvent::Result { payload, .. } => {
                let payload = match SeriesPayload::from_value(&payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(session = %session, error = %e, "series payload rejected");
                        // nothing to name the series by; the reply answers
                        // the oldest fetch in flight
                        if let Some(series) = self.pop_oldest_in_flight(session) {
                            self.fail_one(session, &series, &e.to_string());
                        }
                        return;
                    }
                };
                let name = payload.series_name.clone();
                self.unqueue(session, &name);

                let series = match payload.into_series() {
                    Ok(series) => series,
                    Err(e) => {
                        warn!(session = %session, series = %name, error = %e, "series payload rejected");
                        self.fail_one(session, &name, &e.to_string());
                        return;
                    }
                };
                let key = SeriesRequestKey {
                    session: session.clone(),
                    series: name,
                };
                let shared = Arc::new(series);
                // cache first; leader election re-checks the cache after
                // finding no pending entry
                self.completed.insert(key.clone(), shared.clone());
                if let Some((_, pending)) = self.pending.remove(&key) {
                    debug!(
                        session = %session,
                        series = %key.series,
                        waiters = pending.waiters.len(),
                        elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
                        "series fetch completed"
                    );
                    for waiter in pending.waiters {
                        let _ = waiter.send(Ok(shared.clone()));
                    }
                }
            }
            // the error reply does not name a series; fetches are answered
            // in issue order, so it belongs to the oldest one in flight
            EngineEvent::Error { message, .. } => match self.pop_oldest_in_flight(session) {
                Some(series) => self.fail_one(session, &series, &message),
                None => {
                    warn!(session = %session, "engine error with no series fetch in flight: {message}");
                }
            },
            other => {
                debug!(session = %session, event = other.tag(), "unexpected series routing event");
            }
        }
    }

    fn pop_oldest_in_flight(&self, session: &SessionKey) -> Option<String> {
        self.in_flight
            .get_mut(session)
            .and_then(|mut queue| queue.pop_front())
    }

    fn unqueue(&self, session: &SessionKey, series: &str) {
        if let Some(mut queue) = self.in_flight.get_mut(session) {
            if let Some(pos) = queue.iter().position(|s| s == series) {
                queue.remove(pos);
            }
        }
    }

    /// Fail the pending request for one series, leaving the rest untouched.
    fn fail_one(&self, session: &SessionKey, series: &str, message: &str) {
        let key = SeriesRequestKey {
            session: session.clone(),
            series: series.to_string(),
        };
        if let Some((_, pending)) = self.pending.remove(&key) {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(SessionError::Remote {
                    command: Some(commands::GET_RESULT.to_string()),
                    message: message.to_string(),
                }));
            }
        }
    }

    fn fail_session(&self, session: &SessionKey) {
        self.in_flight.remove(session);
        let keys: Vec<SeriesRequestKey> = self
            .pending
            .iter()
            .filter(|entry| entry.key().session == *session)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(SessionError::Terminated(session.clone())));
                }
            }
        }
        self.clear_cache_for_session(session);
    }
}

impl std::fmt::Debug for TimeSeriesRequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSeriesRequestManager")
            .field("pending", &self.pending.len())
            .field("completed", &self.completed.len())
            .finish_non_exhaustive()
    }
}

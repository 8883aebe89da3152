//! Session registry and the per-session monitor tasks.
//!
//! The manager owns every live session, spawns the stdout/stderr readers for
//! each, decodes protocol traffic, feeds attached programs, and publishes
//! lifecycle events on the shared flow bus. Time-series responses are handed
//! off to the series router instead of being interpreted here.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use kalix_protocol::{EngineEvent, Inbound, Outbound, commands, decode_line, encode_line, looks_like_json};

use crate::bus::{SessionFlow, SharedSessionFlowBus, Subscription, shared_session_flow_bus};
use crate::comm_log::LogDirection;
use crate::config::EngineConfig;
use crate::error::SessionError;
use crate::process::{EngineOutput, EngineProcess};
use crate::program::{OptimisationProgram, Program, ProgramReaction, ProgramReport, RunModelProgram};
use crate::session::{Session, SessionKey, SessionSnapshot, SessionState};

/// Consecutive undecodable stdout lines tolerated before the session is
/// declared broken. Interleaved plain text (banners, stray prints) is skipped
/// without counting; only lines that look like JSON but fail to decode count.
const PROTOCOL_ERROR_BUDGET: u32 = 25;

/// How long a terminated engine gets to exit on its own before being killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

const CRITICAL_STDERR_MARKERS: [&str; 3] = ["fatal", "critical", "panicked"];

fn is_critical_stderr(line: &str) -> bool {
    let lower = line.to_lowercase();
    CRITICAL_STDERR_MARKERS.iter().any(|m| lower.contains(m))
        || lower.trim_start().starts_with("error:")
}

/// Messages handed to the time-series layer.
#[derive(Debug)]
pub enum SeriesRouting {
    /// A `get_result` response (result or error) from the engine.
    Response {
        session: SessionKey,
        event: EngineEvent,
    },
    /// The session reached a terminal state; fail whatever is pending.
    SessionClosed { session: SessionKey },
}

/// Registry of live sessions.
pub struct SessionManager {
    sessions: DashMap<SessionKey, Arc<Session>>,
    bus: SharedSessionFlowBus,
    series_router: RwLock<Option<mpsc::UnboundedSender<SeriesRouting>>>,
    next_index: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            bus: shared_session_flow_bus(256),
            series_router: RwLock::new(None),
            next_index: AtomicU64::new(1),
        })
    }

    /// Subscribe to lifecycle events (`session.state`, `session.progress`,
    /// `session.stderr`, `session.log`).
    pub fn subscribe(&self, pattern: &str) -> Subscription<SessionFlow> {
        self.bus.subscribe(pattern)
    }

    pub(crate) fn set_series_router(&self, tx: mpsc::UnboundedSender<SeriesRouting>) {
        *self.series_router.write() = Some(tx);
    }

    fn route_series(&self, message: SeriesRouting) {
        if let Some(tx) = self.series_router.read().as_ref() {
            let _ = tx.send(message);
        }
    }

    /// Spawn an engine and start monitoring it. The returned key identifies
    /// the session from here on.
    pub fn create_session(self: &Arc<Self>, config: &EngineConfig) -> Result<SessionKey, SessionError> {
        let key = SessionKey::from_index(self.next_index.fetch_add(1, Ordering::Relaxed));
        let (process, output) = EngineProcess::spawn(config)?;
        info!(session = %key, pid = ?process.pid(), command = %config.command, "engine spawned");

        let session = Arc::new(Session::new(key.clone(), process));
        self.sessions.insert(key.clone(), session.clone());
        self.bus.publish(SessionFlow::StateChanged {
            session: key.clone(),
            old_state: None,
            new_state: SessionState::Starting,
            message: Some("Engine starting".into()),
        });

        let manager = self.clone();
        let stdout_session = session.clone();
        let EngineOutput { stdout, stderr } = output;
        tokio::spawn(async move {
            manager.monitor_stdout(stdout_session, stdout).await;
        });
        let manager = self.clone();
        tokio::spawn(async move {
            manager.monitor_stderr(session, stderr).await;
        });

        Ok(key)
    }

    fn get(&self, key: &SessionKey) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::NotFound(key.clone()))
    }

    pub fn snapshot(&self, key: &SessionKey) -> Result<SessionSnapshot, SessionError> {
        Ok(self.get(key)?.snapshot())
    }

    pub fn active_sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Apply a state change, publishing it when it takes effect. Terminal
    /// transitions are also routed to the series layer so pending requests
    /// fail promptly.
    fn transition(&self, session: &Session, new: SessionState, message: Option<String>) -> bool {
        let changed = session.transition(new, |old, new| {
            self.bus.publish(SessionFlow::StateChanged {
                session: session.key().clone(),
                old_state: Some(old),
                new_state: new,
                message: message.clone(),
            });
        });
        if changed {
            if let Some(message) = message {
                session.set_status(message);
            }
            if new.is_terminal() {
                self.route_series(SeriesRouting::SessionClosed {
                    session: session.key().clone(),
                });
            }
        }
        changed
    }

    /// Send a protocol message to a session.
    pub async fn send(&self, key: &SessionKey, message: &Outbound) -> Result<(), SessionError> {
        let session = self.get(key)?;
        self.send_to(&session, message).await
    }

    async fn send_to(&self, session: &Arc<Session>, message: &Outbound) -> Result<(), SessionError> {
        let state = session.state();
        if state.is_terminal() {
            return Err(SessionError::NotReady {
                key: session.key().clone(),
                state,
            });
        }
        let line = encode_line(message);
        session.log().record(LogDirection::Sent, &line);
        session.process().write_line(&line).await?;
        session.touch();
        if let Some(name) = message.command_name() {
            self.transition(session, SessionState::Running, Some(format!("Running {name}")));
        }
        Ok(())
    }

    /// Attach a run-model program and kick it off.
    pub async fn start_run_model(
        &self,
        key: &SessionKey,
        model_text: &str,
    ) -> Result<(), SessionError> {
        let session = self.get(key)?;
        let first = {
            let mut slot = session.program().lock();
            if slot.as_ref().is_some_and(Program::is_active) {
                return Err(SessionError::ProgramActive(key.clone()));
            }
            let program = RunModelProgram::new(model_text);
            let first = program.initial_command();
            *slot = Some(Program::RunModel(program));
            first
        };
        if let Err(e) = self.send_to(&session, &first).await {
            if let Some(program) = session.program().lock().as_mut() {
                program.mark_failed(&e.to_string());
            }
            return Err(e);
        }
        Ok(())
    }

    /// Attach an optimisation program and kick it off. The optimisation run
    /// itself waits for [`run_optimisation`](Self::run_optimisation).
    pub async fn start_optimisation(
        &self,
        key: &SessionKey,
        model_ini: &str,
    ) -> Result<(), SessionError> {
        let session = self.get(key)?;
        let first = {
            let mut slot = session.program().lock();
            if slot.as_ref().is_some_and(Program::is_active) {
                return Err(SessionError::ProgramActive(key.clone()));
            }
            let program = OptimisationProgram::new(model_ini);
            let first = program.initial_command();
            *slot = Some(Program::Optimisation(program));
            first
        };
        if let Err(e) = self.send_to(&session, &first).await {
            if let Some(program) = session.program().lock().as_mut() {
                program.mark_failed(&e.to_string());
            }
            return Err(e);
        }
        Ok(())
    }

    /// Start the optimisation run on a session whose optimisation program has
    /// finished loading the model.
    pub async fn run_optimisation(
        &self,
        key: &SessionKey,
        config_ini: &str,
    ) -> Result<(), SessionError> {
        let session = self.get(key)?;
        let message = {
            let mut slot = session.program().lock();
            match slot.as_mut() {
                Some(Program::Optimisation(program)) => program.run(config_ini)?,
                _ => {
                    return Err(SessionError::ProgramNotReady(
                        "no optimisation program attached".into(),
                    ));
                }
            }
        };
        if let Err(e) = self.send_to(&session, &message).await {
            if let Some(program) = session.program().lock().as_mut() {
                program.mark_failed(&e.to_string());
            }
            return Err(e);
        }
        Ok(())
    }

    /// Current program summary for a session, if one is attached.
    pub fn program_report(&self, key: &SessionKey) -> Result<Option<ProgramReport>, SessionError> {
        let session = self.get(key)?;
        let report = session.program().lock().as_ref().map(Program::report);
        Ok(report)
    }

    /// Ask the engine to exit, then kill it if it lingers. Idempotent.
    pub async fn terminate_session(&self, key: &SessionKey) -> Result<(), SessionError> {
        let session = self.get(key)?;
        if session.state() == SessionState::Terminated {
            return Ok(());
        }

        let process = session.process();
        if !process.is_closed() {
            let line = encode_line(&Outbound::Terminate);
            session.log().record(LogDirection::Sent, &line);
            // best effort; the process may already be gone
            if let Err(e) = process.write_line(&line).await {
                debug!(session = %key, error = %e, "terminate message not delivered");
            }
            process.mark_closed();
            if !process.wait_with_timeout(TERMINATE_GRACE).await {
                warn!(session = %key, "engine ignored terminate, killing");
            }
        }
        process.kill().await;
        self.transition(&session, SessionState::Terminated, Some("Session terminated".into()));
        Ok(())
    }

    /// Drop a finished session from the registry. Refused while the session
    /// is still live.
    pub fn remove_session(&self, key: &SessionKey) -> Result<SessionSnapshot, SessionError> {
        let session = self.get(key)?;
        if !session.state().is_terminal() {
            return Err(SessionError::StillActive(key.clone()));
        }
        self.sessions.remove(key);
        Ok(session.snapshot())
    }

    /// Kill every session and clear the registry.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        futures::future::join_all(sessions.iter().map(|s| s.process().kill())).await;
        for session in &sessions {
            self.transition(session, SessionState::Terminated, Some("Shutdown".into()));
        }
        self.sessions.clear();
    }

    async fn monitor_stdout(
        self: Arc<Self>,
        session: Arc<Session>,
        mut lines: tokio::io::Lines<tokio::io::BufReader<tokio::process::ChildStdout>>,
    ) {
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(session = %session.key(), error = %e, "stdout read failed");
                    break;
                }
            };
            session.log().record(LogDirection::Stdout, &line);
            session.touch();

            if !looks_like_json(&line) {
                debug!(session = %session.key(), line = %line, "non-protocol stdout");
                continue;
            }

            match decode_line(&line) {
                Ok(inbound) => {
                    session.protocol_errors().store(0, Ordering::Relaxed);
                    let Inbound { uid, event } = inbound;
                    if let Some(uid) = uid {
                        if session.note_engine_uid(&uid) {
                            info!(session = %session.key(), uid = %uid, "engine uid captured");
                        }
                    }
                    self.route_event(&session, event).await;
                }
                Err(e) => {
                    warn!(session = %session.key(), error = %e, line = %line, "undecodable protocol line");
                    let count = session.protocol_errors().fetch_add(1, Ordering::Relaxed) + 1;
                    if count >= PROTOCOL_ERROR_BUDGET {
                        error!(session = %session.key(), count, "protocol error budget exhausted");
                        session.process().kill().await;
                        self.transition(
                            &session,
                            SessionState::Error,
                            Some("Protocol breakdown on stdout".into()),
                        );
                        break;
                    }
                }
            }
        }

        // EOF without a terminate means the engine died under us.
        if !session.process().is_closed() && !session.state().is_terminal() {
            warn!(session = %session.key(), "engine stdout closed unexpectedly");
            session.process().kill().await;
            self.transition(
                &session,
                SessionState::Error,
                Some("Engine process exited unexpectedly".into()),
            );
        }
    }

    async fn route_event(&self, session: &Arc<Session>, event: EngineEvent) {
        // get_result traffic belongs to the series layer, not the programs
        if event.command() == Some(commands::GET_RESULT)
            && matches!(event, EngineEvent::Result { .. } | EngineEvent::Error { .. })
        {
            self.route_series(SeriesRouting::Response {
                session: session.key().clone(),
                event,
            });
            return;
        }

        let (reaction, settled) = {
            let mut slot = session.program().lock();
            match slot.as_mut() {
                Some(program) => {
                    let reaction = program.on_event(&event);
                    let settled = if program.is_completed() {
                        Some((program.state_description(), program.failure().map(str::to_owned)))
                    } else {
                        None
                    };
                    (reaction, settled)
                }
                None => (ProgramReaction::Unhandled, None),
            }
        };

        // the generic ready transition runs before any follow-up send so
        // observers see Running -> Ready -> Running, never a skipped step
        if let EngineEvent::Ready { return_code } = &event {
            self.transition(
                session,
                SessionState::Ready,
                Some(format!("Ready ({return_code})")),
            );
        }

        match reaction {
            ProgramReaction::Unhandled => match &event {
                EngineEvent::Ready { .. } => {}
                EngineEvent::Busy { command, .. } => {
                    session.set_status(format!("Executing {command}"));
                }
                EngineEvent::Log { message } => {
                    self.bus.publish(SessionFlow::EngineLog {
                        session: session.key().clone(),
                        line: message.clone(),
                    });
                }
                EngineEvent::Error { command, message } => {
                    warn!(session = %session.key(), command = ?command, "engine error: {message}");
                    session.set_status(format!("Error: {message}"));
                }
                other => {
                    debug!(session = %session.key(), event = other.tag(), "event with no consumer");
                }
            },
            ProgramReaction::Handled => {}
            ProgramReaction::Send(message) => {
                if let Err(e) = self.send_to(session, &message).await {
                    warn!(session = %session.key(), error = %e, "program follow-up send failed");
                    if let Some(program) = session.program().lock().as_mut() {
                        program.mark_failed(&e.to_string());
                    }
                }
            }
            ProgramReaction::Progress(report) => {
                self.bus.publish(SessionFlow::Progress {
                    session: session.key().clone(),
                    command: report.command,
                    fraction: report.fraction,
                    task: report.task,
                    data: report.data,
                });
            }
        }

        if let Some((description, failure)) = settled {
            match failure {
                Some(failure) => session.set_status(format!("Failed: {failure}")),
                None => session.set_status(description),
            }
        }
    }

    async fn monitor_stderr(
        self: Arc<Self>,
        session: Arc<Session>,
        mut lines: tokio::io::Lines<tokio::io::BufReader<tokio::process::ChildStderr>>,
    ) {
        while let Ok(Some(line)) = lines.next_line().await {
            session.log().record(LogDirection::Stderr, &line);
            self.bus.publish(SessionFlow::StderrLine {
                session: session.key().clone(),
                line: line.clone(),
            });

            // some engine builds emit protocol log records on stderr
            if looks_like_json(&line) {
                if let Ok(inbound) = decode_line(&line) {
                    self.route_event(&session, inbound.event).await;
                    continue;
                }
            }

            if is_critical_stderr(&line) {
                error!(session = %session.key(), line = %line, "critical engine stderr");
                session.process().kill().await;
                self.transition(
                    &session,
                    SessionState::Error,
                    Some(format!("Engine failure: {line}")),
                );
                break;
            }
        }
    }
}

//! High-level facade a host application holds.
//!
//! Bundles the session registry, the time-series layer and the engine
//! configuration behind one handle, and adds detection and cleanup of
//! engine processes this manager does not own (leftovers from crashed
//! hosts or manual runs).

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, Signal, System};
use tracing::{info, warn};

use kalix_protocol::Outbound;

use crate::bus::{SessionFlow, Subscription};
use crate::config::EngineConfig;
use crate::error::SessionError;
use crate::manager::SessionManager;
use crate::program::ProgramReport;
use crate::session::{SessionKey, SessionSnapshot};
use crate::timeseries::TimeSeriesRequestManager;

/// How long a foreign engine gets to exit after SIGTERM before SIGKILL.
const FOREIGN_KILL_GRACE: Duration = Duration::from_secs(5);

/// An engine process not owned by this manager.
#[derive(Debug, Clone)]
pub struct ForeignEngine {
    pub pid: u32,
    pub name: String,
    pub command: Vec<String>,
    pub run_time_secs: u64,
}

/// Entry point for running models and optimisations against engine sessions.
pub struct TaskManager {
    sessions: Arc<SessionManager>,
    series: Arc<TimeSeriesRequestManager>,
    engine: EngineConfig,
}

impl TaskManager {
    /// Must be called from within a tokio runtime.
    pub fn new(engine: EngineConfig) -> Self {
        let sessions = SessionManager::new();
        let series = TimeSeriesRequestManager::new(sessions.clone());
        Self {
            sessions,
            series,
            engine,
        }
    }

    fn session_config(&self) -> EngineConfig {
        self.engine.clone().arg("new-session")
    }

    /// Spawn a session and start running the given model text in it.
    pub async fn run_model_from_memory(&self, model_text: &str) -> Result<SessionKey, SessionError> {
        let key = self.sessions.create_session(&self.session_config())?;
        self.sessions.start_run_model(&key, model_text).await?;
        Ok(key)
    }

    /// Spawn a session and load a model for optimisation. The run starts
    /// later via [`run_optimisation`](Self::run_optimisation).
    pub async fn start_optimisation(&self, model_ini: &str) -> Result<SessionKey, SessionError> {
        let key = self.sessions.create_session(&self.session_config())?;
        self.sessions.start_optimisation(&key, model_ini).await?;
        Ok(key)
    }

    pub async fn run_optimisation(
        &self,
        key: &SessionKey,
        config_ini: &str,
    ) -> Result<(), SessionError> {
        self.sessions.run_optimisation(key, config_ini).await
    }

    pub async fn send_command(&self, key: &SessionKey, message: &Outbound) -> Result<(), SessionError> {
        self.sessions.send(key, message).await
    }

    pub async fn terminate_session(&self, key: &SessionKey) -> Result<(), SessionError> {
        self.sessions.terminate_session(key).await
    }

    pub fn remove_session(&self, key: &SessionKey) -> Result<SessionSnapshot, SessionError> {
        self.sessions.remove_session(key)
    }

    pub fn active_sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions.active_sessions()
    }

    pub fn snapshot(&self, key: &SessionKey) -> Result<SessionSnapshot, SessionError> {
        self.sessions.snapshot(key)
    }

    pub fn program_report(&self, key: &SessionKey) -> Result<Option<ProgramReport>, SessionError> {
        self.sessions.program_report(key)
    }

    pub fn subscribe(&self, pattern: &str) -> Subscription<SessionFlow> {
        self.sessions.subscribe(pattern)
    }

    pub async fn request_series(
        &self,
        key: &SessionKey,
        series: &str,
    ) -> Result<Arc<kalix_protocol::SeriesData>, SessionError> {
        self.series.request_series(key, series).await
    }

    pub fn cached_series(&self, key: &SessionKey, series: &str) -> Option<Arc<kalix_protocol::SeriesData>> {
        self.series.cached(key, series)
    }

    pub fn clear_series_cache(&self, key: &SessionKey) -> usize {
        self.series.clear_cache_for_session(key)
    }

    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }

    fn managed_pids(&self) -> Vec<u32> {
        self.sessions
            .active_sessions()
            .into_iter()
            .filter_map(|snapshot| snapshot.pid)
            .collect()
    }

    /// Find engine processes on this machine that no session here owns.
    pub fn detect_foreign_engines(&self) -> Vec<ForeignEngine> {
        let mut system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        system.refresh_processes();

        let managed = self.managed_pids();
        let own_pid = std::process::id();

        system
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                let pid = pid.as_u32();
                if pid == own_pid || managed.contains(&pid) {
                    return None;
                }
                if !process.name().to_lowercase().contains("kalix") {
                    return None;
                }
                Some(ForeignEngine {
                    pid,
                    name: process.name().to_string(),
                    command: process.cmd().to_vec(),
                    run_time_secs: process.run_time(),
                })
            })
            .collect()
    }

    /// Terminate a foreign engine: SIGTERM, a grace window, then SIGKILL.
    /// Refuses pids that are managed here or not engine processes at all.
    pub async fn kill_foreign_engine(&self, pid: u32) -> Result<(), SessionError> {
        if self.managed_pids().contains(&pid) {
            return Err(SessionError::NotForeign(pid));
        }

        let mut system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        system.refresh_processes();
        let sys_pid = Pid::from_u32(pid);
        let Some(process) = system.process(sys_pid) else {
            return Err(SessionError::NotForeign(pid));
        };
        if !process.name().to_lowercase().contains("kalix") {
            return Err(SessionError::NotForeign(pid));
        }

        info!(pid, name = %process.name(), "terminating foreign engine");
        if !process.kill_with(Signal::Term).unwrap_or(false) {
            process.kill();
        }

        let deadline = tokio::time::Instant::now() + FOREIGN_KILL_GRACE;
        loop {
            tokio::time::sleep(Duration::from_millis(200)).await;
            system.refresh_processes();
            match system.process(sys_pid) {
                None => return Ok(()),
                Some(process) if tokio::time::Instant::now() >= deadline => {
                    warn!(pid, "foreign engine ignored SIGTERM, killing");
                    process.kill();
                    return Ok(());
                }
                Some(_) => {}
            }
        }
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("engine", &self.engine.command)
            .field("active_sessions", &self.sessions.active_sessions().len())
            .finish_non_exhaustive()
    }
}

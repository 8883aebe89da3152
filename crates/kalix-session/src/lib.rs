//! # kalix-session
//!
//! Process and session management for `kalixcli` engines.
//!
//! A session owns exactly one engine process and drives it over the stdio
//! protocol from `kalix-protocol`. The [`SessionManager`] keeps the registry
//! and the per-session monitor tasks; [`Program`]s run multi-step flows (load
//! a model then simulate, or load then optimise); the
//! [`TimeSeriesRequestManager`] coalesces and caches `get_result` fetches;
//! and [`TaskManager`] is the facade a host application holds.
//!
//! Lifecycle events fan out on a pattern-filtered broadcast bus (subjects
//! `session.state`, `session.progress`, `session.stderr`, `session.log`), so
//! slow consumers can never stall the protocol reader.

pub mod bus;
pub mod comm_log;
pub mod config;
pub mod error;
pub mod manager;
pub mod process;
pub mod program;
pub mod session;
pub mod task;
pub mod timeseries;

pub use bus::{
    FlowBus, FlowMessage, HasSubject, SessionFlow, SharedSessionFlowBus, Subscription,
    matches_pattern, shared_session_flow_bus,
};
pub use comm_log::{CommunicationLog, LogDirection, LogEntry};
pub use config::EngineConfig;
pub use error::SessionError;
pub use manager::{SeriesRouting, SessionManager};
pub use process::{EngineOutput, EngineProcess};
pub use program::{
    OptimisationProgram, Program, ProgramReaction, ProgramReport, ProgressReport, RunModelProgram,
};
pub use session::{Session, SessionKey, SessionSnapshot, SessionState};
pub use task::{ForeignEngine, TaskManager};
pub use timeseries::TimeSeriesRequestManager;

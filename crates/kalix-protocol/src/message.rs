//! Message model for the stdio protocol.
//!
//! Inbound messages (engine to driver) decode into [`Inbound`], pairing the
//! engine-assigned session uid with an [`EngineEvent`]. Outbound messages
//! (driver to engine) are the closed [`Outbound`] set.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of task the engine reports progress for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum TaskKind {
    #[serde(rename = "sim")]
    #[strum(serialize = "sim")]
    Simulation,
    #[serde(rename = "cal")]
    #[strum(serialize = "cal")]
    Calibration,
    #[serde(rename = "load")]
    #[strum(serialize = "load")]
    Loading,
    #[serde(rename = "proc")]
    #[strum(serialize = "proc")]
    Processing,
    #[serde(rename = "build")]
    #[strum(serialize = "build")]
    Building,
}

/// Exit status of the previous command, carried by ready messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Success,
    CommandError,
    Interrupted,
    Unknown(i64),
}

impl ReturnCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::CommandError,
            2 => Self::Interrupted,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::Success => 0,
            Self::CommandError => 1,
            Self::Interrupted => 2,
            Self::Unknown(other) => other,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A progress report for a long-running command.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Steps completed so far.
    pub current: u64,
    /// Total steps, zero when the engine cannot estimate.
    pub total: u64,
    /// What kind of work is progressing.
    pub task: Option<TaskKind>,
    /// Task-specific numeric data, e.g. the best objective during calibration.
    pub data: Vec<f64>,
}

impl ProgressUpdate {
    /// Completion as a fraction in `[0, 1]`. Zero when the total is unknown.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current as f64 / self.total as f64).clamp(0.0, 1.0)
        }
    }

    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }
}

/// An event reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The engine is idle and will accept the next command.
    Ready { return_code: ReturnCode },
    /// A command was accepted and is executing.
    Busy { command: String, interruptible: bool },
    /// Progress on the executing command.
    Progress(ProgressUpdate),
    /// A command finished and produced a payload.
    Result {
        command: String,
        success: bool,
        exec_ms: Option<f64>,
        payload: Value,
    },
    /// A command was interrupted by a stop request.
    Stopped {
        command: Option<String>,
        exec_ms: Option<f64>,
    },
    /// The engine reported an error. The message is opaque display text.
    Error {
        command: Option<String>,
        message: String,
    },
    /// Diagnostic line from the engine.
    Log { message: String },
}

impl EngineEvent {
    /// Compact wire tag for this event kind.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "rdy",
            Self::Busy { .. } => "bsy",
            Self::Progress(_) => "prg",
            Self::Result { .. } => "res",
            Self::Stopped { .. } => "stp",
            Self::Error { .. } => "err",
            Self::Log { .. } => "log",
        }
    }

    /// The command this event refers to, when it names one.
    pub fn command(&self) -> Option<&str> {
        match self {
            Self::Busy { command, .. } | Self::Result { command, .. } => Some(command),
            Self::Stopped { command, .. } | Self::Error { command, .. } => command.as_deref(),
            _ => None,
        }
    }
}

/// A decoded inbound message: engine uid plus the event itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Engine-assigned session identifier, present on most messages.
    pub uid: Option<String>,
    pub event: EngineEvent,
}

/// A message the driver sends to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Run a named command with JSON parameters.
    Command { name: String, parameters: Value },
    /// Interrupt the executing command.
    Stop { reason: Option<String> },
    /// Ask a side-channel question without disturbing the command loop.
    Query { query: String },
    /// Ask the engine to exit.
    Terminate,
}

impl Outbound {
    pub fn command(name: impl Into<String>, parameters: Value) -> Self {
        Self::Command {
            name: name.into(),
            parameters,
        }
    }

    pub fn command_name(&self) -> Option<&str> {
        match self {
            Self::Command { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Self::Command { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_codes_round_trip() {
        assert_eq!(ReturnCode::from_code(0), ReturnCode::Success);
        assert_eq!(ReturnCode::from_code(1), ReturnCode::CommandError);
        assert_eq!(ReturnCode::from_code(2), ReturnCode::Interrupted);
        assert_eq!(ReturnCode::from_code(7), ReturnCode::Unknown(7));
        assert_eq!(ReturnCode::Unknown(7).code(), 7);
        assert!(ReturnCode::Success.is_success());
        assert!(!ReturnCode::Interrupted.is_success());
    }

    #[test]
    fn task_kind_parses_wire_names() {
        assert_eq!("sim".parse::<TaskKind>().unwrap(), TaskKind::Simulation);
        assert_eq!("cal".parse::<TaskKind>().unwrap(), TaskKind::Calibration);
        assert!("simulate".parse::<TaskKind>().is_err());
        assert_eq!(TaskKind::Loading.to_string(), "load");
    }

    #[test]
    fn fraction_handles_unknown_total() {
        let update = ProgressUpdate {
            current: 33,
            total: 100,
            task: Some(TaskKind::Simulation),
            data: vec![],
        };
        assert!((update.fraction() - 0.33).abs() < f64::EPSILON);

        let unknown = ProgressUpdate {
            current: 5,
            total: 0,
            task: None,
            data: vec![],
        };
        assert_eq!(unknown.fraction(), 0.0);

        let overshoot = ProgressUpdate {
            current: 120,
            total: 100,
            task: None,
            data: vec![],
        };
        assert_eq!(overshoot.fraction(), 1.0);
    }

    #[test]
    fn event_command_accessor() {
        let result = EngineEvent::Result {
            command: "run_simulation".into(),
            success: true,
            exec_ms: None,
            payload: Value::Null,
        };
        assert_eq!(result.command(), Some("run_simulation"));
        assert_eq!(result.tag(), "res");

        let ready = EngineEvent::Ready {
            return_code: ReturnCode::Success,
        };
        assert_eq!(ready.command(), None);
    }
}

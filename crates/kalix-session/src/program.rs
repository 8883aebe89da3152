//! Multi-step command flows ("programs") a session can run.
//!
//! A program is a small state machine fed every decoded engine event for its
//! session. It never talks to the process itself; it answers with a
//! [`ProgramReaction`] and the session manager executes it. This keeps the
//! flows synchronous, lock-friendly and trivially testable.

use serde_json::Value;

use kalix_protocol::{EngineEvent, Outbound, SimulationSummary, TaskKind, commands};

use crate::error::SessionError;

/// What a program wants done after absorbing an engine event.
#[derive(Debug)]
pub enum ProgramReaction {
    /// The event was not relevant to the program.
    Unhandled,
    /// Event consumed, nothing further to do.
    Handled,
    /// Event consumed; send this follow-up message to the engine.
    Send(Outbound),
    /// Event consumed; publish this progress report.
    Progress(ProgressReport),
}

#[derive(Debug, Clone)]
pub struct ProgressReport {
    pub command: String,
    pub fraction: f64,
    pub task: Option<TaskKind>,
    pub data: Vec<f64>,
}

impl ProgressReport {
    fn new(command: &str, update: &kalix_protocol::ProgressUpdate) -> Self {
        Self {
            command: command.to_string(),
            fraction: update.fraction(),
            task: update.task,
            data: update.data.clone(),
        }
    }
}

/// The closed set of program flows.
#[derive(Debug)]
pub enum Program {
    RunModel(RunModelProgram),
    Optimisation(OptimisationProgram),
}

impl Program {
    pub fn on_event(&mut self, event: &EngineEvent) -> ProgramReaction {
        match self {
            Self::RunModel(p) => p.on_event(event),
            Self::Optimisation(p) => p.on_event(event),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.is_completed()
    }

    /// Completed covers both success and failure; check [`is_failed`].
    ///
    /// [`is_failed`]: Program::is_failed
    pub fn is_completed(&self) -> bool {
        match self {
            Self::RunModel(p) => matches!(p.phase, RunPhase::Completed | RunPhase::Failed),
            Self::Optimisation(p) => matches!(p.phase, OptPhase::Completed | OptPhase::Failed),
        }
    }

    pub fn is_failed(&self) -> bool {
        match self {
            Self::RunModel(p) => p.phase == RunPhase::Failed,
            Self::Optimisation(p) => p.phase == OptPhase::Failed,
        }
    }

    pub fn state_description(&self) -> &'static str {
        match self {
            Self::RunModel(p) => p.state_description(),
            Self::Optimisation(p) => p.state_description(),
        }
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            Self::RunModel(p) => p.failure(),
            Self::Optimisation(p) => p.failure(),
        }
    }

    pub(crate) fn mark_failed(&mut self, reason: &str) {
        match self {
            Self::RunModel(p) => {
                p.phase = RunPhase::Failed;
                p.failure = Some(reason.to_string());
            }
            Self::Optimisation(p) => {
                p.phase = OptPhase::Failed;
                p.failure = Some(reason.to_string());
            }
        }
    }

    /// Point-in-time summary, safe to hand to callers.
    pub fn report(&self) -> ProgramReport {
        match self {
            Self::RunModel(p) => ProgramReport::RunModel {
                state: p.state_description(),
                outputs: p.outputs_generated().to_vec(),
                failure: p.failure.clone(),
            },
            Self::Optimisation(p) => ProgramReport::Optimisation {
                state: p.state_description(),
                parameters: p.parameters.clone(),
                result: p.result.clone(),
                warning: p.warning.clone(),
                failure: p.failure.clone(),
            },
        }
    }
}

/// Read-only program summary.
#[derive(Debug, Clone)]
pub enum ProgramReport {
    RunModel {
        state: &'static str,
        outputs: Vec<String>,
        failure: Option<String>,
    },
    Optimisation {
        state: &'static str,
        parameters: Option<Vec<String>>,
        result: Option<Value>,
        warning: Option<String>,
        failure: Option<String>,
    },
}

// The engine wraps errors in layered prefixes ("Command execution error:
// Simulation error: ..."). Strip until stable before showing anyone.
const REDUNDANT_ERROR_PREFIXES: [&str; 3] = [
    "Command execution error: ",
    "Configuration failed: ",
    "Simulation error: ",
];

fn clean_error_message(message: &str) -> &str {
    let mut cleaned = message;
    loop {
        let mut changed = false;
        for prefix in REDUNDANT_ERROR_PREFIXES {
            if let Some(rest) = cleaned.strip_prefix(prefix) {
                cleaned = rest;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    if cleaned.is_empty() { message } else { cleaned }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    /// load_model_string sent, waiting for its result.
    Starting,
    /// Model accepted, waiting for the ready signal.
    LoadingModel,
    /// run_simulation sent.
    RunningSimulation,
    Completed,
    Failed,
}

/// Load a model from memory, run it, collect the output summary.
#[derive(Debug)]
pub struct RunModelProgram {
    phase: RunPhase,
    model_text: String,
    summary: Option<SimulationSummary>,
    failure: Option<String>,
}

impl RunModelProgram {
    pub fn new(model_text: impl Into<String>) -> Self {
        Self {
            phase: RunPhase::Starting,
            model_text: model_text.into(),
            summary: None,
            failure: None,
        }
    }

    /// First command of the flow; the caller sends it right after attaching.
    pub fn initial_command(&self) -> Outbound {
        commands::load_model_string(&self.model_text)
    }

    pub fn model_text(&self) -> &str {
        &self.model_text
    }

    /// Output series names the simulation produced.
    pub fn outputs_generated(&self) -> &[String] {
        self.summary
            .as_ref()
            .map(|s| s.outputs.as_slice())
            .unwrap_or(&[])
    }

    pub fn summary(&self) -> Option<&SimulationSummary> {
        self.summary.as_ref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn state_description(&self) -> &'static str {
        match self.phase {
            RunPhase::Starting => "Starting",
            RunPhase::LoadingModel => "Loading Model",
            RunPhase::RunningSimulation => "Running Simulation",
            RunPhase::Completed => "Completed",
            RunPhase::Failed => "Failed",
        }
    }

    fn fail(&mut self, context: &str, message: &str) -> ProgramReaction {
        self.phase = RunPhase::Failed;
        self.failure = Some(format!("{context}: {}", clean_error_message(message)));
        ProgramReaction::Handled
    }

    pub fn on_event(&mut self, event: &EngineEvent) -> ProgramReaction {
        match self.phase {
            RunPhase::Starting => match event {
                EngineEvent::Result { command, success, .. }
                    if command == commands::LOAD_MODEL_STRING =>
                {
                    if *success {
                        self.phase = RunPhase::LoadingModel;
                        ProgramReaction::Handled
                    } else {
                        self.fail("Model loading failed", "command reported failure")
                    }
                }
                EngineEvent::Error { message, .. } => self.fail("Model loading failed", message),
                _ => ProgramReaction::Unhandled,
            },
            RunPhase::LoadingModel => match event {
                EngineEvent::Ready { .. } => {
                    self.phase = RunPhase::RunningSimulation;
                    ProgramReaction::Send(commands::run_simulation())
                }
                EngineEvent::Error { message, .. } => self.fail("Model loading failed", message),
                _ => ProgramReaction::Unhandled,
            },
            RunPhase::RunningSimulation => match event {
                EngineEvent::Progress(update) => {
                    ProgramReaction::Progress(ProgressReport::new(commands::RUN_SIMULATION, update))
                }
                EngineEvent::Result { command, success, payload, .. }
                    if command == commands::RUN_SIMULATION =>
                {
                    if *success {
                        self.summary = Some(SimulationSummary::from_result_payload(payload));
                        self.phase = RunPhase::Completed;
                        ProgramReaction::Handled
                    } else {
                        self.fail("Simulation failed", "command reported failure")
                    }
                }
                // stopped early still counts as a completed run
                EngineEvent::Stopped { .. } => {
                    self.phase = RunPhase::Completed;
                    ProgramReaction::Handled
                }
                EngineEvent::Error { message, .. } => self.fail("Simulation failed", message),
                _ => ProgramReaction::Unhandled,
            },
            RunPhase::Completed | RunPhase::Failed => ProgramReaction::Unhandled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptPhase {
    /// load_model_string sent, waiting for its result.
    Starting,
    /// Model accepted, waiting for the ready signal.
    AwaitingReady,
    /// get_optimisable_params sent.
    FetchingParams,
    /// Waiting for the caller to supply a configuration and run.
    Ready,
    /// run_optimisation sent.
    Optimising,
    Completed,
    Failed,
}

/// Load a model, fetch its optimisable parameters, then run an optimisation
/// once the caller supplies a configuration.
#[derive(Debug)]
pub struct OptimisationProgram {
    phase: OptPhase,
    model_ini: String,
    parameters: Option<Vec<String>>,
    result: Option<Value>,
    warning: Option<String>,
    failure: Option<String>,
}

impl OptimisationProgram {
    pub fn new(model_ini: impl Into<String>) -> Self {
        Self {
            phase: OptPhase::Starting,
            model_ini: model_ini.into(),
            parameters: None,
            result: None,
            warning: None,
            failure: None,
        }
    }

    pub fn initial_command(&self) -> Outbound {
        commands::load_model_string(&self.model_ini)
    }

    /// Parameters the optimiser may adjust, once fetched.
    pub fn parameters(&self) -> Option<&[String]> {
        self.parameters.as_deref()
    }

    /// Final optimisation result payload.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_ready_to_run(&self) -> bool {
        self.phase == OptPhase::Ready
    }

    pub fn state_description(&self) -> &'static str {
        match self.phase {
            OptPhase::Starting => "Starting",
            OptPhase::AwaitingReady => "Loading Model",
            OptPhase::FetchingParams => "Fetching Parameters",
            OptPhase::Ready => "Ready",
            OptPhase::Optimising => "Optimising",
            OptPhase::Completed => "Completed",
            OptPhase::Failed => "Failed",
        }
    }

    /// Build the run command. Legal only once the model is loaded and the
    /// parameter fetch has settled.
    pub fn run(&mut self, config_ini: &str) -> Result<Outbound, SessionError> {
        if self.phase != OptPhase::Ready {
            return Err(SessionError::ProgramNotReady(
                self.state_description().to_string(),
            ));
        }
        self.phase = OptPhase::Optimising;
        Ok(commands::run_optimisation(config_ini))
    }

    fn fail(&mut self, context: &str, message: &str) -> ProgramReaction {
        self.phase = OptPhase::Failed;
        self.failure = Some(format!("{context}: {}", clean_error_message(message)));
        ProgramReaction::Handled
    }

    pub fn on_event(&mut self, event: &EngineEvent) -> ProgramReaction {
        match self.phase {
            OptPhase::Starting => match event {
                EngineEvent::Result { command, success, .. }
                    if command == commands::LOAD_MODEL_STRING =>
                {
                    if *success {
                        self.phase = OptPhase::AwaitingReady;
                        ProgramReaction::Handled
                    } else {
                        self.fail("Model loading failed", "command reported failure")
                    }
                }
                EngineEvent::Error { message, .. } => self.fail("Model loading failed", message),
                _ => ProgramReaction::Unhandled,
            },
            OptPhase::AwaitingReady => match event {
                EngineEvent::Ready { .. } => {
                    self.phase = OptPhase::FetchingParams;
                    ProgramReaction::Send(commands::get_optimisable_params())
                }
                EngineEvent::Error { message, .. } => self.fail("Model loading failed", message),
                _ => ProgramReaction::Unhandled,
            },
            OptPhase::FetchingParams => match event {
                EngineEvent::Result { command, payload, .. }
                    if command == commands::GET_OPTIMISABLE_PARAMS =>
                {
                    self.parameters = payload
                        .get("parameters")
                        .and_then(Value::as_array)
                        .map(|names| {
                            names
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_owned)
                                .collect()
                        });
                    self.phase = OptPhase::Ready;
                    ProgramReaction::Handled
                }
                // parameters are a convenience; failing to fetch them does
                // not block the optimisation itself
                EngineEvent::Error { message, .. } => {
                    self.warning = Some(format!(
                        "Could not fetch parameters: {}",
                        clean_error_message(message)
                    ));
                    self.phase = OptPhase::Ready;
                    ProgramReaction::Handled
                }
                _ => ProgramReaction::Unhandled,
            },
            OptPhase::Ready => ProgramReaction::Unhandled,
            OptPhase::Optimising => match event {
                EngineEvent::Progress(update) => ProgramReaction::Progress(ProgressReport::new(
                    commands::RUN_OPTIMISATION,
                    update,
                )),
                EngineEvent::Result { command, success, payload, .. }
                    if command == commands::RUN_OPTIMISATION =>
                {
                    if *success {
                        self.result = Some(payload.clone());
                        self.phase = OptPhase::Completed;
                        ProgramReaction::Handled
                    } else {
                        self.fail("Optimisation failed", "command reported failure")
                    }
                }
                EngineEvent::Stopped { .. } => {
                    self.phase = OptPhase::Completed;
                    ProgramReaction::Handled
                }
                EngineEvent::Error { message, .. } => self.fail("Optimisation failed", message),
                _ => ProgramReaction::Unhandled,
            },
            OptPhase::Completed | OptPhase::Failed => ProgramReaction::Unhandled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kalix_protocol::{ProgressUpdate, ReturnCode};
    use serde_json::json;

    fn ready() -> EngineEvent {
        EngineEvent::Ready {
            return_code: ReturnCode::Success,
        }
    }

    fn result(command: &str, payload: Value) -> EngineEvent {
        EngineEvent::Result {
            command: command.into(),
            success: true,
            exec_ms: Some(1.0),
            payload,
        }
    }

    fn error(message: &str) -> EngineEvent {
        EngineEvent::Error {
            command: None,
            message: message.into(),
        }
    }

    #[test]
    fn run_model_happy_path() {
        let mut program = RunModelProgram::new("[node]\nname = x\n");
        assert_eq!(program.state_description(), "Starting");
        assert_eq!(
            program.initial_command().command_name(),
            Some(commands::LOAD_MODEL_STRING)
        );

        // irrelevant events pass through untouched
        assert!(matches!(
            program.on_event(&ready()),
            ProgramReaction::Unhandled
        ));

        assert!(matches!(
            program.on_event(&result(commands::LOAD_MODEL_STRING, json!({}))),
            ProgramReaction::Handled
        ));
        assert_eq!(program.state_description(), "Loading Model");

        match program.on_event(&ready()) {
            ProgramReaction::Send(message) => {
                assert_eq!(message.command_name(), Some(commands::RUN_SIMULATION));
            }
            other => panic!("expected follow-up command, got {other:?}"),
        }

        let update = EngineEvent::Progress(ProgressUpdate {
            current: 50,
            total: 100,
            task: Some(TaskKind::Simulation),
            data: vec![],
        });
        match program.on_event(&update) {
            ProgramReaction::Progress(report) => {
                assert_eq!(report.command, commands::RUN_SIMULATION);
                assert!((report.fraction - 0.5).abs() < f64::EPSILON);
            }
            other => panic!("expected progress, got {other:?}"),
        }

        let payload = json!({"ts": {"len": 10, "outputs": ["node.a.dsflow"]}});
        assert!(matches!(
            program.on_event(&result(commands::RUN_SIMULATION, payload)),
            ProgramReaction::Handled
        ));
        assert_eq!(program.state_description(), "Completed");
        assert_eq!(program.outputs_generated(), ["node.a.dsflow".to_string()]);
        assert!(program.failure().is_none());

        // nothing more is consumed after completion
        assert!(matches!(
            program.on_event(&ready()),
            ProgramReaction::Unhandled
        ));
    }

    #[test]
    fn run_model_strips_layered_error_prefixes() {
        let mut program = RunModelProgram::new("model");
        program.on_event(&result(commands::LOAD_MODEL_STRING, json!({})));
        program.on_event(&ready());

        program.on_event(&error(
            "Command execution error: Simulation error: water balance violated",
        ));
        let wrapped = Program::RunModel(program);
        assert!(wrapped.is_failed());
        let failure = wrapped.failure().unwrap();
        assert!(failure.contains("water balance violated"));
        assert!(!failure.contains("Command execution error"));
    }

    #[test]
    fn run_model_stop_counts_as_completed() {
        let mut program = RunModelProgram::new("model");
        program.on_event(&result(commands::LOAD_MODEL_STRING, json!({})));
        program.on_event(&ready());
        program.on_event(&EngineEvent::Stopped {
            command: Some(commands::RUN_SIMULATION.into()),
            exec_ms: Some(4.0),
        });
        assert_eq!(program.state_description(), "Completed");
        assert!(program.failure().is_none());
    }

    #[test]
    fn run_model_accepts_legacy_outputs_field() {
        let mut program = RunModelProgram::new("model");
        program.on_event(&result(commands::LOAD_MODEL_STRING, json!({})));
        program.on_event(&ready());
        program.on_event(&result(
            commands::RUN_SIMULATION,
            json!({"outputs_generated": ["node.legacy.dsflow"]}),
        ));
        assert_eq!(program.outputs_generated().len(), 1);
    }

    #[test]
    fn optimisation_gates_run_on_readiness() {
        let mut program = OptimisationProgram::new("model");
        assert!(matches!(
            program.run("[optimiser]"),
            Err(SessionError::ProgramNotReady(_))
        ));

        program.on_event(&result(commands::LOAD_MODEL_STRING, json!({})));
        match program.on_event(&ready()) {
            ProgramReaction::Send(message) => {
                assert_eq!(message.command_name(), Some(commands::GET_OPTIMISABLE_PARAMS));
            }
            other => panic!("expected params fetch, got {other:?}"),
        }

        program.on_event(&result(
            commands::GET_OPTIMISABLE_PARAMS,
            json!({"parameters": ["node.store.capacity", "node.route.k"]}),
        ));
        assert!(program.is_ready_to_run());
        assert_eq!(program.parameters().unwrap().len(), 2);

        let message = program.run("[optimiser]\nmethod = sce\n").unwrap();
        assert_eq!(message.command_name(), Some(commands::RUN_OPTIMISATION));
        assert_eq!(program.state_description(), "Optimising");

        program.on_event(&result(
            commands::RUN_OPTIMISATION,
            json!({"best_objective": 0.42}),
        ));
        assert_eq!(program.state_description(), "Completed");
        assert_eq!(program.result().unwrap()["best_objective"], 0.42);
    }

    #[test]
    fn optimisation_continues_without_parameters() {
        let mut program = OptimisationProgram::new("model");
        program.on_event(&result(commands::LOAD_MODEL_STRING, json!({})));
        program.on_event(&ready());
        program.on_event(&error("Command execution error: no parameter metadata"));

        assert!(program.is_ready_to_run());
        assert!(program.parameters().is_none());
        assert!(program.warning().unwrap().contains("no parameter metadata"));
        assert!(program.run("[optimiser]").is_ok());
    }

    #[test]
    fn optimisation_load_failure_is_terminal() {
        let mut program = OptimisationProgram::new("model");
        program.on_event(&error("Configuration failed: bad ini"));
        let wrapped = Program::Optimisation(program);
        assert!(wrapped.is_failed());
        assert!(!wrapped.is_active());
        assert!(wrapped.failure().unwrap().contains("bad ini"));
    }

    #[test]
    fn clean_error_message_is_stable_on_odd_input() {
        assert_eq!(clean_error_message("plain"), "plain");
        assert_eq!(
            clean_error_message("Command execution error: Command execution error: x"),
            "x"
        );
        // stripping everything falls back to the original
        assert_eq!(
            clean_error_message("Command execution error: "),
            "Command execution error: "
        );
    }
}

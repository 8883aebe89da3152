use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Launch configuration for an engine process.
///
/// The executable path arrives resolved from the host; this crate has no
/// opinion on where engines are installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executable to run (resolved path, or a name on PATH).
    pub command: String,
    /// Arguments passed to the engine.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the engine process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory; engine inherits ours when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl EngineConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

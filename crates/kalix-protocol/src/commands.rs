//! Typed builders for the engine command set.
//!
//! Command and parameter names mirror the engine's registry; building them
//! here keeps string literals out of the session layer.

use serde_json::json;

use crate::message::Outbound;

pub const LOAD_MODEL_STRING: &str = "load_model_string";
pub const LOAD_MODEL_FILE: &str = "load_model_file";
pub const RUN_SIMULATION: &str = "run_simulation";
pub const RUN_OPTIMISATION: &str = "run_optimisation";
pub const GET_OPTIMISABLE_PARAMS: &str = "get_optimisable_params";
pub const GET_RESULT: &str = "get_result";
pub const TEST_PROGRESS: &str = "test_progress";

/// Load a model from INI text held in memory.
pub fn load_model_string(model_ini: &str) -> Outbound {
    Outbound::command(LOAD_MODEL_STRING, json!({ "model_ini": model_ini }))
}

/// Load a model from a file path visible to the engine process.
pub fn load_model_file(model_path: &str) -> Outbound {
    Outbound::command(LOAD_MODEL_FILE, json!({ "model_path": model_path }))
}

/// Run the loaded model over its full period.
pub fn run_simulation() -> Outbound {
    Outbound::command(RUN_SIMULATION, json!({}))
}

/// Start an optimisation with the given configuration (INI text).
pub fn run_optimisation(config_ini: &str) -> Outbound {
    Outbound::command(RUN_OPTIMISATION, json!({ "config": config_ini }))
}

/// List the parameters of the loaded model that an optimiser may adjust.
pub fn get_optimisable_params() -> Outbound {
    Outbound::command(GET_OPTIMISABLE_PARAMS, json!({}))
}

/// Fetch a named output series in CSV form.
pub fn get_result(series_name: &str) -> Outbound {
    Outbound::command(
        GET_RESULT,
        json!({ "series_name": series_name, "format": "csv" }),
    )
}

/// Diagnostic command: report progress for roughly `duration_seconds`.
pub fn test_progress(duration_seconds: u64) -> Outbound {
    Outbound::command(TEST_PROGRESS, json!({ "duration_seconds": duration_seconds }))
}

/// Interrupt the executing command.
pub fn stop(reason: Option<&str>) -> Outbound {
    Outbound::Stop {
        reason: reason.map(str::to_owned),
    }
}

/// Ask the engine to exit cleanly.
pub fn terminate() -> Outbound {
    Outbound::Terminate
}

pub fn query_state() -> Outbound {
    Outbound::Query {
        query: "get_state".into(),
    }
}

pub fn query_version() -> Outbound {
    Outbound::Query {
        query: "get_version".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_line;
    use serde_json::Value;

    fn encoded(message: &Outbound) -> Value {
        serde_json::from_str(&encode_line(message)).unwrap()
    }

    #[test]
    fn load_model_string_carries_the_ini_text() {
        let value = encoded(&load_model_string("[inputs]\nrain = data.csv\n"));
        assert_eq!(value["c"], LOAD_MODEL_STRING);
        assert_eq!(value["p"]["model_ini"], "[inputs]\nrain = data.csv\n");
    }

    #[test]
    fn get_result_requests_csv() {
        let value = encoded(&get_result("node.outlet.dsflow"));
        assert_eq!(value["c"], GET_RESULT);
        assert_eq!(value["p"]["series_name"], "node.outlet.dsflow");
        assert_eq!(value["p"]["format"], "csv");
    }

    #[test]
    fn run_optimisation_wraps_config() {
        let value = encoded(&run_optimisation("[optimiser]\nmethod = sce\n"));
        assert_eq!(value["c"], RUN_OPTIMISATION);
        assert_eq!(value["p"]["config"], "[optimiser]\nmethod = sce\n");
    }

    #[test]
    fn queries_use_the_query_channel() {
        let value = encoded(&query_state());
        assert_eq!(value["m"], "query");
        assert_eq!(value["q"], "get_state");
    }
}

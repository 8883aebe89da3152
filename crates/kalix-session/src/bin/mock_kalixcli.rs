//! Stand-in engine for integration tests.
//!
//! Speaks the compact stdio protocol well enough to exercise the session
//! layer: greeting, busy/progress/result sequences for the model and
//! optimisation commands, and canned CSV series. Behavior is tweaked through
//! environment variables so each spawned process can misbehave differently:
//!
//! - `MOCK_GARBAGE_LINES=N` emits N non-protocol lines before the greeting,
//!   cycling through plain text, truncated JSON, and well-formed JSON with no
//!   recognizable envelope
//! - `MOCK_MIDRUN_GARBAGE=1` interleaves malformed lines with the
//!   `run_simulation` replies
//! - `MOCK_RESULT_DELAY_MS=N` sleeps before answering `get_result`
//! - `MOCK_FAIL_SERIES=name` answers `get_result` for that series with an
//!   error
//! - `MOCK_EXIT_AFTER_LOAD=1` exits with code 3 right after acknowledging a
//!   model load
//! - `MOCK_STARTUP_STDERR=line` prints the line to stderr at startup
//!
//! `get_result` embeds a per-series served-request counter as the first data
//! value, so tests can count how many fetches actually reached the engine.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};

struct MockEngine {
    uid: String,
    served: HashMap<String, u64>,
}

fn emit(value: &Value) -> Result<()> {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    writeln!(lock, "{value}")?;
    lock.flush()?;
    Ok(())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl MockEngine {
    fn new() -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            served: HashMap::new(),
        }
    }

    fn ready(&self, rc: i64) -> Result<()> {
        emit(&json!({"m": "rdy", "uid": self.uid, "rc": rc}))
    }

    fn busy(&self, command: &str) -> Result<()> {
        emit(&json!({"m": "bsy", "uid": self.uid, "cmd": command, "int": true}))
    }

    fn progress(&self, current: u64, total: u64, task: &str, data: &[f64]) -> Result<()> {
        emit(&json!({
            "m": "prg", "uid": self.uid,
            "i": current, "n": total, "t": task, "d": data,
        }))
    }

    fn result(&self, command: &str, payload: Value) -> Result<()> {
        emit(&json!({
            "m": "res", "uid": self.uid,
            "cmd": command, "ok": true, "exec_ms": 1.5, "r": payload,
        }))
    }

    fn error(&self, command: Option<&str>, message: &str) -> Result<()> {
        emit(&json!({"m": "err", "uid": self.uid, "cmd": command, "msg": message}))
    }

    fn handle_command(&mut self, name: &str, params: &Value) -> Result<()> {
        match name {
            "load_model_string" => {
                self.busy(name)?;
                let length = params["model_ini"].as_str().map(str::len).unwrap_or(0);
                self.result(name, json!({"model_info": {"ini_length": length}}))?;
                if std::env::var("MOCK_EXIT_AFTER_LOAD").is_ok() {
                    std::process::exit(3);
                }
                self.ready(0)
            }
            "load_model_file" => {
                self.busy(name)?;
                let path = params["model_path"].as_str().unwrap_or("");
                match std::fs::metadata(path) {
                    Ok(meta) => {
                        self.result(name, json!({"model_info": {"file_bytes": meta.len()}}))?;
                        self.ready(0)
                    }
                    Err(_) => {
                        self.error(
                            Some(name),
                            &format!("Command execution error: cannot open {path}"),
                        )?;
                        self.ready(1)
                    }
                }
            }
            "run_simulation" => {
                self.busy(name)?;
                if std::env::var("MOCK_MIDRUN_GARBAGE").is_ok() {
                    let stdout = std::io::stdout();
                    let mut lock = stdout.lock();
                    writeln!(lock, "solver trace: reach 14 converged")?;
                    writeln!(lock, "{{\"m\":\"prg\",\"i\":")?;
                    writeln!(lock, "{{\"trace\":\"no envelope\"}}")?;
                    lock.flush()?;
                }
                for step in [25u64, 50, 100] {
                    self.progress(step, 100, "sim", &[])?;
                }
                self.result(
                    name,
                    json!({
                        "ts": {
                            "len": 3,
                            "start": "2020-01-01T00:00:00+00:00",
                            "end": "2020-01-03T00:00:00+00:00",
                            "outputs": ["node.inflow.dsflow", "node.outlet.dsflow"],
                        }
                    }),
                )?;
                self.ready(0)
            }
            "run_optimisation" => {
                self.busy(name)?;
                self.progress(50, 100, "cal", &[0.9, 0.42])?;
                self.result(name, json!({"best_objective": 0.42, "evaluations": 100}))?;
                self.ready(0)
            }
            "get_optimisable_params" => {
                self.result(
                    name,
                    json!({"parameters": ["node.storage.capacity", "node.routing.k"]}),
                )?;
                self.ready(0)
            }
            "get_result" => {
                if let Some(delay) = env_u64("MOCK_RESULT_DELAY_MS") {
                    std::thread::sleep(Duration::from_millis(delay));
                }
                let series = params["series_name"].as_str().unwrap_or("").to_string();
                if std::env::var("MOCK_FAIL_SERIES").is_ok_and(|s| s == series) {
                    self.error(
                        Some(name),
                        &format!("Command execution error: unknown series {series}"),
                    )?;
                    return self.ready(1);
                }
                let count = self.served.entry(series.clone()).or_insert(0);
                *count += 1;
                let data = format!("2020-01-01T00:00:00+00:00,86400,{count},2.5,3.5");
                self.result(name, json!({"series_name": series, "data": data, "format": "csv"}))?;
                self.ready(0)
            }
            "test_progress" => {
                self.busy(name)?;
                self.progress(1, 2, "proc", &[])?;
                self.result(name, json!({}))?;
                self.ready(0)
            }
            other => {
                self.error(Some(other), &format!("Command execution error: unknown command {other}"))?;
                self.ready(1)
            }
        }
    }

    fn run(&mut self) -> Result<()> {
        if let Some(count) = env_u64("MOCK_GARBAGE_LINES") {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            for i in 0..count {
                match i % 3 {
                    0 => writeln!(lock, "kalixcli mock build, line {i}")?,
                    1 => writeln!(lock, "{{\"m\":\"rdy\",\"truncated")?,
                    _ => writeln!(lock, "{{\"banner\":\"no envelope here\",\"seq\":{i}}}")?,
                }
            }
            lock.flush()?;
        }
        if let Ok(line) = std::env::var("MOCK_STARTUP_STDERR") {
            eprintln!("{line}");
        }

        self.ready(0)?;

        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = line?;
            let Ok(message) = serde_json::from_str::<Value>(&line) else {
                self.error(None, "malformed request")?;
                continue;
            };
            match message["m"].as_str() {
                Some("cmd") => {
                    let name = message["c"].as_str().unwrap_or("").to_string();
                    let params = message["p"].clone();
                    self.handle_command(&name, &params)?;
                }
                Some("stp") => {
                    emit(&json!({"m": "stp", "uid": self.uid, "cmd": "run_simulation", "exec_ms": 2.0}))?;
                    self.ready(2)?;
                }
                Some("query") => {
                    self.result("query", json!({"state": "idle", "version": "0.0.0-mock"}))?;
                    self.ready(0)?;
                }
                Some("term") => break,
                _ => self.error(None, "unknown message kind")?,
            }
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    MockEngine::new().run()
}

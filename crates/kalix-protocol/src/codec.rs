//! Line codec: one JSON object per line.
//!
//! The engine emits the compact envelope keyed by `"m"`. Some engine builds
//! also emit a verbose envelope keyed by `"type"` with the fields nested
//! under `"data"`; the decoder accepts both and normalizes them into the same
//! [`Inbound`] model. The encoder always produces the compact form.

use serde_json::{Map, Value, json};

use crate::message::{EngineEvent, Inbound, Outbound, ProgressUpdate, ReturnCode, TaskKind};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message has no type tag")]
    MissingTag,

    #[error("unknown message tag: {0}")]
    UnknownTag(String),

    #[error("{tag} message missing field {field}")]
    MissingField {
        tag: &'static str,
        field: &'static str,
    },

    #[error("malformed time-series payload: {0}")]
    Series(String),
}

/// Cheap pre-filter so ordinary diagnostic output never reaches the parser.
pub fn looks_like_json(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('{') && trimmed.ends_with('}')
}

/// Decode one line into an inbound message.
pub fn decode_line(line: &str) -> Result<Inbound, ProtocolError> {
    let value: Value = serde_json::from_str(line)?;
    let Value::Object(obj) = value else {
        return Err(ProtocolError::NotAnObject);
    };
    if obj.contains_key("m") {
        decode_compact(&obj)
    } else if obj.contains_key("type") {
        decode_verbose(&obj)
    } else {
        Err(ProtocolError::MissingTag)
    }
}

/// Encode an outbound message as a single compact JSON line (no newline).
pub fn encode_line(message: &Outbound) -> String {
    let value = match message {
        Outbound::Command { name, parameters } => {
            json!({"m": "cmd", "c": name, "p": parameters})
        }
        Outbound::Stop { reason: Some(r) } => json!({"m": "stp", "reason": r}),
        Outbound::Stop { reason: None } => json!({"m": "stp"}),
        Outbound::Query { query } => json!({"m": "query", "q": query}),
        Outbound::Terminate => json!({"m": "term"}),
    };
    value.to_string()
}

struct Fields<'a>(&'a Map<String, Value>);

impl Fields<'_> {
    fn str_field(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(Value::as_str).map(str::to_owned)
    }

    fn require_str(
        &self,
        tag: &'static str,
        field: &'static str,
    ) -> Result<String, ProtocolError> {
        self.str_field(field)
            .ok_or(ProtocolError::MissingField { tag, field })
    }

    fn i64_field(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    fn u64_field(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    fn f64_field(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    fn bool_field(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    fn f64_array(&self, key: &str) -> Vec<f64> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default()
    }

    fn task_field(&self, key: &str) -> Option<TaskKind> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .and_then(|t| t.parse().ok())
    }
}

fn decode_compact(obj: &Map<String, Value>) -> Result<Inbound, ProtocolError> {
    let fields = Fields(obj);
    let tag = fields.str_field("m").ok_or(ProtocolError::MissingTag)?;
    let uid = fields.str_field("uid");

    let event = match tag.as_str() {
        "rdy" => EngineEvent::Ready {
            return_code: ReturnCode::from_code(fields.i64_field("rc").unwrap_or(0)),
        },
        "bsy" => EngineEvent::Busy {
            command: fields.require_str("bsy", "cmd")?,
            interruptible: fields.bool_field("int").unwrap_or(false),
        },
        "prg" => EngineEvent::Progress(ProgressUpdate {
            current: fields
                .u64_field("i")
                .ok_or(ProtocolError::MissingField { tag: "prg", field: "i" })?,
            total: fields.u64_field("n").unwrap_or(0),
            task: fields.task_field("t"),
            data: fields.f64_array("d"),
        }),
        "res" => EngineEvent::Result {
            command: fields.require_str("res", "cmd")?,
            success: fields.bool_field("ok").unwrap_or(true),
            exec_ms: fields.f64_field("exec_ms"),
            payload: obj.get("r").cloned().unwrap_or(Value::Null),
        },
        "stp" => EngineEvent::Stopped {
            command: fields.str_field("cmd"),
            exec_ms: fields.f64_field("exec_ms"),
        },
        "err" => EngineEvent::Error {
            command: fields.str_field("cmd"),
            message: fields.require_str("err", "msg")?,
        },
        "log" => EngineEvent::Log {
            message: fields.str_field("msg").unwrap_or_default(),
        },
        other => return Err(ProtocolError::UnknownTag(other.to_string())),
    };

    Ok(Inbound { uid, event })
}

fn decode_verbose(obj: &Map<String, Value>) -> Result<Inbound, ProtocolError> {
    let outer = Fields(obj);
    let tag = outer.str_field("type").ok_or(ProtocolError::MissingTag)?;
    let uid = outer.str_field("session_id").or_else(|| outer.str_field("uid"));

    let empty = Map::new();
    let data = obj
        .get("data")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let fields = Fields(data);

    let event = match tag.as_str() {
        "ready" => EngineEvent::Ready {
            return_code: ReturnCode::from_code(fields.i64_field("return_code").unwrap_or(0)),
        },
        "busy" => EngineEvent::Busy {
            command: fields.require_str("busy", "command")?,
            interruptible: fields.bool_field("interruptible").unwrap_or(false),
        },
        "progress" => EngineEvent::Progress(ProgressUpdate {
            current: fields.u64_field("current").unwrap_or(0),
            total: fields.u64_field("total").unwrap_or(0),
            task: fields.task_field("task"),
            data: fields.f64_array("data"),
        }),
        "result" => EngineEvent::Result {
            command: fields.require_str("result", "command")?,
            success: fields.bool_field("success").unwrap_or(true),
            exec_ms: fields.f64_field("execution_time_ms"),
            payload: data.get("result").cloned().unwrap_or(Value::Null),
        },
        "stopped" => EngineEvent::Stopped {
            command: fields.str_field("command"),
            exec_ms: fields.f64_field("execution_time_ms"),
        },
        "error" => EngineEvent::Error {
            command: fields.str_field("command"),
            message: fields
                .str_field("message")
                .or_else(|| fields.str_field("error"))
                .ok_or(ProtocolError::MissingField { tag: "error", field: "message" })?,
        },
        "log" => EngineEvent::Log {
            message: fields.str_field("message").unwrap_or_default(),
        },
        other => return Err(ProtocolError::UnknownTag(other.to_string())),
    };

    Ok(Inbound { uid, event })
}

//! # kalix-protocol
//!
//! Wire protocol for driving a `kalixcli` engine over stdio.
//!
//! The engine speaks line-delimited JSON: one compact message per line, keyed
//! by a short `"m"` tag with the remaining fields flattened alongside it.
//! This crate is the pure data layer. It knows how to encode outbound
//! messages, decode inbound lines into [`EngineEvent`]s, build the engine's
//! command set, and parse the result payloads (simulation summaries and CSV
//! time series). It performs no I/O; process and session handling live in
//! `kalix-session`.

pub mod codec;
pub mod commands;
pub mod message;
pub mod series;

pub use codec::{ProtocolError, decode_line, encode_line, looks_like_json};
pub use message::{EngineEvent, Inbound, Outbound, ProgressUpdate, ReturnCode, TaskKind};
pub use series::{SeriesData, SeriesPayload, SimulationSummary};

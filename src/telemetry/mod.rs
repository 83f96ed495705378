//! Telemetry agent boundary.
//!
//! Sandboxed programs report execution events through this agent. The wire
//! shape (NDJSON, camelCase keys, `null` for absent optionals) is what the
//! ingest endpoint expects.

pub mod agent;
pub mod event;
pub mod http;

pub use agent::{Agent, AgentConfig, BatchSink, MemorySink};
pub use http::HttpSink;
pub use event::{to_ndjson, Event};

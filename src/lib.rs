//! kyntrixd: a local sandbox orchestrator daemon
//! Launches user scripts inside Linux namespaces with a swapped root filesystem
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: Sandbox creation in fresh mount, PID and network namespaces
//! - [`kernel::mount`]: Root switch pipeline (bind, pivot, proc/sys, workspace)
//! - [`kernel::signal`]: Shutdown signals and sandbox termination
//!
//! ## Daemon Core ([`core`])
//! - [`core::registry`]: Run id -> running sandbox table
//! - [`core::protocol`]: JSON control messages
//! - [`core::server`]: Unix control socket and worker pool
//! - [`core::client`]: One-shot control client
//! - [`core::template`]: Per-template command line and hook environment
//!
//! ## Telemetry ([`telemetry`])
//! - [`telemetry::agent`]: Event batching for sandboxed programs
//! - [`telemetry::event`]: NDJSON event records
//!
//! ## Configuration ([`config`])
//! - [`config::daemon`]: Daemon settings and JSON config file
//! - [`config::types`]: Shared types and the crate error
//!
//! # Lifecycle
//!
//! 1. **Start returns early** - a PID means the clone succeeded, not that the sandbox is ready
//! 2. **Stop is fire-and-forget** - SIGTERM is sent and the run is forgotten
//! 3. **One request per connection** - a single bounded read, one JSON reply

// Kernel Primitives
pub mod kernel;

// Daemon core
pub mod core;

// Telemetry agent boundary
pub mod telemetry;

// Configuration
pub mod config;

// CLI entrypoint wiring shared by kyntrixd/kyntrixctl binaries.
pub mod cli;

pub use config::types::*;

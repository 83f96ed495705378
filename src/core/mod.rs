//! Daemon core.
//!
//! The registry owns the run id -> sandbox table; the server exposes it over
//! the control socket; templates describe what runs inside each sandbox.

pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod template;

pub use protocol::{ControlRequest, ControlResponse};
pub use registry::{InstanceRegistry, Launcher};
pub use server::{ControlServer, Dispatcher};

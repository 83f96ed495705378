//! Configuration and shared types
//!
//! Daemon settings and the closed type vocabulary used across layers.

pub mod daemon;
pub mod types;

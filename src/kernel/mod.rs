//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: signal -> mount -> namespace

pub mod mount;
pub mod namespace;
pub mod signal;

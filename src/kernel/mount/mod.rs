//! Filesystem isolation
//!
//! Root switch into a template image for a freshly cloned sandbox.

pub mod rootfs;

pub use rootfs::{ensure_dir, MountPlan, MountStep, RootfsMounter, StepFailure, OLD_ROOT_DIR};

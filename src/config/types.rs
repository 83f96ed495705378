/// Core types shared by the isolation and orchestration layers
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Closed set of sandbox templates.
///
/// Every decision that depends on the template (root filesystem, command
/// line, hook environment) matches on this enum exhaustively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerTemplate {
    Node,
    Python,
}

impl ContainerTemplate {
    pub const ALL: [ContainerTemplate; 2] = [ContainerTemplate::Node, ContainerTemplate::Python];

    pub fn name(self) -> &'static str {
        match self {
            ContainerTemplate::Node => "node",
            ContainerTemplate::Python => "python",
        }
    }
}

impl fmt::Display for ContainerTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ContainerTemplate {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "node" => Ok(ContainerTemplate::Node),
            "python" => Ok(ContainerTemplate::Python),
            other => Err(DaemonError::Config(format!(
                "unknown container template: {other:?}"
            ))),
        }
    }
}

/// Everything needed to launch one sandbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpawnRequest {
    pub template: ContainerTemplate,
    pub run_id: String,
    pub workspace_path: PathBuf,
    /// Path of the user script relative to `/workspace`.
    pub entry_script: PathBuf,
}

impl SpawnRequest {
    pub fn new(
        template: ContainerTemplate,
        run_id: impl Into<String>,
        workspace_path: impl Into<PathBuf>,
        entry_script: impl Into<PathBuf>,
    ) -> Result<Self> {
        let request = Self {
            template,
            run_id: run_id.into(),
            workspace_path: workspace_path.into(),
            entry_script: entry_script.into(),
        };
        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> Result<()> {
        if self.run_id.is_empty() {
            return Err(DaemonError::Config("run_id must not be empty".to_string()));
        }
        if self.run_id.contains('\0') {
            return Err(DaemonError::Config("run_id contains NUL byte".to_string()));
        }
        if self.workspace_path.as_os_str().is_empty() {
            return Err(DaemonError::Config(
                "workspace_path must not be empty".to_string(),
            ));
        }
        validate_entry_script(&self.entry_script)
    }

    /// Entry script as seen from inside the sandbox.
    pub fn sandbox_entry(&self) -> PathBuf {
        Path::new("/workspace").join(&self.entry_script)
    }
}

fn validate_entry_script(entry: &Path) -> Result<()> {
    if entry.as_os_str().is_empty() {
        return Err(DaemonError::Config("entry script must not be empty".to_string()));
    }
    for component in entry.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(DaemonError::Config(format!(
                    "entry script must stay under /workspace: {}",
                    entry.display()
                )))
            }
        }
    }
    Ok(())
}

/// A sandbox the registry is tracking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunningInstance {
    pub run_id: String,
    pub pid: i32,
    pub template: ContainerTemplate,
}

/// Coarse error classes callers branch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Isolation,
    Protocol,
    Lookup,
    Io,
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Isolation error: {0}")]
    Isolation(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown run: {0}")]
    Lookup(String),

    #[error("Telemetry delivery failed: {0}")]
    Delivery(String),

    #[error("System call failed: {0}")]
    Errno(#[from] nix::errno::Errno),
}

impl DaemonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaemonError::Config(_) => ErrorKind::Config,
            DaemonError::Isolation(_) | DaemonError::Spawn(_) | DaemonError::Errno(_) => {
                ErrorKind::Isolation
            }
            DaemonError::Protocol(_) => ErrorKind::Protocol,
            DaemonError::Lookup(_) => ErrorKind::Lookup,
            DaemonError::Io(_) | DaemonError::Delivery(_) => ErrorKind::Io,
        }
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(err: serde_json::Error) -> Self {
        DaemonError::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

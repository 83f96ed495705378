//! Control socket wire records (JSON, one exchange per connection).

use crate::config::types::{DaemonError, Result};
use serde::{Deserialize, Serialize};

/// Incoming request. Everything but `action` is optional on the wire; a
/// missing `action` reads as the empty string and is reported as unknown.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

/// Fields `start` needs, all present and non-empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartParams {
    pub run_id: String,
    pub template: String,
    pub workspace_path: String,
    pub entry: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Start(std::result::Result<StartParams, String>),
    Stop(Option<String>),
    Unknown(String),
}

fn required(field: &'static str, value: Option<String>) -> std::result::Result<String, String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(format!("missing field: {field}")),
    }
}

impl ControlRequest {
    pub fn start(run_id: &str, template: &str, workspace_path: &str, entry: &str) -> Self {
        Self {
            action: "start".to_string(),
            run_id: Some(run_id.to_string()),
            template: Some(template.to_string()),
            workspace_path: Some(workspace_path.to_string()),
            entry: Some(entry.to_string()),
        }
    }

    pub fn stop(run_id: &str) -> Self {
        Self {
            action: "stop".to_string(),
            run_id: Some(run_id.to_string()),
            ..Self::default()
        }
    }

    /// Decode raw request bytes. Anything that is not a JSON object with
    /// correctly typed fields is a protocol error.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        if !value.is_object() {
            return Err(DaemonError::Protocol(
                "request must be a JSON object".to_string(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn into_command(self) -> ControlCommand {
        let action = self.action.clone();
        match action.as_str() {
            "start" => ControlCommand::Start(self.start_params()),
            "stop" => ControlCommand::Stop(self.run_id.filter(|id| !id.is_empty())),
            _ => ControlCommand::Unknown(action),
        }
    }

    fn start_params(self) -> std::result::Result<StartParams, String> {
        Ok(StartParams {
            run_id: required("run_id", self.run_id)?,
            template: required("template", self.template)?,
            workspace_path: required("workspace_path", self.workspace_path)?,
            entry: required("entry", self.entry)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn failed() -> Self {
        Self {
            ok: false,
            error: None,
        }
    }

    pub fn unknown_action() -> Self {
        Self {
            ok: false,
            error: Some("unknown action".to_string()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

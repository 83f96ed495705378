use crate::config::types::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One execution event as the ingest endpoint sees it.
///
/// Optional fields are always emitted; absent ones serialize as `null`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub run_id: String,
    pub seq: i64,
    pub ts: i64,
    pub kind: String,
    pub span: Option<String>,
    pub parent_span: Option<String>,
    pub node_key: Option<String>,
    pub data: Option<Value>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    pub fn with_parent_span(mut self, parent_span: impl Into<String>) -> Self {
        self.parent_span = Some(parent_span.into());
        self
    }

    pub fn with_node_key(mut self, node_key: impl Into<String>) -> Self {
        self.node_key = Some(node_key.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Empty strings carry no information; store them as absent.
    pub fn normalized(mut self) -> Self {
        self.span = non_empty(self.span);
        self.parent_span = non_empty(self.parent_span);
        self.node_key = non_empty(self.node_key);
        self
    }
}

/// Newline-delimited JSON, one object per event, trailing newline included.
pub fn to_ndjson(events: &[Event]) -> Result<String> {
    let mut body = String::with_capacity(events.len() * 160);
    for event in events {
        body.push_str(&serde_json::to_string(event)?);
        body.push('\n');
    }
    Ok(body)
}

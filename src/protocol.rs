//! Envelope types shared by the wire transport, the IPC bridge and the batch
//! scheduler.
//!
//! Every transport frames one JSON object per line.

use crate::error::{HostlinkError, ExecutionError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol version spoken by this build
pub const API_VERSION: &str = "1.0.0";

/// Command name used for compound batch requests
pub const BATCH_COMMAND: &str = "batch";

/// Command name used for tool discovery
pub const LIST_TOOLS_COMMAND: &str = "list_tools";

fn default_params() -> Value {
    Value::Object(Map::new())
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Client to server request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: String,
    pub command: String,
    #[serde(default = "default_params")]
    pub params: Value,
    #[serde(default = "default_version")]
    pub version: String,
}

/// Error object carried by a failed [`WireResponse`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// Server to client response. Exactly one of `result` / `error` is meaningful;
/// a frame without either is a successful `null` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl WireResponse {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, err: &HostlinkError) -> Self {
        let mut details = Map::new();
        details.insert(
            "category".to_string(),
            Value::String(err.category().as_str().to_string()),
        );
        Self {
            id: id.into(),
            result: None,
            error: Some(WireError {
                message: err.to_string(),
                details,
            }),
        }
    }

    pub fn into_result(self) -> Result<Value, HostlinkError> {
        match self.error {
            Some(error) => Err(HostlinkError::Remote {
                message: error.message,
                details: error.details,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Server process to host executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcRequest {
    pub id: String,
    pub tool: String,
    #[serde(default = "default_params")]
    pub params: Value,
}

/// Host executor to server process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl IpcResponse {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            status: None,
            message: None,
        }
    }

    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            status: Some("error".to_string()),
            message: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status.as_deref() == Some("error")
    }

    pub fn into_result(self) -> Result<Value, ExecutionError> {
        if self.is_error() {
            return Err(ExecutionError::new(
                self.message.unwrap_or_else(|| "unknown host error".to_string()),
            ));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Discovery record for one registered tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchemaRecord {
    pub name: String,
    pub description: String,
    pub category: String,
    pub parameters: Value,
    pub enabled: bool,
}

/// One operation inside a batch payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub command: String,
    #[serde(default = "default_params")]
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    Batch,
}

/// Compound request produced by a scheduler flush
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
    #[serde(rename = "type")]
    pub kind: BatchKind,
    pub operations: Vec<BatchItem>,
    #[serde(default)]
    pub compressed: bool,
}

impl BatchPayload {
    pub fn new(operations: Vec<BatchItem>, compressed: bool) -> Self {
        Self {
            kind: BatchKind::Batch,
            operations,
            compressed,
        }
    }
}

/// Result of one operation executed as part of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub operation_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl BatchOutcome {
    pub fn from_result(operation_id: impl Into<String>, result: Result<Value, HostlinkError>) -> Self {
        let (success, result, error) = match result {
            Ok(value) => (true, Some(value), None),
            Err(e) => (false, None, Some(e.to_string())),
        };
        Self {
            operation_id: operation_id.into(),
            success,
            result,
            error,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Serialize one frame, newline terminated
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    Ok(frame)
}

pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

/// `requested <= supported`, comparing dotted numeric components with
/// missing components read as zero. Anything non-numeric is incompatible.
pub fn is_compatible_version(requested: &str, supported: &str) -> bool {
    fn parse(version: &str) -> Option<Vec<u64>> {
        version
            .trim()
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect()
    }

    let (Some(requested), Some(supported)) = (parse(requested), parse(supported)) else {
        return false;
    };

    let len = requested.len().max(supported.len());
    for i in 0..len {
        let r = requested.get(i).copied().unwrap_or(0);
        let s = supported.get(i).copied().unwrap_or(0);
        if r != s {
            return r < s;
        }
    }
    true
}

//! Offload message protocol.
//!
//! Requests carry a caller-assigned `id`; the worker echoes it in the
//! response. A response without an `id` is a notification addressed to the
//! dispatcher as a whole.
//!
//! ```json
//! { "id": 7, "command": "render", "data": { "source": "cube(1);" } }
//! { "id": 7, "success": true, "result": { "output": [ ... ] } }
//! { "id": null, "success": false, "error": "worker crashed" }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use scad_wasm_common::{OffloadConfig, ScadError, error_chain};
use scad_wasm_core::RenderOptions;
use scad_wasm_host::InitOptions;

/// Commands understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Initialize,
    Render,
    Status,
    Reset,
}

impl Command {
    /// Name on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Render => "render",
            Self::Status => "status",
            Self::Reset => "reset",
        }
    }

    /// How long the dispatcher waits for the response.
    pub fn timeout(self, config: &OffloadConfig) -> Duration {
        match self {
            Self::Initialize | Self::Render => config.render_timeout(),
            Self::Status | Self::Reset => config.command_timeout(),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatcher to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
    #[serde(default)]
    pub data: Value,
}

/// Worker to dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id; `None` for notifications.
    pub id: Option<u64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl Response {
    /// Successful reply to request `id`.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            success: true,
            result: Some(result),
            error: None,
            stack: None,
        }
    }

    /// Failed reply to request `id`.
    pub fn failure(id: u64, error: &ScadError) -> Self {
        Self {
            id: Some(id),
            success: false,
            result: None,
            error: Some(error.to_string()),
            stack: Some(error_chain(error)),
        }
    }

    /// Notification that the worker can no longer serve requests.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            id: None,
            success: false,
            result: None,
            error: Some(message.into()),
            stack: None,
        }
    }

    /// The result value, or the worker's error.
    pub fn into_result(self) -> Result<Value, ScadError> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(ScadError::remote(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

/// Payload of `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_fonts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_mcad: Option<bool>,
}

impl From<InitializePayload> for InitOptions {
    fn from(payload: InitializePayload) -> Self {
        Self {
            base_path: payload.base_path,
            include_fonts: payload.include_fonts,
            include_mcad: payload.include_mcad,
        }
    }
}

impl From<InitOptions> for InitializePayload {
    fn from(options: InitOptions) -> Self {
        Self {
            base_path: options.base_path,
            include_fonts: options.include_fonts,
            include_mcad: options.include_mcad,
        }
    }
}

/// Payload of `render`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderPayload {
    pub source: String,
    #[serde(default)]
    pub options: RenderOptions,
}

/// Result of `render`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResult {
    pub output: Vec<u8>,
}

/// Decode a payload, mapping failures to `Protocol` errors.
pub fn decode<T: serde::de::DeserializeOwned>(command: Command, data: Value) -> Result<T, ScadError> {
    serde_json::from_value(data)
        .map_err(|e| ScadError::protocol(format!("Invalid '{command}' payload: {e}")))
}

/// Encode a payload or result.
pub fn encode<T: Serialize>(value: &T) -> Result<Value, ScadError> {
    serde_json::to_value(value).map_err(|e| ScadError::protocol(format!("Encoding failed: {e}")))
}

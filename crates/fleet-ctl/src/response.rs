//! Command response codec.
//!
//! On the wire a response is a flat JSON object whose `success` member is
//! the string `"True"` or `"False"`. Decoding turns it into a typed
//! [`CommandResponse`] with a real boolean; encoding emits the wire form
//! again, leaving out every optional field that was never set.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::error;

use crate::command::Command;

const UNBOUND_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Error codes carried in the `error` field of failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnsupportedCommand,
    HttpError,
    Unreachable,
    MalformedResponse,
    Unexpected,
}

impl ErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::UnsupportedCommand => 100,
            ErrorCode::HttpError => 120,
            ErrorCode::Unreachable => 121,
            ErrorCode::MalformedResponse => 122,
            ErrorCode::Unexpected => 123,
        }
    }
}

/// Request state reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Done,
    Pending,
    Cancelled,
    /// Set on locally built error responses.
    Unavailable,
    /// The worker did not report a status.
    Undefined,
    Other(String),
}

impl CommandStatus {
    fn from_wire(s: &str) -> Self {
        match s {
            "Done" => CommandStatus::Done,
            "Pending" => CommandStatus::Pending,
            "Cancelled" => CommandStatus::Cancelled,
            "Unavailable" => CommandStatus::Unavailable,
            "Undefined" => CommandStatus::Undefined,
            other => CommandStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CommandStatus::Done => "Done",
            CommandStatus::Pending => "Pending",
            CommandStatus::Cancelled => "Cancelled",
            CommandStatus::Unavailable => "Unavailable",
            CommandStatus::Undefined => "Undefined",
            CommandStatus::Other(s) => s,
        }
    }
}

/// Decoded worker response.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub uuid: String,
    pub status: CommandStatus,
    pub status_info: String,
    pub success: bool,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub cmd: Option<String>,
    /// Numeric error code as a string; `"0"` or absent on success.
    pub error: Option<String>,
    pub error_str: Option<String>,
    pub body: Option<Value>,
    pub params: Option<Value>,
    pub xml: Option<String>,
}

/// Wire representation. Scalars are accepted in any JSON type and kept as text.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireResponse {
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    uuid: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    statusinfo: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    success: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    start_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    end_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    cmd: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    error_str: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    xml: Option<String>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

impl CommandResponse {
    /// Decode a worker reply body.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(bytes)?;
        if !value.is_object() {
            return Err(serde::de::Error::custom("response is not a JSON object"));
        }
        let wire: WireResponse = serde_json::from_value(value)?;
        Ok(Self::from_wire(wire))
    }

    fn from_wire(wire: WireResponse) -> Self {
        Self {
            uuid: wire.uuid.unwrap_or_else(|| UNBOUND_UUID.to_string()),
            status: wire
                .status
                .as_deref()
                .map(CommandStatus::from_wire)
                .unwrap_or(CommandStatus::Undefined),
            status_info: wire.statusinfo.unwrap_or_else(|| "Undefined".to_string()),
            success: wire.success.as_deref() == Some("True"),
            start_time: wire.start_time,
            end_time: wire.end_time,
            cmd: wire.cmd,
            error: wire.error,
            error_str: wire.error_str,
            body: wire.body,
            params: wire.params,
            xml: wire.xml,
        }
    }

    /// Locally built failure for `command`.
    pub fn failure(command: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            uuid: UNBOUND_UUID.to_string(),
            status: CommandStatus::Unavailable,
            status_info: "statusinfo not available".to_string(),
            success: false,
            start_time: None,
            end_time: None,
            cmd: Some(command.to_string()),
            error: Some(code.code().to_string()),
            error_str: Some(message.into()),
            body: None,
            params: None,
            xml: None,
        }
    }

    /// Numeric error code, if the response carries a non-zero one.
    pub fn error_code(&self) -> Option<u16> {
        self.error
            .as_deref()
            .and_then(|e| e.trim().parse::<u16>().ok())
            .filter(|&c| c != 0)
    }

    fn to_wire(&self) -> WireResponse {
        WireResponse {
            uuid: Some(self.uuid.clone()),
            status: Some(self.status.as_str().to_string()),
            statusinfo: Some(self.status_info.clone()),
            success: Some(if self.success { "True" } else { "False" }.to_string()),
            start_time: self.start_time.clone(),
            end_time: self.end_time.clone(),
            cmd: self.cmd.clone(),
            error: self.error.clone(),
            error_str: self.error_str.clone(),
            body: self.body.clone(),
            params: self.params.clone(),
            xml: self.xml.clone(),
        }
    }

    /// Wire form as a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self.to_wire()).unwrap_or(Value::Null)
    }

    /// Wire form as pretty-printed JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.to_wire()).unwrap_or_default()
    }

    /// Hand the response to the caller as a plain JSON value.
    ///
    /// A failed response is logged once; the caller decides how to react.
    pub fn wait_for_completion(&self) -> Value {
        if !self.success {
            error!(
                cmd = self.cmd.as_deref().unwrap_or("-"),
                error = self.error.as_deref().unwrap_or("-"),
                "worker command was not successful"
            );
        }
        self.to_value()
    }

    pub(crate) fn with_default_cmd(mut self, command: Command) -> Self {
        if self.cmd.is_none() {
            self.cmd = Some(command.as_str().to_string());
        }
        self
    }
}

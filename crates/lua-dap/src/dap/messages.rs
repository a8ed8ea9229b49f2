use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::DebugError;

/// `request_seq` / `command` reported by errors not bound to any request.
pub const UNBOUND_REQUEST_SEQ: i64 = 1;
pub const UNBOUND_COMMAND: &str = "initialize";

/// An incoming protocol message.
///
/// Parsing is lenient: anything with a `type` field decodes, and the session
/// decides what to do with non-request types.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub seq: i64,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

impl Request {
    pub fn from_value(value: Value) -> Result<Self, DebugError> {
        serde_json::from_value(value).map_err(|err| {
            DebugError::MalformedMessage(crate::dap::codec::sanitize_json_error_message(
                &err.to_string(),
            ))
        })
    }

    pub fn is_request(&self) -> bool {
        self.type_ == "request"
    }

    /// Deserialize `arguments` into a typed struct; a missing object decodes from `{}`.
    pub fn parse_arguments<T: serde::de::DeserializeOwned>(&self) -> Result<T, DebugError> {
        let args = self.arguments.clone().unwrap_or_else(|| json!({}));
        serde_json::from_value(args).map_err(|err| DebugError::InvalidArguments {
            command: self.command.clone(),
            message: crate::dap::codec::sanitize_json_error_message(&err.to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub seq: i64,
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Response {
    pub fn success(seq: i64, request: &Request, body: Option<Value>) -> Self {
        Self {
            seq,
            type_: "response",
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body,
        }
    }

    /// A failed response with a structured `{error: {id, format, showUser}}` body.
    ///
    /// Without a bound request, the response correlates with the client's `initialize`.
    pub fn error(
        seq: i64,
        request: Option<&Request>,
        id: u32,
        short_message: impl Into<String>,
        long_message: impl Into<String>,
    ) -> Self {
        let (request_seq, command) = match request {
            Some(request) => (request.seq, request.command.clone()),
            None => (UNBOUND_REQUEST_SEQ, UNBOUND_COMMAND.to_owned()),
        };
        Self {
            seq,
            type_: "response",
            request_seq,
            success: false,
            command,
            message: Some(short_message.into()),
            body: Some(json!({
                "error": {
                    "id": id,
                    "format": long_message.into(),
                    "showUser": true,
                }
            })),
        }
    }

    pub fn from_debug_error(seq: i64, request: Option<&Request>, err: &DebugError) -> Self {
        Self::error(
            seq,
            request,
            err.error_id() as u32,
            err.short_message(),
            err.to_string(),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub seq: i64,
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Event {
    pub fn new(seq: i64, event: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            seq,
            type_: "event",
            event: event.into(),
            body,
        }
    }
}

//! MCP protocol types.
//!
//! This module defines the envelope model shared by every transport
//! (requests, responses, errors and notifications) together with the MCP
//! payload shapes the dispatcher produces and consumes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC version tag emitted on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol versions this server can speak, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Method names understood by the dispatcher.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const SHUTDOWN: &str = "shutdown";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";

    pub const NOTIFY_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIFY_CANCELLED: &str = "notifications/cancelled";
    pub const NOTIFY_SHUTDOWN: &str = "notifications/shutdown";
    pub const NOTIFY_RESOURCE_UPDATED: &str = "notifications/resources/updated";
}

/// Request identifier: an integer or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Interpret a JSON value as an id. `null`, floats and structured values are not ids.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => Value::from(*n),
            RequestId::String(s) => Value::from(s.clone()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        RequestId::Number(i64::from(n))
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// A request expecting exactly one terminal reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// A one-way message.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// A successful terminal reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Value,
}

/// A failed terminal reply. `id` is absent when no request could be identified.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub id: Option<RequestId>,
    pub error: ErrorObject,
}

/// One protocol message unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Notification(Notification),
    Response(Response),
    Error(ErrorResponse),
}

impl Envelope {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Envelope::Response(Response { id, result })
    }

    pub fn error(id: Option<RequestId>, error: ErrorObject) -> Self {
        Envelope::Error(ErrorResponse { id, error })
    }

    /// The id carried by this message, if any.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Envelope::Request(r) => Some(&r.id),
            Envelope::Response(r) => Some(&r.id),
            Envelope::Error(e) => e.id.as_ref(),
            Envelope::Notification(_) => None,
        }
    }

    /// The method carried by this message, if any.
    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => Some(&r.method),
            Envelope::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    /// Whether this message ends a request (a Response or an Error).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Envelope::Response(_) | Envelope::Error(_))
    }
}

/// Error classification carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    DecodeError,
    InvalidRequest,
    ProtocolStateError,
    NotFound,
    ValidationError,
    HandlerError,
    Timeout,
    Internal,
}

impl ErrorKind {
    /// JSON-RPC numeric code for this kind.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::DecodeError => -32700,
            ErrorKind::InvalidRequest => -32600,
            ErrorKind::NotFound => -32601,
            ErrorKind::ValidationError => -32602,
            ErrorKind::Internal => -32603,
            ErrorKind::HandlerError => -32000,
            ErrorKind::Timeout => -32001,
            ErrorKind::ProtocolStateError => -32002,
        }
    }

    /// Best-effort kind for an error that arrived without one.
    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => ErrorKind::DecodeError,
            -32600 => ErrorKind::InvalidRequest,
            -32601 => ErrorKind::NotFound,
            -32602 => ErrorKind::ValidationError,
            -32001 => ErrorKind::Timeout,
            -32002 => ErrorKind::ProtocolStateError,
            -32099..=-32000 => ErrorKind::HandlerError,
            _ => ErrorKind::Internal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DecodeError => "DecodeError",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::ProtocolStateError => "ProtocolStateError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::HandlerError => "HandlerError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload of an [`ErrorResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawErrorObject")]
pub struct ErrorObject {
    pub code: i32,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Deserialize)]
struct RawErrorObject {
    code: i32,
    #[serde(default)]
    kind: Option<Value>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl From<RawErrorObject> for ErrorObject {
    fn from(raw: RawErrorObject) -> Self {
        let kind = raw
            .kind
            .and_then(|k| serde_json::from_value::<ErrorKind>(k).ok())
            .unwrap_or_else(|| ErrorKind::from_code(raw.code));
        Self {
            code: raw.code,
            kind,
            message: raw.message,
            data: raw.data,
        }
    }
}

impl ErrorObject {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Tool annotations advertised in `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ToolAnnotations {
    #[serde(rename = "readOnlyHint", skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    #[serde(rename = "destructiveHint", skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
}

/// MCP tool definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
}

/// Concrete resource listed by `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDefinition {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Parameterized resource listed by `resources/templates/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceTemplateDefinition {
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// One item of a `resources/read` result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub text: String,
}

impl ResourceContents {
    /// JSON document rendered as pretty text.
    pub fn json(uri: impl Into<String>, value: &Value) -> Self {
        Self {
            uri: uri.into(),
            mime_type: Some("application/json".to_string()),
            text: serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        }
    }

    pub fn text(uri: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mime_type: Some("text/plain".to_string()),
            text: text.into(),
        }
    }
}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "clientInfo", default)]
    pub client_info: Option<ClientInfo>,
}

/// Client identity sent during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// `tools/call` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Parameters of the `resources/*` methods that name one URI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUriParams {
    pub uri: String,
}

/// `notifications/cancelled` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledParams {
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_id_from_value() {
        assert_eq!(RequestId::from_value(&json!(7)), Some(RequestId::Number(7)));
        assert_eq!(RequestId::from_value(&json!("a")), Some(RequestId::from("a")));
        assert_eq!(RequestId::from_value(&json!(null)), None);
        assert_eq!(RequestId::from_value(&json!(1.5)), None);
        assert_eq!(RequestId::from_value(&json!({"id": 1})), None);
    }

    #[test]
    fn test_error_kind_codes_round_trip() {
        for kind in [
            ErrorKind::DecodeError,
            ErrorKind::InvalidRequest,
            ErrorKind::ProtocolStateError,
            ErrorKind::NotFound,
            ErrorKind::ValidationError,
            ErrorKind::HandlerError,
            ErrorKind::Timeout,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn test_error_object_without_kind_uses_code() {
        let error: ErrorObject =
            serde_json::from_value(json!({"code": -32602, "message": "bad"})).unwrap();
        assert_eq!(error.kind, ErrorKind::ValidationError);

        let error: ErrorObject =
            serde_json::from_value(json!({"code": -32000, "kind": "Weird", "message": "x"}))
                .unwrap();
        assert_eq!(error.kind, ErrorKind::HandlerError);
    }

    #[test]
    fn test_error_object_serializes_kind() {
        let value = serde_json::to_value(ErrorObject::new(ErrorKind::Timeout, "slow")).unwrap();
        assert_eq!(value, json!({"code": -32001, "kind": "Timeout", "message": "slow"}));
    }

    #[test]
    fn test_cancelled_params() {
        let params: CancelledParams =
            serde_json::from_value(json!({"requestId": 3, "reason": "user"})).unwrap();
        assert_eq!(params.request_id, RequestId::Number(3));
    }
}

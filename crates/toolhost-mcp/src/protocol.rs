//! JSON-RPC 2.0 wire messages.
//!
//! One JSON object per frame:
//! `{"jsonrpc":"2.0", "id"?, "method"?, "params"?, "result"?, "error"?}`.
//! A request carries `id` and `method`, a response carries `id` and exactly
//! one of `result`/`error`, a notification carries `method` and no `id`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method names understood by the client runtime.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    /// Sent by the client once the initialize result has been processed.
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const COMPLETION_COMPLETE: &str = "completion/complete";

    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const RESOURCES_UPDATED: &str = "notifications/resources/updated";
    pub const LOG_MESSAGE: &str = "notifications/message";
    pub const CANCELLED: &str = "notifications/cancelled";
}

/// Request correlation id (integer or string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

/// Closed set of error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ServerError,
    Timeout,
    ConnectionError,
    AuthenticationError,
    AuthorizationError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 10] = [
        ErrorCode::ParseError,
        ErrorCode::InvalidRequest,
        ErrorCode::MethodNotFound,
        ErrorCode::InvalidParams,
        ErrorCode::InternalError,
        ErrorCode::ServerError,
        ErrorCode::Timeout,
        ErrorCode::ConnectionError,
        ErrorCode::AuthenticationError,
        ErrorCode::AuthorizationError,
    ];

    /// Numeric wire code.
    pub const fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ServerError => -32000,
            ErrorCode::Timeout => -32001,
            ErrorCode::ConnectionError => -32002,
            ErrorCode::AuthenticationError => -32003,
            ErrorCode::AuthorizationError => -32004,
        }
    }

    /// Map a wire code back onto the enumeration.
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Default human-readable message.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::ServerError => "Server error",
            ErrorCode::Timeout => "Request timed out",
            ErrorCode::ConnectionError => "Connection error",
            ErrorCode::AuthenticationError => "Authentication error",
            ErrorCode::AuthorizationError => "Authorization error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The enumerated code, if this is one of ours.
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorCode::MethodNotFound, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// `None` only for error responses to frames whose id could not be read.
    pub id: Option<RequestId>,
    pub outcome: Result<Value, RpcError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Ok(result),
        }
    }

    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// Why a frame could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// The frame is not JSON at all.
    InvalidJson,
    /// The frame is JSON but not a valid message.
    InvalidMessage,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseErrorKind::InvalidJson => write!(f, "invalid JSON"),
            ParseErrorKind::InvalidMessage => write!(f, "invalid message"),
        }
    }
}

/// Typed decode failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Request id recovered from the frame, if any.
    pub id: Option<RequestId>,
}

impl ParseError {
    fn invalid_json(message: impl Into<String>) -> Self {
        Self {
            kind: ParseErrorKind::InvalidJson,
            message: message.into(),
            id: None,
        }
    }

    fn invalid_message(message: impl Into<String>, id: Option<RequestId>) -> Self {
        Self {
            kind: ParseErrorKind::InvalidMessage,
            message: message.into(),
            id,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self.kind {
            ParseErrorKind::InvalidJson => ErrorCode::ParseError,
            ParseErrorKind::InvalidMessage => ErrorCode::InvalidRequest,
        }
    }

    /// The error response a receiver should send back for this frame.
    pub fn to_response(&self) -> Response {
        Response::error(self.id.clone(), RpcError::new(self.code(), self.message.clone()))
    }
}

/// Deserialize a present field as `Some`, even when it is `null`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Loose view of a frame before classification.
#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "present")]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default, deserialize_with = "present")]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

fn parse_id(value: Value) -> Result<RequestId, String> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| format!("id must be an integer, got {n}")),
        Value::String(s) => Ok(RequestId::String(s)),
        other => Err(format!("id must be a string or integer, got {other}")),
    }
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request(Request::new(id, method, params))
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification(Notification::new(method, params))
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }

    /// Convert to the wire JSON object.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        match self {
            Message::Request(req) => {
                obj.insert("id".into(), id_value(&req.id));
                obj.insert("method".into(), Value::String(req.method.clone()));
                if let Some(params) = &req.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Message::Notification(n) => {
                obj.insert("method".into(), Value::String(n.method.clone()));
                if let Some(params) = &n.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Message::Response(resp) => {
                obj.insert(
                    "id".into(),
                    resp.id.as_ref().map(id_value).unwrap_or(Value::Null),
                );
                match &resp.outcome {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        obj.insert("error".into(), rpc_error_value(error));
                    }
                }
            }
        }
        Value::Object(obj)
    }

    /// Encode as compact JSON bytes (no frame delimiter).
    pub fn encode(&self) -> Vec<u8> {
        self.to_value().to_string().into_bytes()
    }

    /// Decode one frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ParseError::invalid_json(e.to_string()))?;
        Self::from_value(value)
    }

    /// Classify an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, ParseError> {
        // Best-effort id recovery so error responses can be correlated.
        let recovered_id = value
            .get("id")
            .cloned()
            .and_then(|id| parse_id(id).ok());

        let raw: RawMessage = serde_json::from_value(value)
            .map_err(|e| ParseError::invalid_message(e.to_string(), recovered_id.clone()))?;

        if raw.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
            return Err(ParseError::invalid_message(
                "jsonrpc must be \"2.0\"",
                recovered_id,
            ));
        }

        match raw.method {
            Some(method) => {
                if raw.result.is_some() || raw.error.is_some() {
                    return Err(ParseError::invalid_message(
                        "message has both method and result/error",
                        recovered_id,
                    ));
                }
                match raw.id {
                    None => Ok(Message::Notification(Notification {
                        method,
                        params: raw.params,
                    })),
                    Some(Value::Null) => Err(ParseError::invalid_message(
                        "request id must not be null",
                        None,
                    )),
                    Some(id) => {
                        let id = parse_id(id).map_err(|e| ParseError::invalid_message(e, None))?;
                        Ok(Message::Request(Request {
                            id,
                            method,
                            params: raw.params,
                        }))
                    }
                }
            }
            None => {
                let id = match raw.id {
                    None => {
                        return Err(ParseError::invalid_message(
                            "response is missing id",
                            None,
                        ))
                    }
                    Some(Value::Null) => None,
                    Some(id) => {
                        Some(parse_id(id).map_err(|e| ParseError::invalid_message(e, None))?)
                    }
                };
                let outcome = match (raw.result, raw.error) {
                    (Some(result), None) => Ok(result),
                    (None, Some(error)) => Err(error),
                    (Some(_), Some(_)) => {
                        return Err(ParseError::invalid_message(
                            "response has both result and error",
                            id,
                        ))
                    }
                    (None, None) => {
                        return Err(ParseError::invalid_message(
                            "response has neither result nor error",
                            id,
                        ))
                    }
                };
                if id.is_none() && outcome.is_ok() {
                    return Err(ParseError::invalid_message(
                        "successful response must carry an id",
                        None,
                    ));
                }
                Ok(Message::Response(Response { id, outcome }))
            }
        }
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::String(s.clone()),
    }
}

fn rpc_error_value(error: &RpcError) -> Value {
    let mut obj = Map::new();
    obj.insert("code".into(), Value::from(error.code));
    obj.insert("message".into(), Value::String(error.message.clone()));
    if let Some(data) = &error.data {
        obj.insert("data".into(), data.clone());
    }
    Value::Object(obj)
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(D::Error::custom)
    }
}

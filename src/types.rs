//! The JSON-RPC message model shared by formatters, framing, and the session
//! engine.
//!
//! A notification is not a separate type here: it is a [`Request`] whose `id`
//! is `None`.  That mirrors the wire reality (the only difference is the
//! absence of the `id` member) and lets the dispatch path treat both shapes
//! uniformly.  Batches are deliberately absent; this engine speaks strictly
//! one message per frame.
use std::fmt::Display;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
pub use serde_json::Value as JsonValue;

/// Request id as it appears on the wire.
///
/// The wire may carry an integer or a string; the engine preserves the exact
/// variant when correlating a response back to its request.  Two ids are equal
/// iff they are the same variant with the same value.
#[derive(Debug, PartialEq, Clone, Hash, Eq, Deserialize, Serialize, PartialOrd, Ord)]
#[serde(untagged)]
pub enum Id {
    /// Null
    Null,
    /// Numeric id
    Number(u64),
    /// String id
    Str(String),
}

impl Id {
    pub fn is_null(&self) -> bool {
        matches!(self, Id::Null)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Id::Null => write!(f, "null"),
            Id::Number(num) => write!(f, "{num}"),
            Id::Str(string) => write!(f, "{string}"),
        }
    }
}

impl From<u64> for Id {
    fn from(num: u64) -> Self {
        Id::Number(num)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::Str(s.to_string())
    }
}

/// Which revision of the JSON-RPC wire protocol a text formatter speaks.
///
/// The two modes are mutually exclusive on the wire: 2.0 requires the
/// `jsonrpc: "2.0"` member on every message, 1.0 forbids it and instead
/// requires `id` on every message (null for notifications).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// JSON-RPC 2.0, the default.
    #[default]
    V2,
    /// JSON-RPC 1.0 compatibility mode.
    V1,
}

/// A method call or notification.
///
/// `id == None` makes this a notification: no response will ever be produced
/// for it, success or failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Request id; absent for notifications.
    pub id: Option<Id>,
    /// Name of the method to be invoked.  Never empty for a valid message.
    pub method: String,
    /// Arguments: a positional array, a named object, or absent.
    pub params: Option<JsonValue>,
}

impl Request {
    /// Create a method call request.
    pub fn call(id: Id, method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            id: Some(id),
            method: method.into(),
            params: params.into(),
        }
    }

    /// Create a notification (no id, no response expected).
    pub fn notification(method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params: params.into(),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A response correlated to a previously received request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request this responds to.  Null when the failure prevented
    /// the engine from learning the id (e.g. a parse error).
    pub id: Id,
    /// Success result or error details.
    pub payload: ResponsePayload,
}

impl Response {
    pub fn success(id: Id, result: JsonValue) -> Self {
        Self {
            id,
            payload: ResponsePayload::Success(result),
        }
    }

    pub fn error(id: Id, error: ErrorDetails) -> Self {
        Self {
            id,
            payload: ResponsePayload::Error(error),
        }
    }
}

/// Possible payloads of a response: exactly one of `result` or `error` on the
/// wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// The `result` member.  May be any value, including null.
    Success(JsonValue),
    /// The `error` member.
    Error(ErrorDetails),
}

impl ResponsePayload {
    /// Serialize a value into a success payload, degrading to an internal
    /// error payload if serialization fails.
    pub fn serialize_to_success<T: Serialize>(result: T) -> Self {
        match serde_json::to_value(result) {
            Ok(json) => ResponsePayload::Success(json),
            Err(e) => ResponsePayload::Error(ErrorDetails::internal_error(
                format!("error serializing {} response", std::any::type_name::<T>()),
                Some(JsonValue::String(e.to_string())),
            )),
        }
    }
}

/// The error-code catalogue.
///
/// Codes outside the reserved JSON-RPC range pass through as `Other`.  The two
/// engine-defined codes live in the implementation-defined `-32000..=-32099`
/// band plus the widely deployed `-32800` cancellation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The formatter rejected the bytes of a frame. (-32700)
    ParseError,
    /// Well-formed bytes that do not form a valid message. (-32600)
    InvalidRequest,
    /// No local target resolves the method name. (-32601)
    MethodNotFound,
    /// Argument coercion against every candidate overload failed. (-32602)
    InvalidParams,
    /// Unhandled engine failure while processing a request. (-32603)
    InternalError,
    /// The target returned a domain error. (-32000)
    InvocationError,
    /// The target honored a cancellation request. (-32800)
    RequestCancelled,
    /// Any other code, preserved verbatim.
    Other(i64),
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::InvocationError => -32000,
            ErrorCode::RequestCancelled => -32800,
            ErrorCode::Other(code) => code,
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -32000 => ErrorCode::InvocationError,
            -32800 => ErrorCode::RequestCancelled,
            other => ErrorCode::Other(other),
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(i64::deserialize(deserializer)?.into())
    }
}

/// The `error` object of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl ErrorDetails {
    pub fn new(
        code: ErrorCode,
        message: impl Into<String>,
        data: impl Into<Option<JsonValue>>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ParseError, message, data)
    }
    pub fn invalid_request(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, data)
    }
    pub fn method_not_found(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::MethodNotFound, message, data)
    }
    pub fn invalid_params(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidParams, message, data)
    }
    pub fn internal_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InternalError, message, data)
    }
    pub fn invocation_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvocationError, message, data)
    }
    pub fn request_cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RequestCancelled, message, None)
    }
}

/// Every valid message that can cross the wire: a request (or notification)
/// or a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// `(message kind, request id, method name)` for structured log fields.
    pub fn diagnostic_context(&self) -> (&'static str, Option<&Id>, Option<&str>) {
        match self {
            Message::Request(req) if req.is_notification() => {
                ("notification", None, Some(req.method.as_str()))
            }
            Message::Request(req) => ("request", req.id.as_ref(), Some(req.method.as_str())),
            Message::Response(resp) => ("response", Some(&resp.id), None),
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_equality_is_variant_and_value() {
        assert_eq!(Id::Number(1), Id::Number(1));
        assert_ne!(Id::Number(1), Id::Str("1".to_string()));
        assert_ne!(Id::Number(1), Id::Null);
        assert_eq!(Id::Str("a".into()), Id::Str("a".into()));
    }

    #[test]
    fn id_serde_preserves_variant() {
        let n: Id = serde_json::from_str("7").unwrap();
        assert_eq!(n, Id::Number(7));
        let s: Id = serde_json::from_str(r#""7""#).unwrap();
        assert_eq!(s, Id::Str("7".into()));
        let null: Id = serde_json::from_str("null").unwrap();
        assert_eq!(null, Id::Null);

        assert_eq!(serde_json::to_string(&Id::Number(7)).unwrap(), "7");
        assert_eq!(serde_json::to_string(&Id::Str("7".into())).unwrap(), r#""7""#);
        assert_eq!(serde_json::to_string(&Id::Null).unwrap(), "null");
    }

    #[test]
    fn error_code_round_trip() {
        for code in [
            ErrorCode::ParseError,
            ErrorCode::InvalidRequest,
            ErrorCode::MethodNotFound,
            ErrorCode::InvalidParams,
            ErrorCode::InternalError,
            ErrorCode::InvocationError,
            ErrorCode::RequestCancelled,
            ErrorCode::Other(-32050),
        ] {
            assert_eq!(ErrorCode::from(code.code()), code);
        }
        assert_eq!(ErrorCode::from(-32601), ErrorCode::MethodNotFound);
    }

    #[test]
    fn error_details_serialization_omits_missing_data() {
        let details = ErrorDetails::method_not_found("no such method", None);
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value, json!({"code": -32601, "message": "no such method"}));

        let details = ErrorDetails::invalid_params("bad", Some(json!({"arg": 1})));
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(
            value,
            json!({"code": -32602, "message": "bad", "data": {"arg": 1}})
        );
    }

    #[test]
    fn notification_is_request_without_id() {
        let note = Request::notification("log", Some(json!(["msg"])));
        assert!(note.is_notification());
        let call = Request::call(Id::Number(1), "log", None);
        assert!(!call.is_notification());
    }

    #[test]
    fn response_payload_serialize_to_success() {
        #[derive(Serialize)]
        struct Out {
            value: String,
        }
        let payload = ResponsePayload::serialize_to_success(Out {
            value: "test".into(),
        });
        match payload {
            ResponsePayload::Success(v) => assert_eq!(v["value"], "test"),
            ResponsePayload::Error(_) => panic!("expected success payload"),
        }
    }
}

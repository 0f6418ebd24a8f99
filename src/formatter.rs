//! The pluggable boundary between framed bytes and typed [`Message`] values.
//!
//! A formatter owns no session state; it is a pure value↔bytes codec for one
//! message at a time.  The framing layer treats it as not thread-safe and
//! never calls it re-entrantly for a single direction.
//!
//! Two implementations ship with the crate: [`JsonFormatter`] (text, with an
//! opt-in JSON-RPC 1.0 compatibility mode and text-encoding awareness) and
//! [`MessagePackFormatter`] (binary).
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde_json::{Map, Value as JsonValue, json};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, RpcError};
use crate::types::{ErrorDetails, Id, Message, ProtocolVersion, Request, Response, ResponsePayload};

/// Text encodings a text formatter can be asked to honor.
///
/// The default for text formatters is UTF-8 without a byte-order mark.  The
/// header-delimited framing can override the encoding for a single message via
/// the `charset=` parameter of its `Content-Type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
}

impl TextEncoding {
    /// Map a `charset=` label (case-insensitive) to an encoding.
    pub fn from_charset(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(TextEncoding::Utf8),
            // IANA says utf-16 without a BOM is big-endian, but every RPC
            // stack that emits this label writes little-endian.
            "utf-16" | "utf16" | "utf-16le" => Some(TextEncoding::Utf16Le),
            "utf-16be" => Some(TextEncoding::Utf16Be),
            _ => None,
        }
    }

    pub fn charset(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Utf16Le => "utf-16le",
            TextEncoding::Utf16Be => "utf-16be",
        }
    }
}

/// Value↔bytes codec for a single message.
pub trait MessageFormatter: Send + Sync + 'static {
    /// Short name for log fields and error messages.
    fn name(&self) -> &'static str;

    /// Decode one complete frame payload into a message.
    fn decode(&self, bytes: &[u8]) -> Result<Message>;

    /// Decode one frame payload that is known to use `encoding`.
    ///
    /// Binary formatters reject this with [`RpcError::UnsupportedEncoding`].
    fn decode_text(&self, bytes: &[u8], encoding: TextEncoding) -> Result<Message> {
        let _ = bytes;
        Err(RpcError::UnsupportedEncoding {
            encoding: encoding.charset().to_string(),
        })
    }

    /// Encode a message into `out`.  The framing layer owns the buffer and
    /// any length prefix around it.
    fn encode(&self, message: &Message, out: &mut BytesMut) -> Result<()>;

    /// Advertise the streaming decode capability, used by the framing layer
    /// for payloads above its large-message threshold.
    fn async_decoder(&self) -> Option<&dyn AsyncDecode> {
        None
    }
}

/// Optional formatter capability: decode a message directly from an async
/// byte stream of known length, consuming it in bounded chunks so the framing
/// layer never has to pre-buffer the payload.
#[async_trait]
pub trait AsyncDecode: Send + Sync {
    async fn decode_stream(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
        encoding: Option<TextEncoding>,
    ) -> Result<Message>;
}

/// Convert a neutral JSON value into a message, applying the wire-protocol
/// policy for `version`.
///
/// Classification order: a `method` member makes it a request; otherwise a
/// `result` member (null included, in 2.0) makes it a success response;
/// otherwise an `error` member makes it an error response; anything else is
/// invalid.  1.0 classifies responses by non-null `error` first since both
/// members are always present there.
fn classify_value(value: JsonValue, version: ProtocolVersion) -> Result<Message> {
    let obj = match value {
        JsonValue::Object(obj) => obj,
        other => {
            return Err(RpcError::InvalidMessage {
                id: None,
                reason: format!("message must be an object, got {}", value_kind(&other)),
            });
        }
    };

    // Best-effort id for the error response when the rest of the message is
    // rejected, so the peer can still correlate the failure.
    let salvage_id = obj.get("id").and_then(|v| parse_id(v).ok());

    match (version, obj.get("jsonrpc")) {
        (ProtocolVersion::V2, Some(JsonValue::String(v))) if v == "2.0" => {}
        (ProtocolVersion::V2, _) => {
            return Err(RpcError::InvalidMessage {
                id: salvage_id,
                reason: "message is missing the jsonrpc: \"2.0\" member".to_string(),
            });
        }
        (ProtocolVersion::V1, Some(_)) => {
            return Err(RpcError::InvalidMessage {
                id: salvage_id,
                reason: "jsonrpc member is not allowed in 1.0 mode".to_string(),
            });
        }
        (ProtocolVersion::V1, None) => {}
    }

    if let Some(method) = obj.get("method") {
        let method = match method.as_str() {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => {
                return Err(RpcError::InvalidMessage {
                    id: salvage_id,
                    reason: "method must be a non-empty string".to_string(),
                });
            }
        };

        let params = match obj.get("params") {
            None | Some(JsonValue::Null) => None,
            Some(p @ JsonValue::Array(_)) => Some(p.clone()),
            Some(p @ JsonValue::Object(_)) => {
                if version == ProtocolVersion::V1 {
                    return Err(RpcError::InvalidMessage {
                        id: salvage_id,
                        reason: "named parameters are not allowed in 1.0 mode".to_string(),
                    });
                }
                Some(p.clone())
            }
            Some(other) => {
                return Err(RpcError::InvalidMessage {
                    id: salvage_id,
                    reason: format!("params must be an array or object, got {}", value_kind(other)),
                });
            }
        };

        let id = match (version, obj.get("id")) {
            // 2.0 notifications omit the id member entirely.
            (ProtocolVersion::V2, None) => None,
            (ProtocolVersion::V2, Some(v)) => Some(parse_id(v)?),
            // 1.0 has no separate notification form; a null id means one.
            (ProtocolVersion::V1, Some(JsonValue::Null)) => None,
            (ProtocolVersion::V1, Some(v)) => Some(parse_id(v)?),
            (ProtocolVersion::V1, None) => {
                return Err(RpcError::InvalidMessage {
                    id: None,
                    reason: "1.0 messages must carry an id member".to_string(),
                });
            }
        };

        return Ok(Message::Request(Request { id, method, params }));
    }

    let id = match obj.get("id") {
        Some(v) => parse_id(v)?,
        None => {
            return Err(RpcError::InvalidMessage {
                id: None,
                reason: "response is missing the id member".to_string(),
            });
        }
    };

    let payload = match version {
        ProtocolVersion::V2 => {
            if let Some(result) = obj.get("result") {
                ResponsePayload::Success(result.clone())
            } else if let Some(error) = obj.get("error") {
                ResponsePayload::Error(parse_error_details(error, &id)?)
            } else {
                return Err(RpcError::InvalidMessage {
                    id: Some(id),
                    reason: "message has no method, result, or error member".to_string(),
                });
            }
        }
        ProtocolVersion::V1 => match obj.get("error") {
            Some(error) if !error.is_null() => {
                ResponsePayload::Error(parse_error_details(error, &id)?)
            }
            _ => match obj.get("result") {
                Some(result) => ResponsePayload::Success(result.clone()),
                None => {
                    return Err(RpcError::InvalidMessage {
                        id: Some(id),
                        reason: "message has no method, result, or error member".to_string(),
                    });
                }
            },
        },
    };

    Ok(Message::Response(Response { id, payload }))
}

fn parse_id(value: &JsonValue) -> Result<Id> {
    match value {
        JsonValue::Null => Ok(Id::Null),
        JsonValue::Number(n) => n.as_u64().map(Id::Number).ok_or_else(|| {
            RpcError::InvalidMessage {
                id: None,
                reason: format!("id must be an unsigned integer or string, got {n}"),
            }
        }),
        JsonValue::String(s) => Ok(Id::Str(s.clone())),
        other => Err(RpcError::InvalidMessage {
            id: None,
            reason: format!("id must be an unsigned integer or string, got {}", value_kind(other)),
        }),
    }
}

fn parse_error_details(value: &JsonValue, id: &Id) -> Result<ErrorDetails> {
    serde_json::from_value(value.clone()).map_err(|e| RpcError::InvalidMessage {
        id: Some(id.clone()),
        reason: format!("malformed error object: {e}"),
    })
}

fn value_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

fn id_to_value(id: &Option<Id>) -> JsonValue {
    match id {
        None | Some(Id::Null) => JsonValue::Null,
        Some(Id::Number(n)) => json!(n),
        Some(Id::Str(s)) => json!(s),
    }
}

/// Render a message into the neutral value representation for `version`.
fn message_to_value(message: &Message, version: ProtocolVersion) -> Result<JsonValue> {
    let mut obj = Map::new();
    if version == ProtocolVersion::V2 {
        obj.insert("jsonrpc".to_string(), json!("2.0"));
    }

    match message {
        Message::Request(req) => {
            if version == ProtocolVersion::V1 {
                if matches!(req.params, Some(JsonValue::Object(_))) {
                    return Err(RpcError::EncodeMessage {
                        reason: "named parameters are not representable in 1.0 mode".to_string(),
                    });
                }
                // 1.0 requires both members on every request; a notification
                // is a request with a null id.
                obj.insert("id".to_string(), id_to_value(&req.id));
                obj.insert("method".to_string(), json!(req.method));
                obj.insert(
                    "params".to_string(),
                    req.params.clone().unwrap_or_else(|| json!([])),
                );
            } else {
                obj.insert("method".to_string(), json!(req.method));
                if let Some(params) = &req.params {
                    obj.insert("params".to_string(), params.clone());
                }
                if let Some(id) = &req.id {
                    obj.insert("id".to_string(), serde_json::to_value(id).unwrap_or(JsonValue::Null));
                }
            }
        }
        Message::Response(resp) => {
            let id = serde_json::to_value(&resp.id).unwrap_or(JsonValue::Null);
            match (&resp.payload, version) {
                (ResponsePayload::Success(result), ProtocolVersion::V2) => {
                    obj.insert("result".to_string(), result.clone());
                }
                (ResponsePayload::Error(error), ProtocolVersion::V2) => {
                    obj.insert("error".to_string(), serde_json::to_value(error).unwrap_or_default());
                }
                // 1.0 responses carry both members, the unused one null.
                (ResponsePayload::Success(result), ProtocolVersion::V1) => {
                    obj.insert("result".to_string(), result.clone());
                    obj.insert("error".to_string(), JsonValue::Null);
                }
                (ResponsePayload::Error(error), ProtocolVersion::V1) => {
                    obj.insert("result".to_string(), JsonValue::Null);
                    obj.insert("error".to_string(), serde_json::to_value(error).unwrap_or_default());
                }
            }
            obj.insert("id".to_string(), id);
        }
    }

    Ok(JsonValue::Object(obj))
}

/// The JSON text formatter.
///
/// Defaults to JSON-RPC 2.0 over UTF-8 without a byte-order mark.
/// [`JsonFormatter::v1`] opts into the 1.0 compatibility mode.
#[derive(Debug, Clone, Default)]
pub struct JsonFormatter {
    version: ProtocolVersion,
}

impl JsonFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A formatter speaking the JSON-RPC 1.0 wire dialect.
    pub fn v1() -> Self {
        Self {
            version: ProtocolVersion::V1,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    fn decode_value(&self, value: JsonValue) -> Result<Message> {
        classify_value(value, self.version)
    }
}

impl MessageFormatter for JsonFormatter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let value: JsonValue =
            serde_json::from_slice(bytes).map_err(|e| RpcError::ParseMessage {
                format: "json",
                source: Box::new(e),
            })?;
        self.decode_value(value)
    }

    fn decode_text(&self, bytes: &[u8], encoding: TextEncoding) -> Result<Message> {
        let text = match encoding {
            TextEncoding::Utf8 => return self.decode(bytes),
            TextEncoding::Utf16Le => decode_utf16(bytes, u16::from_le_bytes)?,
            TextEncoding::Utf16Be => decode_utf16(bytes, u16::from_be_bytes)?,
        };
        let value: JsonValue =
            serde_json::from_str(&text).map_err(|e| RpcError::ParseMessage {
                format: "json",
                source: Box::new(e),
            })?;
        self.decode_value(value)
    }

    fn encode(&self, message: &Message, out: &mut BytesMut) -> Result<()> {
        let value = message_to_value(message, self.version)?;
        serde_json::to_writer(out.writer(), &value).map_err(|e| RpcError::EncodeMessage {
            reason: e.to_string(),
        })
    }

    fn async_decoder(&self) -> Option<&dyn AsyncDecode> {
        Some(self)
    }
}

#[async_trait]
impl AsyncDecode for JsonFormatter {
    async fn decode_stream(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
        encoding: Option<TextEncoding>,
    ) -> Result<Message> {
        let buf = read_payload(reader, len).await?;
        match encoding {
            None | Some(TextEncoding::Utf8) => self.decode(&buf),
            Some(other) => self.decode_text(&buf, other),
        }
    }
}

fn decode_utf16(bytes: &[u8], combine: fn([u8; 2]) -> u16) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(RpcError::ParseMessage {
            format: "json",
            source: "utf-16 payload has an odd byte count".into(),
        });
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| combine([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| RpcError::ParseMessage {
        format: "json",
        source: Box::new(e),
    })
}

/// Pull exactly `len` bytes off the stream in bounded chunks.
async fn read_payload(reader: &mut (dyn AsyncRead + Send + Unpin), len: u64) -> Result<BytesMut> {
    const CHUNK: usize = 8 * 1024;
    let mut limited = reader.take(len);
    let mut buf = BytesMut::with_capacity(CHUNK.min(len as usize));
    loop {
        let n = limited.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
    }
    if (buf.len() as u64) < len {
        return Err(RpcError::UnexpectedEof);
    }
    Ok(buf)
}

/// The MessagePack binary formatter.
///
/// Speaks 2.0 semantics over the same neutral value representation the JSON
/// formatter uses, so arguments round-trip identically across the two.
/// Rejects text-encoding requests.
#[derive(Debug, Clone, Default)]
pub struct MessagePackFormatter;

impl MessagePackFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl MessageFormatter for MessagePackFormatter {
    fn name(&self) -> &'static str {
        "messagepack"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let value: JsonValue =
            rmp_serde::from_slice(bytes).map_err(|e| RpcError::ParseMessage {
                format: "messagepack",
                source: Box::new(e),
            })?;
        classify_value(value, ProtocolVersion::V2)
    }

    fn encode(&self, message: &Message, out: &mut BytesMut) -> Result<()> {
        let value = message_to_value(message, ProtocolVersion::V2)?;
        rmp_serde::encode::write(&mut out.writer(), &value).map_err(|e| RpcError::EncodeMessage {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorCode;
    use assert_matches::assert_matches;

    fn decode_str(fmt: &JsonFormatter, text: &str) -> Result<Message> {
        fmt.decode(text.as_bytes())
    }

    fn encode_to_value(fmt: &dyn MessageFormatter, message: &Message) -> JsonValue {
        let mut out = BytesMut::new();
        fmt.encode(message, &mut out).unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    #[test]
    fn v2_decodes_spec_request() {
        let fmt = JsonFormatter::new();
        let msg = decode_str(
            &fmt,
            r#"{"jsonrpc":"2.0","id":7,"method":"echo","params":["hi"]}"#,
        )
        .unwrap();
        assert_matches!(msg, Message::Request(req) => {
            assert_eq!(req.id, Some(Id::Number(7)));
            assert_eq!(req.method, "echo");
            assert_eq!(req.params, Some(json!(["hi"])));
        });
    }

    #[test]
    fn v2_rejects_missing_or_wrong_version() {
        let fmt = JsonFormatter::new();
        let err = decode_str(&fmt, r#"{"id":1,"method":"m"}"#).unwrap_err();
        assert_matches!(err, RpcError::InvalidMessage { id: Some(Id::Number(1)), .. });

        let err = decode_str(&fmt, r#"{"jsonrpc":"1.5","id":1,"method":"m"}"#).unwrap_err();
        assert!(err.is_recoverable_decode());
    }

    #[test]
    fn v1_rejects_jsonrpc_member() {
        let fmt = JsonFormatter::v1();
        let err = decode_str(&fmt, r#"{"jsonrpc":"2.0","id":1,"method":"m","params":[]}"#)
            .unwrap_err();
        assert_matches!(err, RpcError::InvalidMessage { .. });
    }

    #[test]
    fn v1_null_id_is_a_notification() {
        let fmt = JsonFormatter::v1();
        let msg = decode_str(&fmt, r#"{"id":null,"method":"log","params":["msg"]}"#).unwrap();
        assert_matches!(msg, Message::Request(req) => assert!(req.is_notification()));

        // ...and a missing id is rejected outright.
        let err = decode_str(&fmt, r#"{"method":"log","params":[]}"#).unwrap_err();
        assert_matches!(err, RpcError::InvalidMessage { .. });
    }

    #[test]
    fn v1_rejects_named_params() {
        let fmt = JsonFormatter::v1();
        let err =
            decode_str(&fmt, r#"{"id":1,"method":"m","params":{"a":1}}"#).unwrap_err();
        assert_matches!(err, RpcError::InvalidMessage { .. });

        let message = Message::Request(Request::call(Id::Number(1), "m", Some(json!({"a": 1}))));
        let mut out = BytesMut::new();
        let err = fmt.encode(&message, &mut out).unwrap_err();
        assert_matches!(err, RpcError::EncodeMessage { .. });
    }

    #[test]
    fn v2_notification_omits_id_and_v1_materializes_null() {
        let note = Message::Request(Request::notification("log", Some(json!(["msg"]))));

        let v2 = encode_to_value(&JsonFormatter::new(), &note);
        assert_eq!(
            v2,
            json!({"jsonrpc":"2.0","method":"log","params":["msg"]})
        );

        let v1 = encode_to_value(&JsonFormatter::v1(), &note);
        assert_eq!(v1, json!({"id":null,"method":"log","params":["msg"]}));
    }

    #[test]
    fn v1_success_carries_explicit_null_error() {
        let resp = Message::Response(Response::success(Id::Number(3), json!("ok")));
        let v1 = encode_to_value(&JsonFormatter::v1(), &resp);
        assert_eq!(v1, json!({"id":3,"result":"ok","error":null}));

        let resp = Message::Response(Response::error(
            Id::Number(4),
            ErrorDetails::method_not_found("nope", None),
        ));
        let v1 = encode_to_value(&JsonFormatter::v1(), &resp);
        assert_eq!(v1["result"], JsonValue::Null);
        assert_eq!(v1["error"]["code"], json!(-32601));
    }

    #[test]
    fn v2_null_result_classifies_as_success() {
        let fmt = JsonFormatter::new();
        let msg = decode_str(&fmt, r#"{"jsonrpc":"2.0","result":null,"id":2}"#).unwrap();
        assert_matches!(
            msg,
            Message::Response(Response { payload: ResponsePayload::Success(JsonValue::Null), .. })
        );
    }

    #[test]
    fn v1_classifies_by_non_null_error_first() {
        let fmt = JsonFormatter::v1();
        let msg = decode_str(
            &fmt,
            r#"{"id":2,"result":null,"error":{"code":-32000,"message":"bad"}}"#,
        )
        .unwrap();
        assert_matches!(msg, Message::Response(Response { payload: ResponsePayload::Error(e), .. }) => {
            assert_eq!(e.code, ErrorCode::InvocationError);
        });

        let msg = decode_str(&fmt, r#"{"id":2,"result":19,"error":null}"#).unwrap();
        assert_matches!(
            msg,
            Message::Response(Response { payload: ResponsePayload::Success(v), .. }) if v == json!(19)
        );
    }

    #[test]
    fn classification_fails_without_method_result_or_error() {
        let fmt = JsonFormatter::new();
        let err = decode_str(&fmt, r#"{"jsonrpc":"2.0","id":9}"#).unwrap_err();
        assert_matches!(err, RpcError::InvalidMessage { id: Some(Id::Number(9)), .. });
    }

    #[test]
    fn fractional_and_negative_ids_are_rejected() {
        let fmt = JsonFormatter::new();
        for bad in [
            r#"{"jsonrpc":"2.0","id":1.5,"method":"m"}"#,
            r#"{"jsonrpc":"2.0","id":-3,"method":"m"}"#,
            r#"{"jsonrpc":"2.0","id":true,"method":"m"}"#,
        ] {
            assert_matches!(decode_str(&fmt, bad), Err(RpcError::InvalidMessage { .. }));
        }
    }

    #[test]
    fn missing_and_null_params_both_decode_as_no_arguments() {
        let fmt = JsonFormatter::new();
        for text in [
            r#"{"jsonrpc":"2.0","id":1,"method":"m"}"#,
            r#"{"jsonrpc":"2.0","id":1,"method":"m","params":null}"#,
        ] {
            let msg = decode_str(&fmt, text).unwrap();
            assert_matches!(msg, Message::Request(req) => assert_eq!(req.params, None));
        }
    }

    #[test]
    fn json_round_trip() {
        let fmt = JsonFormatter::new();
        let messages = vec![
            Message::Request(Request::call(Id::Number(1), "add", Some(json!([1, 2])))),
            Message::Request(Request::call(
                Id::Str("abc".into()),
                "add",
                Some(json!({"a": 1, "b": 2})),
            )),
            Message::Request(Request::notification("tick", None)),
            Message::Response(Response::success(Id::Number(1), json!({"ok": true}))),
            Message::Response(Response::error(
                Id::Null,
                ErrorDetails::parse_error("Parse error", None),
            )),
        ];
        for message in messages {
            let mut out = BytesMut::new();
            fmt.encode(&message, &mut out).unwrap();
            let back = fmt.decode(&out).unwrap();
            assert_eq!(back, message);
        }
    }

    #[test]
    fn messagepack_round_trip() {
        let fmt = MessagePackFormatter::new();
        let messages = vec![
            Message::Request(Request::call(Id::Number(42), "echo", Some(json!(["hi"])))),
            Message::Request(Request::notification("log", Some(json!({"level": "info"})))),
            Message::Response(Response::success(Id::Str("x".into()), json!([1, 2, 3]))),
            Message::Response(Response::error(
                Id::Number(9),
                ErrorDetails::request_cancelled("cancelled"),
            )),
        ];
        for message in messages {
            let mut out = BytesMut::new();
            fmt.encode(&message, &mut out).unwrap();
            let back = fmt.decode(&out).unwrap();
            assert_eq!(back, message);
        }
    }

    #[test]
    fn messagepack_rejects_text_encoding() {
        let fmt = MessagePackFormatter::new();
        let err = fmt.decode_text(b"", TextEncoding::Utf16Le).unwrap_err();
        assert_matches!(err, RpcError::UnsupportedEncoding { encoding } => {
            assert_eq!(encoding, "utf-16le");
        });
        assert!(fmt.async_decoder().is_none());
    }

    #[test]
    fn utf16_payloads_decode_with_an_override() {
        let fmt = JsonFormatter::new();
        let text = r#"{"jsonrpc":"2.0","id":1,"method":"m"}"#;

        let le: Vec<u8> = text
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        let msg = fmt.decode_text(&le, TextEncoding::Utf16Le).unwrap();
        assert_matches!(msg, Message::Request(_));

        let be: Vec<u8> = text
            .encode_utf16()
            .flat_map(|unit| unit.to_be_bytes())
            .collect();
        let msg = fmt.decode_text(&be, TextEncoding::Utf16Be).unwrap();
        assert_matches!(msg, Message::Request(_));
    }

    #[tokio::test]
    async fn async_decode_consumes_exactly_len_bytes() {
        let fmt = JsonFormatter::new();
        let text = r#"{"jsonrpc":"2.0","id":1,"method":"m"}"#;
        let mut data = text.as_bytes().to_vec();
        data.extend_from_slice(b"trailing");

        let mut reader = std::io::Cursor::new(data);
        let decoder = fmt.async_decoder().unwrap();
        let msg = decoder
            .decode_stream(&mut reader, text.len() as u64, None)
            .await
            .unwrap();
        assert_matches!(msg, Message::Request(_));
        assert_eq!(reader.position() as usize, text.len());
    }

    #[tokio::test]
    async fn async_decode_reports_short_streams() {
        let fmt = JsonFormatter::new();
        let mut reader = std::io::Cursor::new(b"{\"jsonrpc\"".to_vec());
        let decoder = fmt.async_decoder().unwrap();
        let err = decoder.decode_stream(&mut reader, 100, None).await.unwrap_err();
        assert_matches!(err, RpcError::UnexpectedEof);
    }

    #[test]
    fn charset_labels() {
        assert_eq!(TextEncoding::from_charset("UTF-8"), Some(TextEncoding::Utf8));
        assert_eq!(TextEncoding::from_charset(" utf-16 "), Some(TextEncoding::Utf16Le));
        assert_eq!(TextEncoding::from_charset("utf-16be"), Some(TextEncoding::Utf16Be));
        assert_eq!(TextEncoding::from_charset("latin-1"), None);
    }
}

use crate::session::DisconnectReason;
use crate::types::{self, Id};
use thiserror::Error;

pub type Result<T, E = RpcError> = std::result::Result<T, E>;

/// Everything that can go wrong inside the engine.
///
/// The read loop classifies these into two buckets: recoverable errors scoped
/// to a single inbound message (answered on the wire, session keeps running)
/// and fatal errors that leave the framing desynchronized or the transport
/// unusable (session disconnects).
#[derive(Debug, Error)]
pub enum RpcError {
    /// The formatter rejected the bytes of one complete frame.
    #[error("error parsing {format} message")]
    ParseMessage {
        format: &'static str,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    /// Bytes decoded fine but do not form a valid message in the configured
    /// protocol version.
    #[error("invalid message: {reason}")]
    InvalidMessage { id: Option<Id>, reason: String },
    /// A text encoding was requested that this formatter cannot honor.
    #[error("unsupported text encoding '{encoding}'")]
    UnsupportedEncoding { encoding: String },
    /// The message cannot be represented in the configured protocol version.
    #[error("cannot encode message: {reason}")]
    EncodeMessage { reason: String },
    #[error("error serializing request arguments of type {type_name}")]
    SerRequest {
        source: serde_json::Error,
        type_name: &'static str,
    },
    #[error("error deserializing response JSON into {type_name}")]
    DeserResponse {
        source: serde_json::Error,
        type_name: &'static str,
        response: types::JsonValue,
    },
    /// The byte stream no longer lines up with frame boundaries.
    #[error("framing desynchronized: {reason}")]
    Framing { reason: String },
    /// A declared frame length exceeded the plausibility ceiling.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    OversizedFrame { len: u64, max: u64 },
    /// The transport ended mid-frame.
    #[error("transport closed in the middle of a frame")]
    UnexpectedEof,
    #[error("transport I/O error")]
    Io {
        #[from]
        source: std::io::Error,
    },
    /// The remote peer answered a method call with an error response.
    #[error("method '{method}' failed with error {}: {}", error.code, error.message)]
    MethodError {
        method: String,
        error: types::ErrorDetails,
    },
    /// The operation was cancelled before a usable result arrived.
    #[error("operation was cancelled")]
    Cancelled,
    /// The session is past the point where any call can succeed.
    #[error("connection lost ({reason})")]
    ConnectionLost { reason: DisconnectReason },
    #[error("the session has not started listening yet")]
    NotYetListening,
    #[error("the session is already listening")]
    AlreadyListening,
}

impl RpcError {
    /// True for errors scoped to a single inbound message; the read loop
    /// answers them on the wire and keeps going.
    pub fn is_recoverable_decode(&self) -> bool {
        matches!(
            self,
            RpcError::ParseMessage { .. }
                | RpcError::InvalidMessage { .. }
                | RpcError::UnsupportedEncoding { .. }
        )
    }

    /// The disconnect reason a fatal read-loop error maps to.
    pub(crate) fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            RpcError::Framing { .. } | RpcError::OversizedFrame { .. } => {
                DisconnectReason::ParseError
            }
            RpcError::UnexpectedEof | RpcError::Io { .. } => DisconnectReason::StreamError,
            _ => DisconnectReason::FatalException,
        }
    }

    /// The wire response answering a recoverable decode error.
    pub(crate) fn to_decode_response(&self) -> types::Response {
        match self {
            RpcError::InvalidMessage { id, reason } => types::Response::error(
                id.clone().unwrap_or(Id::Null),
                types::ErrorDetails::invalid_request(reason.clone(), None),
            ),
            RpcError::UnsupportedEncoding { encoding } => types::Response::error(
                Id::Null,
                types::ErrorDetails::invalid_request(
                    format!("unsupported text encoding '{encoding}'"),
                    None,
                ),
            ),
            _ => types::Response::error(
                Id::Null,
                types::ErrorDetails::parse_error("Parse error", None),
            ),
        }
    }
}

/// Errors crossing the wire must not leak internal detail to the remote peer.
impl From<RpcError> for types::ErrorDetails {
    fn from(val: RpcError) -> Self {
        match val {
            RpcError::ParseMessage { .. } => types::ErrorDetails::parse_error("Parse error", None),
            RpcError::InvalidMessage { reason, .. } => {
                types::ErrorDetails::invalid_request(reason, None)
            }
            RpcError::MethodError { error, .. } => error,
            RpcError::Cancelled => types::ErrorDetails::request_cancelled("request was cancelled"),
            RpcError::SerRequest { .. } | RpcError::DeserResponse { .. } => {
                types::ErrorDetails::internal_error("serialization error", None)
            }
            _ => types::ErrorDetails::internal_error("internal error", None),
        }
    }
}

/// Try to make something useful from a panic payload for logging purposes.
pub(crate) fn panic_err_to_string(err: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = err.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("panic of type {}", std::any::type_name_of_val(&*err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorCode;
    use assert_matches::assert_matches;

    #[test]
    fn recoverable_classification() {
        let parse = RpcError::ParseMessage {
            format: "json",
            source: "bad".into(),
        };
        assert!(parse.is_recoverable_decode());

        let framing = RpcError::Framing {
            reason: "missing header terminator".into(),
        };
        assert!(!framing.is_recoverable_decode());
        assert_eq!(framing.disconnect_reason(), DisconnectReason::ParseError);

        let io = RpcError::Io {
            source: std::io::Error::other("boom"),
        };
        assert_eq!(io.disconnect_reason(), DisconnectReason::StreamError);
    }

    #[test]
    fn decode_response_carries_id_when_known() {
        let err = RpcError::InvalidMessage {
            id: Some(Id::Number(3)),
            reason: "no method or result".into(),
        };
        let response = err.to_decode_response();
        assert_eq!(response.id, Id::Number(3));
        assert_matches!(
            response.payload,
            types::ResponsePayload::Error(details) if details.code == ErrorCode::InvalidRequest
        );
    }

    #[test]
    fn wire_conversion_hides_internals() {
        let err = RpcError::Io {
            source: std::io::Error::other("secret path /etc/foo"),
        };
        let details: types::ErrorDetails = err.into();
        assert_eq!(details.code, ErrorCode::InternalError);
        assert!(!details.message.contains("secret"));
    }
}

//! A bidirectional JSON-RPC engine that rides on top of an arbitrary duplex
//! byte transport.
//!
//! The crate speaks the JSON-RPC 2.0 wire protocol (with an opt-in 1.0
//! compatibility mode), multiplexes concurrent requests, notifications, and
//! responses over a single transport, routes inbound requests to locally
//! registered handlers, and correlates inbound responses to outstanding
//! outbound calls.
//!
//! The moving parts, bottom up:
//!
//! - [`MessageFormatter`]: value↔bytes codec for one message.  [`JsonFormatter`]
//!   and [`MessagePackFormatter`] ship with the crate.
//! - [`MessageHandler`]: framed reading and writing of discrete messages.
//!   [`LengthPrefixedHandler`] and [`HeaderDelimitedHandler`] cover the two
//!   common framings; implement the trait for anything else.
//! - [`Router`] and [`Handler`]: the local method map and the targets it
//!   dispatches to, written as plain `async` functions with extractor
//!   arguments.
//! - [`Session`]: the full-duplex engine tying it together — the read loop,
//!   the outstanding-request table, per-request cancellation via
//!   `$/cancelRequest`, and the disconnection protocol.
//!
//! ```no_run
//! use duplex_jsonrpc::{JsonFormatter, LengthPrefixedHandler, Params, Session};
//! use serde_json::Value;
//!
//! # async fn run(socket: tokio::net::TcpStream) -> duplex_jsonrpc::Result<()> {
//! let session = Session::builder()
//!     .without_state()
//!     .with_handler("echo", |Params(s): Params<String>| async move { serde_json::json!(s) })
//!     .build(LengthPrefixedHandler::from_stream(socket, JsonFormatter::new()));
//! session.start_listening()?;
//!
//! let upper: Value = session.invoke_with_params("toUpper", ("hi",)).await?;
//! # let _ = upper;
//! # Ok(())
//! # }
//! ```

/// Re-export the exact async-trait macro we use, for implementing
/// [`MessageHandler`] outside this crate.
#[doc(hidden)]
pub use async_trait::async_trait;

mod error;
mod formatter;
mod framing;
mod handler;
mod outstanding;
mod router;
mod session;
#[cfg(test)]
pub mod testing;
mod types;

pub use error::{Result, RpcError};
pub use formatter::{
    AsyncDecode, JsonFormatter, MessageFormatter, MessagePackFormatter, TextEncoding,
};
pub use framing::{
    HeaderDelimitedHandler, LARGE_MESSAGE_THRESHOLD, LengthPrefixedHandler, MessageHandler,
};
pub use handler::{
    FromRequest, Handler, InboundRequest, IntoResponse, MethodName, MethodResponse, Params,
    RequestToken, State,
};
pub use router::{MethodOptions, NameTransform, ParamsArity, Router};
pub use session::{
    CANCEL_REQUEST_METHOD, DisconnectReason, DisconnectedEvent, RequestHandle, Session,
    SessionBuilder, SessionOptions, SessionState,
};
pub use types::{
    ErrorCode, ErrorDetails, Id, JsonValue, Message, ProtocolVersion, Request, Response,
    ResponsePayload,
};

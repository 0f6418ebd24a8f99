//! Helpers for exercising the engine in tests.
//!
//! This module is only compiled under `test`; the integration tests include
//! it with a `#[path]` attribute so both sides share one set of helpers.
use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex};

use crate::{JsonFormatter, LengthPrefixedHandler};

/// Capacity of the in-memory duplex pipes used by tests.
pub const TEST_CHANNEL_CAPACITY: usize = 256 * 1024;

/// Initialize tracing for test output.
///
/// Idempotent; safe to call from every test in every thread.
pub fn init_test_logging() {
    use std::sync::OnceLock;

    const DEFAULT_LOG_FILTER: &str = "debug";
    static INIT_LOGGING: OnceLock<()> = OnceLock::new();

    INIT_LOGGING.get_or_init(|| {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub type TestHandler = LengthPrefixedHandler<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// A connected pair of length-prefixed JSON message handlers over an
/// in-memory pipe.  Returned as `(client_handler, server_handler)`.
pub fn json_handler_pair() -> (TestHandler, TestHandler) {
    let (client, server) = duplex(TEST_CHANNEL_CAPACITY);
    (
        LengthPrefixedHandler::from_stream(client, JsonFormatter::new()),
        LengthPrefixedHandler::from_stream(server, JsonFormatter::new()),
    )
}

/// A raw in-memory pipe plus a ready handler on the near side, for tests
/// that script the remote peer byte by byte.
pub fn json_handler_with_raw_peer() -> (TestHandler, DuplexStream) {
    let (near, far) = duplex(TEST_CHANNEL_CAPACITY);
    (
        LengthPrefixedHandler::from_stream(near, JsonFormatter::new()),
        far,
    )
}

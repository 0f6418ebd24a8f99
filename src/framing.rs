//! Framed reading and writing of discrete messages over a byte-oriented
//! duplex transport.
//!
//! A message handler owns its reader and writer halves plus the formatter,
//! and guarantees the write discipline: concurrent writers are serialized and
//! the bytes of two messages never interleave.  Reads hand one decoded
//! message at a time to the session's read loop, returning `Ok(None)` exactly
//! once on a clean end-of-stream at a frame boundary.
//!
//! Two framings are provided: [`LengthPrefixedHandler`] (a 4-byte big-endian
//! payload length before each message) and [`HeaderDelimitedHandler`]
//! (HTTP-like `Name: Value` headers with `Content-Length`, terminated by a
//! blank line).
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};
use crate::formatter::{MessageFormatter, TextEncoding};
use crate::types::Message;

/// Payloads at or above this size use the formatter's streaming decode path
/// when it advertises one, instead of being buffered by the framing layer.
pub const LARGE_MESSAGE_THRESHOLD: u64 = 64 * 1024;

/// Plausibility ceiling on a declared frame length.  Anything larger is
/// treated as framing desynchronization, not a real message.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Upper bound on the header block of one header-delimited frame.
const MAX_HEADER_BLOCK: usize = 16 * 1024;

/// One message in, one message out, with cancellation.
///
/// Implementations are internally synchronized: `read` and `write` take
/// `&self` and may be called from concurrent tasks.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        true
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` exactly once, when the transport ends cleanly at a
    /// frame boundary.  End-of-stream inside a frame is
    /// [`RpcError::UnexpectedEof`].  A triggered `cancel` token resolves the
    /// call with [`RpcError::Cancelled`].
    async fn read(&self, cancel: &CancellationToken) -> Result<Option<Message>>;

    /// Write one message and flush it to the transport.
    ///
    /// Completes only once the bytes are fully handed to the transport.
    /// Concurrent calls are serialized; frames never interleave.
    async fn write(&self, message: &Message) -> Result<()>;

    /// Shut down the write half of the transport.
    async fn close(&self) -> Result<()>;
}

struct WriteState<W> {
    io: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Send + Unpin> WriteState<W> {
    fn new(io: W) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }
}

fn map_read_eof(e: std::io::Error) -> RpcError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        RpcError::UnexpectedEof
    } else {
        e.into()
    }
}

/// Framing that precedes every message with a 4-byte big-endian unsigned
/// length of the payload that follows.
pub struct LengthPrefixedHandler<R, W> {
    formatter: Box<dyn MessageFormatter>,
    reader: Mutex<R>,
    writer: Mutex<WriteState<W>>,
}

impl<R, W> LengthPrefixedHandler<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(reader: R, writer: W, formatter: impl MessageFormatter) -> Self {
        Self {
            formatter: Box::new(formatter),
            reader: Mutex::new(reader),
            writer: Mutex::new(WriteState::new(writer)),
        }
    }

    async fn read_frame(io: &mut R, formatter: &dyn MessageFormatter) -> Result<Option<Message>> {
        // The length prefix is read byte-wise so that end-of-stream before
        // the first byte is a clean close, while a truncated prefix is not.
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            let n = io.read(&mut prefix[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(RpcError::UnexpectedEof)
                };
            }
            filled += n;
        }

        let len = u64::from(u32::from_be_bytes(prefix));
        if len > MAX_FRAME_LEN {
            return Err(RpcError::OversizedFrame {
                len,
                max: MAX_FRAME_LEN,
            });
        }

        if len >= LARGE_MESSAGE_THRESHOLD {
            if let Some(decoder) = formatter.async_decoder() {
                tracing::trace!(len, "decoding large frame via the streaming path");
                return decoder.decode_stream(io, len, None).await.map(Some);
            }
        }

        let mut payload = vec![0u8; len as usize];
        io.read_exact(&mut payload).await.map_err(map_read_eof)?;
        formatter.decode(&payload).map(Some)
    }
}

impl<S> LengthPrefixedHandler<tokio::io::ReadHalf<S>, tokio::io::WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Split a duplex stream and frame messages over it.
    pub fn from_stream(stream: S, formatter: impl MessageFormatter) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, formatter)
    }
}

#[async_trait]
impl<R, W> MessageHandler for LengthPrefixedHandler<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn read(&self, cancel: &CancellationToken) -> Result<Option<Message>> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(RpcError::Cancelled),
            result = Self::read_frame(&mut reader, self.formatter.as_ref()) => result,
        }
    }

    async fn write(&self, message: &Message) -> Result<()> {
        let mut state = self.writer.lock().await;
        let WriteState { io, buf } = &mut *state;

        // Serialize behind a 4-byte placeholder, then back-patch the header
        // once the payload length is known.
        buf.clear();
        buf.put_u32(0);
        self.formatter.encode(message, buf)?;
        let payload_len = (buf.len() - 4) as u64;
        if payload_len > MAX_FRAME_LEN {
            return Err(RpcError::OversizedFrame {
                len: payload_len,
                max: MAX_FRAME_LEN,
            });
        }
        buf[..4].copy_from_slice(&(payload_len as u32).to_be_bytes());

        io.write_all(buf).await?;
        io.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.writer.lock().await;
        state.io.shutdown().await?;
        Ok(())
    }
}

struct HeaderReadState<R> {
    io: R,
    buf: BytesMut,
}

/// How the payload of one header-delimited frame is encoded.
enum FrameEncoding {
    /// No charset parameter; the formatter's default applies.
    Default,
    Known(TextEncoding),
    /// A charset label nothing here understands.
    Unknown(String),
}

/// One parsed header block.
struct FrameHeader {
    content_length: u64,
    /// Raw `charset=` label from `Content-Type`, if any.  Left unresolved so
    /// an unknown label can be reported after the payload is consumed and the
    /// stream is back at a frame boundary.
    charset: Option<String>,
}

/// Framing that precedes every message with zero or more `Name: Value\r\n`
/// lines terminated by `\r\n\r\n`.
///
/// `Content-Length` is required.  A `charset=` parameter on the optional
/// `Content-Type` header overrides the formatter's text encoding for that one
/// message.  Unknown headers are ignored.
pub struct HeaderDelimitedHandler<R, W> {
    formatter: Box<dyn MessageFormatter>,
    reader: Mutex<HeaderReadState<R>>,
    writer: Mutex<WriteState<W>>,
}

impl<R, W> HeaderDelimitedHandler<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(reader: R, writer: W, formatter: impl MessageFormatter) -> Self {
        Self {
            formatter: Box::new(formatter),
            reader: Mutex::new(HeaderReadState {
                io: reader,
                buf: BytesMut::with_capacity(4 * 1024),
            }),
            writer: Mutex::new(WriteState::new(writer)),
        }
    }

    async fn read_frame(
        state: &mut HeaderReadState<R>,
        formatter: &dyn MessageFormatter,
    ) -> Result<Option<Message>> {
        let terminator = loop {
            if let Some(pos) = find_terminator(&state.buf) {
                break pos;
            }
            if state.buf.len() > MAX_HEADER_BLOCK {
                return Err(RpcError::Framing {
                    reason: format!(
                        "no header terminator within {MAX_HEADER_BLOCK} bytes"
                    ),
                });
            }
            let n = state.io.read_buf(&mut state.buf).await?;
            if n == 0 {
                return if state.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(RpcError::UnexpectedEof)
                };
            }
        };

        let header = parse_header_block(&state.buf[..terminator])?;
        state.buf.advance(terminator + 4);

        let len = header.content_length;
        if len > MAX_FRAME_LEN {
            return Err(RpcError::OversizedFrame {
                len,
                max: MAX_FRAME_LEN,
            });
        }

        // An unknown charset is resolved only after the payload bytes are
        // consumed, so the stream stays at a frame boundary and the session
        // can answer with an error instead of tearing down.
        let encoding = match &header.charset {
            Some(label) => match TextEncoding::from_charset(label) {
                Some(encoding) => FrameEncoding::Known(encoding),
                None => FrameEncoding::Unknown(label.clone()),
            },
            None => FrameEncoding::Default,
        };

        if len >= LARGE_MESSAGE_THRESHOLD && !matches!(encoding, FrameEncoding::Unknown(_)) {
            if let Some(decoder) = formatter.async_decoder() {
                tracing::trace!(len, "decoding large frame via the streaming path");
                let encoding = match encoding {
                    FrameEncoding::Known(encoding) => Some(encoding),
                    _ => None,
                };
                // Bytes already buffered past the header block belong to the
                // payload; chain them ahead of the transport.
                let n = state.buf.len().min(len as usize);
                let buffered = state.buf.split_to(n).freeze();
                let remaining = len - buffered.len() as u64;
                let mut chained = tokio::io::AsyncReadExt::chain(
                    std::io::Cursor::new(buffered),
                    (&mut state.io).take(remaining),
                );
                return decoder.decode_stream(&mut chained, len, encoding).await.map(Some);
            }
        }

        while (state.buf.len() as u64) < len {
            let n = state.io.read_buf(&mut state.buf).await?;
            if n == 0 {
                return Err(RpcError::UnexpectedEof);
            }
        }
        let payload = state.buf.split_to(len as usize);

        match encoding {
            FrameEncoding::Unknown(label) => Err(RpcError::UnsupportedEncoding { encoding: label }),
            FrameEncoding::Known(encoding) => formatter.decode_text(&payload, encoding).map(Some),
            FrameEncoding::Default => formatter.decode(&payload).map(Some),
        }
    }
}

impl<S> HeaderDelimitedHandler<tokio::io::ReadHalf<S>, tokio::io::WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Split a duplex stream and frame messages over it.
    pub fn from_stream(stream: S, formatter: impl MessageFormatter) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, formatter)
    }
}

#[async_trait]
impl<R, W> MessageHandler for HeaderDelimitedHandler<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn read(&self, cancel: &CancellationToken) -> Result<Option<Message>> {
        let mut state = self.reader.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(RpcError::Cancelled),
            result = Self::read_frame(&mut state, self.formatter.as_ref()) => result,
        }
    }

    async fn write(&self, message: &Message) -> Result<()> {
        let mut state = self.writer.lock().await;
        let WriteState { io, buf } = &mut *state;

        buf.clear();
        self.formatter.encode(message, buf)?;

        let header = format!("Content-Length: {}\r\n\r\n", buf.len());
        io.write_all(header.as_bytes()).await?;
        io.write_all(buf).await?;
        io.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.writer.lock().await;
        state.io.shutdown().await?;
        Ok(())
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_header_block(block: &[u8]) -> Result<FrameHeader> {
    let text = std::str::from_utf8(block).map_err(|_| RpcError::Framing {
        reason: "header block is not valid UTF-8".to_string(),
    })?;

    let mut content_length = None;
    let mut charset = None;
    for line in text.split("\r\n").filter(|line| !line.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(RpcError::Framing {
                reason: format!("malformed header line '{line}'"),
            });
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            let parsed: u64 = value.parse().map_err(|_| RpcError::Framing {
                reason: format!("invalid Content-Length '{value}'"),
            })?;
            content_length = Some(parsed);
        } else if name.eq_ignore_ascii_case("content-type") {
            charset = parse_charset(value);
        }
        // Unknown headers are ignored.
    }

    let content_length = content_length.ok_or_else(|| RpcError::Framing {
        reason: "missing Content-Length header".to_string(),
    })?;

    Ok(FrameHeader {
        content_length,
        charset,
    })
}

fn parse_charset(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let param = param.trim();
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

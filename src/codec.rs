//! Newline-delimited JSON framing for the stdio channel.
//!
//! Inbound bytes arrive in arbitrary fragments; [`FrameDecoder`] buffers them
//! and yields one [`Envelope`] per complete `\n`-terminated line. Outbound,
//! [`FrameWriter`] turns each envelope into exactly one line and writes it
//! with a single `write_all` followed by a flush.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::{ErrorCode, RuntimeError};
use crate::message::SessionMessage;

/// Session id used by heartbeats, shutdown and the ready message.
pub const SYSTEM_SESSION_ID: &str = "__system__";

/// Lines longer than this are discarded without being parsed.
pub const DEFAULT_MAX_LINE_BYTES: usize = 128 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Request,
    Session,
    Heartbeat,
    Log,
    #[serde(rename = "__shutdown__")]
    Shutdown,
    /// Any event name this runtime does not know.
    #[serde(other)]
    Unknown,
}

/// Optional routing metadata the host may attach to an envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub session_id: String,
    pub event: Event,
    #[serde(default)]
    pub data: Value,
    #[serde(flatten)]
    pub meta: EnvelopeMeta,
}

impl Envelope {
    pub fn new(session_id: impl Into<String>, event: Event, data: Value) -> Self {
        Self {
            session_id: session_id.into(),
            event,
            data,
            meta: EnvelopeMeta::default(),
        }
    }

    /// Wrap a session message for `session_id`.
    pub fn session(session_id: impl Into<String>, message: &SessionMessage) -> Self {
        let data = serde_json::to_value(message).unwrap_or(Value::Null);
        Self::new(session_id, Event::Session, data)
    }

    pub fn heartbeat(data: Value) -> Self {
        Self::new(SYSTEM_SESSION_ID, Event::Heartbeat, data)
    }

    pub fn is_system(&self) -> bool {
        self.session_id == SYSTEM_SESSION_ID
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame exceeds {0} bytes")]
    LineTooLong(usize),
}

impl CodecError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidRequest
    }
}

/// Decode a single line (without its terminator). Blank lines yield `None`.
pub fn decode_line(line: &[u8]) -> Result<Option<Envelope>, CodecError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(line)?))
}

/// Encode an envelope as one `\n`-terminated line.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    Ok(line)
}

/// Incremental line decoder. Keeps the trailing partial line between feeds,
/// so a fragment may end anywhere, including inside a UTF-8 sequence.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_line: usize,
    discarding: bool,
    errors: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
            discarding: false,
            errors: 0,
        }
    }

    /// Number of lines dropped as malformed or oversized so far.
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Bytes currently held for an unterminated line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Envelope> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let head = &rest[..pos];
            rest = &rest[pos + 1..];

            if self.discarding {
                self.discarding = false;
                self.buf.clear();
                continue;
            }
            if self.buf.len() + head.len() > self.max_line {
                self.reject(CodecError::LineTooLong(self.max_line));
                self.buf.clear();
                continue;
            }
            self.buf.extend_from_slice(head);
            self.take_line(&mut out);
        }

        if !self.discarding && !rest.is_empty() {
            if self.buf.len() + rest.len() > self.max_line {
                self.reject(CodecError::LineTooLong(self.max_line));
                self.buf.clear();
                self.discarding = true;
            } else {
                self.buf.extend_from_slice(rest);
            }
        }
        out
    }

    /// Decode whatever unterminated line remains at end of input.
    pub fn finish(&mut self) -> Option<Envelope> {
        if self.discarding {
            self.discarding = false;
            self.buf.clear();
            return None;
        }
        let mut out = Vec::with_capacity(1);
        self.take_line(&mut out);
        out.pop()
    }

    fn take_line(&mut self, out: &mut Vec<Envelope>) {
        let decoded = decode_line(&self.buf);
        self.buf.clear();
        match decoded {
            Ok(Some(envelope)) => out.push(envelope),
            Ok(None) => {}
            Err(e) => self.reject(e),
        }
    }

    fn reject(&mut self, err: CodecError) {
        self.errors += 1;
        warn!(error = %err, "dropping inbound frame");
    }
}

/// Sole owner of the outbound stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), RuntimeError> {
        let line = encode_envelope(envelope)?;
        self.inner
            .write_all(line.as_bytes())
            .await
            .map_err(RuntimeError::Write)?;
        self.inner.flush().await.map_err(RuntimeError::Write)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

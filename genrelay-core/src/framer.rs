//! Line framing for upstream and relay byte streams.
//!
//! Network reads arrive as arbitrary byte windows. `LineFramer` keeps the
//! incomplete tail in a residual buffer and only decodes a line once its
//! terminating `\n` has been seen, so the produced lines do not depend on
//! where the reads were split. The tail is capped at a maximum line length.

use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreResult, GenRelayError};

/// How payload lines are marked inside a stream body.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LineFormat {
    /// One bare JSON document per line (NDJSON).
    #[default]
    #[serde(alias = "ndjson")]
    JsonLines,
    /// Server-Sent-Events: only `data:` lines carry a payload.
    #[serde(alias = "sse")]
    EventStream,
}

impl LineFormat {
    /// Extract the JSON payload of a complete line, if it carries one.
    pub fn payload<'a>(&self, line: &'a str) -> Option<&'a str> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let payload = match self {
            Self::JsonLines => line,
            // comments (`: keep-alive`), `event:`, `id:` and `retry:` carry nothing
            Self::EventStream => line.strip_prefix("data:")?.trim_start(),
        };
        if payload.is_empty() || payload == "[DONE]" {
            return None;
        }
        Some(payload)
    }
}

impl FromStr for LineFormat {
    type Err = GenRelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json_lines" | "jsonl" | "ndjson" => Ok(Self::JsonLines),
            "event_stream" | "sse" => Ok(Self::EventStream),
            other => Err(GenRelayError::Validation(format!(
                "line format must be ndjson or sse (got '{other}')"
            ))),
        }
    }
}

/// Largest line accepted by default. Anything longer without a newline ends
/// the stream with [`GenRelayError::LineTooLong`].
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Newline codec over a residual byte buffer.
///
/// Lines come back without the trailing `\n` / `\r\n`; the unterminated tail
/// stays in the caller's buffer until more bytes arrive.
#[derive(Debug, Clone)]
pub struct LineFramer {
    max_len: usize,
    // bytes of the buffer already scanned for a newline
    next_index: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::with_max_len(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len,
            next_index: 0,
        }
    }
}

impl Decoder for LineFramer {
    type Item = String;
    type Error = GenRelayError;

    fn decode(&mut self, src: &mut BytesMut) -> CoreResult<Option<String>> {
        let read_to = src.len().min(self.max_len.saturating_add(1));
        let start = self.next_index.min(read_to);
        match src[start..read_to].iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let end = start + pos;
                self.next_index = 0;
                let line = src.split_to(end + 1);
                Ok(Some(decode_line(&line[..end])))
            }
            None if src.len() > self.max_len => Err(GenRelayError::LineTooLong {
                limit: self.max_len,
            }),
            None => {
                self.next_index = read_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> CoreResult<Option<String>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        Ok(Some(decode_line(&rest)))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Adapts a byte stream into a stream of complete lines.
///
/// Transport errors are mapped with `on_error`; they and framing errors end
/// the stream.
pub struct FramedLines<S, F> {
    inner: S,
    framer: LineFramer,
    buf: BytesMut,
    on_error: F,
    finished: bool,
}

impl<S, F> FramedLines<S, F> {
    pub fn new(inner: S, framer: LineFramer, on_error: F) -> Self {
        Self {
            inner,
            framer,
            buf: BytesMut::new(),
            on_error,
            finished: false,
        }
    }
}

impl<S, E, F> Stream for FramedLines<S, F>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    F: FnMut(E) -> GenRelayError + Unpin,
{
    type Item = CoreResult<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            match this.framer.decode(&mut this.buf) {
                Ok(Some(line)) => return Poll::Ready(Some(Ok(line))),
                Ok(None) => {}
                Err(e) => {
                    this.finished = true;
                    this.buf.clear();
                    return Poll::Ready(Some(Err(e)));
                }
            }
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buf.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err((this.on_error)(e))));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(this.framer.decode_eof(&mut this.buf).transpose());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

enum Step<L> {
    Cancelled,
    Line(Option<L>),
}

/// Decode a byte stream into typed payloads.
///
/// Malformed lines are logged and skipped. A transport error is mapped with
/// `on_error` and ends the stream, as does a line longer than the framer allows. The token is checked on every read: once it
/// fires the byte stream is dropped, which closes the connection, and a single
/// `Cancelled` item is yielded.
pub fn decode_stream<S, E, T, F>(
    bytes: S,
    format: LineFormat,
    framer: LineFramer,
    cancel: CancellationToken,
    on_error: F,
) -> BoxStream<'static, CoreResult<T>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
    T: DeserializeOwned + Send + 'static,
    F: FnMut(E) -> GenRelayError + Send + Unpin + 'static,
{
    let stream = async_stream::stream! {
        let mut lines = FramedLines::new(Box::pin(bytes), framer, on_error);
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                next = lines.next() => Step::Line(next),
            };
            match step {
                Step::Cancelled => {
                    drop(lines);
                    yield Err(GenRelayError::Cancelled);
                    return;
                }
                Step::Line(None) => return,
                Step::Line(Some(Err(e))) => {
                    yield Err(e);
                    return;
                }
                Step::Line(Some(Ok(line))) => {
                    let Some(payload) = format.payload(&line) else {
                        continue;
                    };
                    match serde_json::from_str::<T>(payload) {
                        Ok(value) => yield Ok(value),
                        Err(e) => {
                            let err = GenRelayError::FrameParse(e.to_string());
                            tracing::warn!(error = %err, line_len = line.len(), "skipping malformed stream line");
                        }
                    }
                }
            }
        }
    };
    stream.boxed()
}

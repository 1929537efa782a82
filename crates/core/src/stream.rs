//! Chunked NDJSON event streams.
//!
//! Streaming REST endpoints emit newline-delimited JSON, one event per
//! line, with no alignment between HTTP chunks and lines: a chunk may end
//! mid-object and the next may carry several lines at once. [`EventStream`]
//! reassembles lines across chunk boundaries and decodes each into a
//! [`StreamEvent`]. A malformed line becomes a synthetic error event and the
//! stream keeps going; a whole-body (non-chunked) JSON response is decoded
//! in one pass and replayed as events.

use std::collections::VecDeque;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, TRANSFER_ENCODING};
use serde_json::Value;
use sprite_protocol::{ApiError, StreamEvent};
use tracing::debug;

use crate::error::{Error, Result};

/// How long to wait between chunks before giving up on a stream.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Caller-supplied decoder applied to each JSON object on the stream. The
/// default wraps [`StreamEvent::from_value`]; a custom parser can reject an
/// object with a reason, which surfaces as a synthetic error event.
pub type EventParser =
    Box<dyn FnMut(Value) -> std::result::Result<StreamEvent, String> + Send + 'static>;

pub(crate) fn default_parser() -> EventParser {
    Box::new(|value| Ok(StreamEvent::from_value(value)))
}

/// A stream of decoded events from one REST response.
pub struct EventStream {
    body: Body,
    parser: EventParser,
    idle_timeout: Duration,
    pending: VecDeque<StreamEvent>,
    buf: LineBuffer,
    done: bool,
}

enum Body {
    /// Live chunked response; lines are reassembled as chunks arrive.
    Chunked(reqwest::Response),
    /// Whole body already decoded into `pending`.
    Buffered,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("idle_timeout", &self.idle_timeout)
            .field("pending", &self.pending)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl EventStream {
    /// Wrap a response with default decoding and idle timeout.
    ///
    /// A non-2xx status consumes the body and fails with the decoded
    /// [`ApiError`] instead of producing a stream.
    pub async fn from_response(response: reqwest::Response) -> Result<EventStream> {
        Self::with_parser(response, DEFAULT_IDLE_TIMEOUT, default_parser()).await
    }

    /// Wrap a response with a custom per-event parser and idle timeout.
    pub async fn with_parser(
        response: reqwest::Response,
        idle_timeout: Duration,
        mut parser: EventParser,
    ) -> Result<EventStream> {
        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(ApiError::from_body(status.as_u16(), &body).into());
        }

        if is_streaming(&response) {
            return Ok(EventStream {
                body: Body::Chunked(response),
                parser,
                idle_timeout,
                pending: VecDeque::new(),
                buf: LineBuffer::default(),
                done: false,
            });
        }

        // Non-streaming response: decode the whole body up front.
        let bytes = response.bytes().await?;
        let pending = decode_buffered(&bytes, &mut parser);
        Ok(EventStream {
            body: Body::Buffered,
            parser,
            idle_timeout,
            pending,
            buf: LineBuffer::default(),
            done: false,
        })
    }

    /// Next event, or `None` at end of stream. An `Err` item (idle timeout
    /// or a dropped connection) is terminal.
    pub async fn next(&mut self) -> Option<Result<StreamEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.done {
                return None;
            }

            let Body::Chunked(response) = &mut self.body else {
                self.done = true;
                continue;
            };

            match tokio::time::timeout(self.idle_timeout, response.chunk()).await {
                Err(_) => {
                    self.done = true;
                    return Some(Err(Error::Timeout(self.idle_timeout)));
                }
                Ok(Err(e)) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                Ok(Ok(Some(chunk))) => {
                    for line in self.buf.push(&chunk) {
                        self.pending.push_back(parse_line(&line, &mut self.parser));
                    }
                }
                Ok(Ok(None)) => {
                    // Flush a final line without a trailing newline.
                    if let Some(line) = self.buf.finish() {
                        self.pending.push_back(parse_line(&line, &mut self.parser));
                    }
                    self.done = true;
                }
            }
        }
    }

    /// Drain the stream into a vec, failing on the first stream-level error.
    pub async fn collect(mut self) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event?);
        }
        Ok(events)
    }
}

/// Heuristic for whether a 2xx response should be read incrementally.
/// NDJSON and chunked responses stream. Anything else also streams unless
/// it is marked `application/json`: the service labels whole-body replies
/// with that content type, and only those are safe to buffer. An unknown
/// or missing content type is read incrementally so a mislabelled live
/// stream is never held in memory until the connection closes.
fn is_streaming(response: &reqwest::Response) -> bool {
    let headers = response.headers();
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.contains("ndjson") {
        return true;
    }
    let chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("chunked"));
    chunked || !content_type.contains("application/json")
}

fn parse_line(line: &str, parser: &mut EventParser) -> StreamEvent {
    match serde_json::from_str::<Value>(line) {
        Ok(value) => apply(parser, value),
        Err(e) => {
            debug!(target: "sprite.stream", error = %e, "unparseable line");
            StreamEvent::invalid_line(line, &e.to_string())
        }
    }
}

fn apply(parser: &mut EventParser, value: Value) -> StreamEvent {
    if !value.is_object() {
        return StreamEvent::from_value(value);
    }
    match parser(value.clone()) {
        Ok(event) => event,
        Err(reason) => StreamEvent::parser_failure(value, &reason),
    }
}

/// Decode a complete response body: a JSON array replays element by
/// element, a single object is one event, and anything else falls back to
/// line-by-line NDJSON decoding.
fn decode_buffered(body: &[u8], parser: &mut EventParser) -> VecDeque<StreamEvent> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Array(items)) => items.into_iter().map(|v| apply(parser, v)).collect(),
        Ok(value) => VecDeque::from([apply(parser, value)]),
        Err(_) => {
            let mut buf = LineBuffer::default();
            let mut events: VecDeque<StreamEvent> = buf
                .push(body)
                .iter()
                .map(|line| parse_line(line, parser))
                .collect();
            if let Some(line) = buf.finish() {
                events.push_back(parse_line(&line, parser));
            }
            events
        }
    }
}

/// Reassembles newline-terminated lines from arbitrarily-split byte chunks.
/// Blank lines are skipped; a trailing `\r` is stripped.
#[derive(Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Feed a chunk, returning every complete line it closed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        lines
    }

    /// Flush whatever is left as a final, unterminated line.
    pub fn finish(&mut self) -> Option<String> {
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&line).into_owned())
        }
    }
}

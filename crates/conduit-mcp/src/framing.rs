//! Newline-delimited framing and response demultiplexing.
//!
//! Bytes arrive in arbitrary chunks: a chunk may end mid-frame or carry
//! several frames. [`LineBuffer`] reassembles complete lines and
//! [`Demultiplexer`] routes each parsed message to the waiting caller through
//! the connection's [`CorrelationRegistry`].

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use conduit_types::{CorrelationRegistry, RpcError};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::jsonrpc::{JsonRpcMessage, RequestId};

/// Default cap on a single frame: 8 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Registry type used by line-framed connections.
pub type ResponseRegistry = CorrelationRegistry<RequestId, Value>;

/// Framing failures. None of them end the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Reassembles newline-terminated frames from a byte stream.
///
/// A frame longer than `max_frame_bytes` is discarded up to its terminating
/// newline and reported once as [`FrameError::TooLarge`].
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    /// Bytes at the front of `buf` already known to contain no newline.
    scanned: usize,
    max_frame_bytes: usize,
    discarding: bool,
}

impl LineBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_frame_bytes,
            discarding: false,
        }
    }

    /// Append a chunk and return every frame it completed, in order.
    ///
    /// Frames are returned without their `\n` (or `\r\n`) terminator. Blank
    /// lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Bytes, FrameError>> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        if self.discarding {
            match memchr_newline(rest) {
                Some(pos) => {
                    self.discarding = false;
                    rest = &rest[pos + 1..];
                }
                None => return frames,
            }
        }

        self.buf.extend_from_slice(rest);

        loop {
            match memchr_newline(&self.buf[self.scanned..]) {
                Some(offset) => {
                    let end = self.scanned + offset;
                    self.scanned = 0;
                    let mut line = self.buf.split_to(end + 1);
                    line.truncate(end);
                    if line.last() == Some(&b'\r') {
                        line.truncate(end - 1);
                    }
                    if line.len() > self.max_frame_bytes {
                        frames.push(Err(FrameError::TooLarge {
                            limit: self.max_frame_bytes,
                        }));
                        continue;
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    frames.push(Ok(line.freeze()));
                }
                None => {
                    if self.buf.len() > self.max_frame_bytes {
                        self.buf.clear();
                        self.scanned = 0;
                        self.discarding = true;
                        frames.push(Err(FrameError::TooLarge {
                            limit: self.max_frame_bytes,
                        }));
                    } else {
                        self.scanned = self.buf.len();
                    }
                    break;
                }
            }
        }

        frames
    }

    /// Bytes held for an incomplete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn memchr_newline(haystack: &[u8]) -> Option<usize> {
    haystack.iter().position(|b| *b == b'\n')
}

/// Outcome counters for one [`Demultiplexer::feed`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedReport {
    /// Result frames that completed a pending request.
    pub resolved: usize,
    /// Error frames that completed a pending request.
    pub rejected: usize,
    /// Responses whose id matched nothing pending; dropped.
    pub unmatched: usize,
    /// Peer-initiated requests and notifications handed to the inbound channel.
    pub forwarded: usize,
    pub parse_errors: usize,
    pub oversized: usize,
}

impl FeedReport {
    pub fn frames(&self) -> usize {
        self.resolved + self.rejected + self.unmatched + self.forwarded + self.parse_errors
    }
}

/// Turns a chunked byte stream into completed requests.
pub struct Demultiplexer {
    lines: LineBuffer,
    registry: Arc<ResponseRegistry>,
    inbound: Option<mpsc::UnboundedSender<JsonRpcMessage>>,
}

impl Demultiplexer {
    pub fn new(registry: Arc<ResponseRegistry>, max_frame_bytes: usize) -> Self {
        Self {
            lines: LineBuffer::new(max_frame_bytes),
            registry,
            inbound: None,
        }
    }

    /// Forward peer-initiated requests and notifications to `tx`.
    pub fn with_inbound(mut self, tx: mpsc::UnboundedSender<JsonRpcMessage>) -> Self {
        self.inbound = Some(tx);
        self
    }

    /// Consume one chunk of the stream.
    pub fn feed(&mut self, chunk: &[u8]) -> FeedReport {
        let mut report = FeedReport::default();
        for frame in self.lines.push(chunk) {
            match frame {
                Ok(line) => self.dispatch(&line, &mut report),
                Err(e) => {
                    tracing::warn!("Discarding MCP frame: {e}");
                    report.oversized += 1;
                }
            }
        }
        report
    }

    pub fn buffered(&self) -> usize {
        self.lines.buffered()
    }

    fn dispatch(&self, line: &[u8], report: &mut FeedReport) {
        let message = match JsonRpcMessage::from_slice(line) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Failed to parse MCP frame: {e}: {}", preview(line));
                report.parse_errors += 1;
                return;
            }
        };

        match message {
            JsonRpcMessage::Response(resp) => {
                if self.registry.resolve(&resp.id, resp.result) {
                    report.resolved += 1;
                } else {
                    report.unmatched += 1;
                }
            }
            JsonRpcMessage::Error(err) => match err.id {
                Some(id) => {
                    if self.registry.reject(&id, RpcError::from(err.error)) {
                        report.rejected += 1;
                    } else {
                        report.unmatched += 1;
                    }
                }
                None => {
                    tracing::warn!(
                        "Peer reported uncorrelated error (code {}): {}",
                        err.error.code,
                        err.error.message
                    );
                    report.unmatched += 1;
                }
            },
            other => {
                let method = other.method().unwrap_or_default().to_string();
                let delivered = match &self.inbound {
                    Some(tx) => tx.send(other).is_ok(),
                    None => false,
                };
                if delivered {
                    report.forwarded += 1;
                } else {
                    tracing::debug!("Ignoring peer-initiated '{method}'");
                }
            }
        }
    }
}

fn preview(line: &[u8]) -> String {
    const MAX: usize = 200;
    let shown = &line[..line.len().min(MAX)];
    let mut text = String::from_utf8_lossy(shown).into_owned();
    if line.len() > MAX {
        text.push('…');
    }
    text
}

//! A multiplexed JSON-RPC connection over any byte stream pair.
//!
//! Outbound frames go through a writer task fed by a channel; a reader task
//! pushes raw chunks into a [`Demultiplexer`], which completes the matching
//! caller in the shared [`ResponseRegistry`]. Many requests may be in flight
//! at once and responses may arrive in any order.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conduit_types::{RpcError, RpcTransport, lock_ignore_poison};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use crate::framing::{DEFAULT_MAX_FRAME_BYTES, Demultiplexer, ResponseRegistry};
use crate::jsonrpc::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, RequestId};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Tuning for a [`FramedConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long a request may wait for its response. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Largest accepted inbound frame, in bytes.
    pub max_frame_bytes: usize,
    /// Capacity of the outbound frame queue.
    pub write_queue: usize,
    /// Deliver peer-initiated requests and notifications via
    /// [`FramedConnection::take_inbound`]. When off they are dropped.
    pub forward_inbound: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            write_queue: 64,
            forward_inbound: false,
        }
    }
}

/// Client side of a newline-delimited JSON-RPC stream.
pub struct FramedConnection {
    next_id: AtomicI64,
    write_tx: mpsc::Sender<String>,
    registry: Arc<ResponseRegistry>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
    request_timeout: Option<Duration>,
    span: Span,
}

impl FramedConnection {
    /// Start the reader and writer tasks over `reader` and `writer`.
    ///
    /// Both tasks run inside `span`. When the reader sees end of stream, or
    /// either side fails, every pending request is rejected with
    /// [`RpcError::TransportClosed`].
    pub fn new<R, W>(reader: R, writer: W, options: ConnectionOptions, span: Span) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let registry = Arc::new(ResponseRegistry::new());

        // Writer task: drains channel and writes one frame per line
        let (write_tx, mut write_rx) = mpsc::channel::<String>(options.write_queue.max(1));
        let writer_registry = Arc::clone(&registry);
        let writer_handle = tokio::spawn(
            async move {
                let mut writer = writer;
                while let Some(frame) = write_rx.recv().await {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        tracing::warn!("Write to peer failed: {e}");
                        let failed = writer_registry.close(|| RpcError::TransportClosed);
                        if failed > 0 {
                            tracing::warn!("{failed} pending request(s) failed after write error");
                        }
                        break;
                    }
                }
            }
            .instrument(span.clone()),
        );

        // Reader task: feeds raw chunks to the demultiplexer until EOF
        let mut demux = Demultiplexer::new(Arc::clone(&registry), options.max_frame_bytes);
        let inbound_rx = if options.forward_inbound {
            let (tx, rx) = mpsc::unbounded_channel();
            demux = demux.with_inbound(tx);
            Some(rx)
        } else {
            None
        };
        let reader_registry = Arc::clone(&registry);
        let reader_handle = tokio::spawn(
            async move {
                let mut reader = reader;
                let mut chunk = vec![0u8; READ_CHUNK_BYTES];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) => {
                            tracing::debug!("Peer closed its output stream");
                            break;
                        }
                        Ok(n) => {
                            demux.feed(&chunk[..n]);
                        }
                        Err(e) => {
                            tracing::warn!("Read from peer failed: {e}");
                            break;
                        }
                    }
                }
                if demux.buffered() > 0 {
                    tracing::debug!("Discarding {} bytes of unterminated frame", demux.buffered());
                }
                let failed = reader_registry.close(|| RpcError::TransportClosed);
                if failed > 0 {
                    tracing::warn!("{failed} pending request(s) failed: transport closed");
                }
            }
            .instrument(span.clone()),
        );

        Self {
            next_id: AtomicI64::new(1),
            write_tx,
            registry,
            inbound_rx: Mutex::new(inbound_rx),
            reader_handle,
            writer_handle,
            request_timeout: options.request_timeout,
            span,
        }
    }

    /// Send a request under the next generated numeric id.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.request_with_id(id, method, params).await
    }

    /// Send a request under a caller-chosen id.
    ///
    /// Fails with [`RpcError::DuplicateRequestId`] before anything is written
    /// if `id` is still pending on this connection.
    pub async fn request_with_id(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        // serde_json escapes control characters, so a frame never spans lines.
        let frame = serde_json::to_string(&JsonRpcRequest::new(id.clone(), method, params))?;
        let handle = self.registry.register(id.clone())?;
        let guard = self.registry.guard(id.clone());

        if self.write_tx.send(frame).await.is_err() {
            return Err(RpcError::TransportClosed);
        }
        tracing::debug!(parent: &self.span, "→ {method} (id {id})");

        let result = self.registry.wait(&id, handle, self.request_timeout).await;
        guard.disarm();
        if let Err(RpcError::Timeout { timeout_ms }) = &result {
            tracing::warn!(parent: &self.span, "{method} (id {id}) timed out after {timeout_ms}ms");
        }
        result
    }

    /// Send a notification; nothing is registered and no reply is awaited.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        if self.registry.is_closed() {
            return Err(RpcError::TransportClosed);
        }
        let frame = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.write_tx
            .send(frame)
            .await
            .map_err(|_| RpcError::TransportClosed)
    }

    /// Reject everything pending and stop the background tasks.
    ///
    /// Returns how many requests were rejected.
    pub fn close(&self) -> usize {
        let failed = self.registry.close(|| RpcError::TransportClosed);
        self.reader_handle.abort();
        self.writer_handle.abort();
        failed
    }

    /// Peer-initiated requests and notifications, if forwarding was enabled.
    ///
    /// Returns `None` on every call after the first.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>> {
        lock_ignore_poison(&self.inbound_rx).take()
    }

    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_closed(&self) -> bool {
        self.registry.is_closed()
    }
}

impl Drop for FramedConnection {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

#[async_trait::async_trait]
impl RpcTransport for FramedConnection {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        FramedConnection::request(self, method, params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        FramedConnection::notify(self, method, params).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        FramedConnection::close(self);
        Ok(())
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &str) -> std::io::Result<()> {
    let mut line = Vec::with_capacity(frame.len() + 1);
    line.extend_from_slice(frame.as_bytes());
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

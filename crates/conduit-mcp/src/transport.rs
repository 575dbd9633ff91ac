//! Stdio transport for MCP server communication.
//!
//! Spawns a child process and speaks newline-delimited JSON-RPC over its
//! stdin/stdout. The child's stderr is logged at debug level.

use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use conduit_types::{RpcError, RpcTransport, lock_ignore_poison};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use crate::config::McpServerConfig;
use crate::connection::FramedConnection;

/// Lifecycle of a [`ChildProcessTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Closed,
}

/// A running child and the connection over its pipes.
struct Session {
    connection: FramedConnection,
    child: Mutex<Option<Child>>,
    stderr_handle: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stderr_handle.abort();
    }
}

enum State {
    Unconnected,
    Connected(Arc<Session>),
    Closed,
}

/// JSON-RPC transport to a tool server running as a subprocess.
///
/// Moves `Unconnected → Connected → Closed`; `Closed` is terminal. The child
/// is killed when the transport disconnects or is dropped.
pub struct ChildProcessTransport {
    name: String,
    config: McpServerConfig,
    state: Mutex<State>,
    span: Span,
}

impl ChildProcessTransport {
    pub fn new(name: impl Into<String>, config: McpServerConfig) -> Self {
        let name = name.into();
        let span = tracing::info_span!("mcp_server", server = %name);
        Self {
            name,
            config,
            state: Mutex::new(State::Unconnected),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.lock_state() {
            State::Unconnected => ConnectionState::Unconnected,
            State::Connected(_) => ConnectionState::Connected,
            State::Closed => ConnectionState::Closed,
        }
    }

    /// Spawn the server process and start its reader and writer.
    ///
    /// Already connected is a no-op. A transport that was disconnected cannot
    /// reconnect and fails with [`RpcError::TransportClosed`]. After the
    /// configured ready delay the child must still be running, otherwise this
    /// fails with [`RpcError::ProcessExited`].
    pub async fn connect(&self) -> Result<(), RpcError> {
        match &*lock_ignore_poison(&self.state) {
            State::Connected(_) => return Ok(()),
            State::Closed => return Err(RpcError::TransportClosed),
            State::Unconnected => {}
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| RpcError::SpawnFailed {
            command: self.config.command.clone(),
            source,
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(RpcError::Io(std::io::Error::other(
                "child process pipes were not captured",
            )));
        };

        let stderr_handle = tokio::spawn(log_stderr(stderr).instrument(self.span.clone()));
        let connection = FramedConnection::new(
            stdout,
            stdin,
            self.config.connection_options(),
            self.span.clone(),
        );

        let ready_delay = self.config.ready_delay();
        if !ready_delay.is_zero() {
            tokio::time::sleep(ready_delay).await;
        }
        if let Some(status) = child.try_wait()? {
            connection.close();
            stderr_handle.abort();
            return Err(RpcError::ProcessExited {
                name: self.name.clone(),
                status: status.to_string(),
            });
        }

        let session = Arc::new(Session {
            connection,
            child: Mutex::new(Some(child)),
            stderr_handle,
        });

        let mut state = lock_ignore_poison(&self.state);
        match *state {
            State::Unconnected => {
                tracing::info!(parent: &self.span, "Started '{}'", self.config.command);
                *state = State::Connected(session);
                Ok(())
            }
            // Lost a race with another connect or a disconnect; dropping the
            // session kills our child.
            State::Connected(_) => Ok(()),
            State::Closed => Err(RpcError::TransportClosed),
        }
    }

    /// Kill the child and reject every pending request with
    /// [`RpcError::TransportClosed`]. The transport cannot be reused.
    pub async fn disconnect(&self) -> Result<(), RpcError> {
        let previous = std::mem::replace(&mut *lock_ignore_poison(&self.state), State::Closed);
        let State::Connected(session) = previous else {
            return Ok(());
        };

        let failed = session.connection.close();
        if failed > 0 {
            tracing::warn!(parent: &self.span, "{failed} pending request(s) rejected on disconnect");
        }

        let child = lock_ignore_poison(&session.child).take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                tracing::debug!(parent: &self.span, "Kill failed: {e}");
            }
        }
        tracing::info!(parent: &self.span, "Disconnected");
        Ok(())
    }

    /// Invoke a tool via `tools/call` and return the raw result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        self.request(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// Send an arbitrary request to the server.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        self.session()?.connection.request(method, params).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.session()?.connection.notify(method, params).await
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        match &*self.lock_state() {
            State::Connected(session) => session.connection.pending_count(),
            _ => 0,
        }
    }

    fn session(&self) -> Result<Arc<Session>, RpcError> {
        match &*self.lock_state() {
            State::Connected(session) => Ok(Arc::clone(session)),
            _ => Err(RpcError::NotConnected),
        }
    }

    /// Lock the state, first moving to `Closed` if the child has closed its
    /// stdout or the writer has failed; nothing more can be sent then.
    fn lock_state(&self) -> MutexGuard<'_, State> {
        let mut state = lock_ignore_poison(&self.state);
        let lost = matches!(&*state, State::Connected(session) if session.connection.is_closed());
        if lost {
            tracing::debug!(parent: &self.span, "Connection lost, marking transport closed");
            *state = State::Closed;
        }
        state
    }
}

#[async_trait::async_trait]
impl RpcTransport for ChildProcessTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        ChildProcessTransport::request(self, method, params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        ChildProcessTransport::notify(self, method, params).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.disconnect().await
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!("stderr: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_before_connect_is_not_connected() {
        let transport = ChildProcessTransport::new("idle", McpServerConfig::new("cat"));
        assert_eq!(transport.state(), ConnectionState::Unconnected);
        assert!(matches!(
            transport.call_tool("echo", json!({})).await,
            Err(RpcError::NotConnected)
        ));
        assert_eq!(transport.pending_requests(), 0);
    }

    #[tokio::test]
    async fn spawn_failure_reports_command() {
        let transport = ChildProcessTransport::new(
            "missing",
            McpServerConfig::new("/nonexistent/binary/for-conduit-tests"),
        );
        match transport.connect().await {
            Err(RpcError::SpawnFailed { command, .. }) => {
                assert_eq!(command, "/nonexistent/binary/for-conduit-tests")
            }
            other => panic!("Expected SpawnFailed, got: {other:?}"),
        }
        assert_eq!(transport.state(), ConnectionState::Unconnected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connect_twice_is_a_no_op_and_closed_is_terminal() {
        let transport = ChildProcessTransport::new("cat", McpServerConfig::new("cat"));
        transport.connect().await.unwrap();
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);

        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Closed);
        assert!(matches!(
            transport.connect().await,
            Err(RpcError::TransportClosed)
        ));
        assert!(matches!(
            transport.request("ping", None).await,
            Err(RpcError::NotConnected)
        ));
        // Disconnecting again is harmless.
        transport.disconnect().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_that_exits_immediately_fails_connect() {
        let mut config = McpServerConfig::new("true");
        config.ready_delay_ms = 200;
        let transport = ChildProcessTransport::new("short-lived", config);
        match transport.connect().await {
            Err(RpcError::ProcessExited { name, .. }) => assert_eq!(name, "short-lived"),
            other => panic!("Expected ProcessExited, got: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn state_reports_closed_once_child_exits() {
        let config = McpServerConfig::new("sh").with_args(["-c", "sleep 0.2; exit 0"]);
        let transport = ChildProcessTransport::new("brief", config);
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);

        let mut state = transport.state();
        for _ in 0..200 {
            if state == ConnectionState::Closed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            state = transport.state();
        }
        assert_eq!(state, ConnectionState::Closed);
        assert_eq!(transport.pending_requests(), 0);
    }
}

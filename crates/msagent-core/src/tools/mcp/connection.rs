use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::McpError;
use super::protocol::{
    CallToolResult, Implementation, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, MCP_PROTOCOL_VERSION, METHOD_CALL_TOOL, METHOD_INITIALIZE,
    METHOD_INITIALIZED, METHOD_LIST_TOOLS, METHOD_LOG_MESSAGE, METHOD_NOT_FOUND, METHOD_PING, ServerMessage,
    call_tool_params, initialize_params, list_tools_params,
};
use crate::config::McpServerConfig;
use crate::tools::schema::ToolDescriptor;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, McpError>>>;

const MAX_TOOL_PAGES: usize = 64;

/// Lifecycle of a tool server connection.
///
/// `Closed` is terminal: a connection never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Starting,
    Ready,
    Degraded,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub init_timeout: Duration,
    pub shutdown_grace: Duration,
    pub client_info: Implementation,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
            client_info: Implementation {
                name: "msagent".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// State shared between a connection handle and its reader task.
struct RpcShared {
    server_name: String,
    writer: Mutex<Option<BoxedWriter>>,
    pending: StdMutex<PendingMap>,
    next_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

impl RpcShared {
    fn lock_pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Moves to `Closed`, returning `false` if already closed.
    fn close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        })
    }

    fn fail_pending(&self, make_error: impl Fn() -> McpError) {
        let drained: Vec<_> = self.lock_pending().drain().collect();
        for (id, sender) in drained {
            debug!(server = %self.server_name, id, "failing pending request");
            let _ = sender.send(Err(make_error()));
        }
    }

    async fn write_line(&self, message: &impl Serialize) -> Result<(), McpError> {
        let mut line = serde_json::to_string(message).map_err(|e| McpError::Protocol {
            server_name: self.server_name.clone(),
            message: format!("failed to encode message: {e}"),
        })?;
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(McpError::Closed {
                server_name: self.server_name.clone(),
            });
        };

        let io_error = |e: std::io::Error| McpError::Io {
            server_name: self.server_name.clone(),
            message: e.to_string(),
        };
        writer.write_all(line.as_bytes()).await.map_err(io_error)?;
        writer.flush().await.map_err(io_error)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.write_line(&JsonRpcNotification::new(method, params))
            .await
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        if self.current_state() == ConnectionState::Closed {
            return Err(McpError::Closed {
                server_name: self.server_name.clone(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);
        // Dropping this future (timeout or cancellation) releases the slot, so a
        // response arriving afterwards is treated as late and discarded.
        let _slot = PendingSlot { shared: self, id };

        debug!(server = %self.server_name, id, method, "sending request");
        self.write_line(&JsonRpcRequest::new(id, method, params))
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                if result.is_ok() {
                    self.transition(ConnectionState::Degraded, ConnectionState::Ready);
                }
                result
            }
            Ok(Err(_)) => Err(McpError::ConnectionLost {
                server_name: self.server_name.clone(),
            }),
            Err(_) => {
                if self.transition(ConnectionState::Ready, ConnectionState::Degraded) {
                    warn!(server = %self.server_name, method, "request timed out; connection degraded");
                }
                Err(McpError::Timeout {
                    server_name: self.server_name.clone(),
                    method: method.to_string(),
                })
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        let message = match ServerMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(server = %self.server_name, error = %e, "ignoring malformed line from server");
                return;
            }
        };

        match message {
            ServerMessage::Response(response) => self.deliver(response),
            ServerMessage::Notification(notification) => {
                if notification.method == METHOD_LOG_MESSAGE {
                    log_server_message(&self.server_name, notification.params.as_ref());
                } else {
                    debug!(server = %self.server_name, method = %notification.method, "server notification");
                }
            }
            ServerMessage::Request(request) => {
                let reply = if request.method == METHOD_PING {
                    JsonRpcResponse::success(request.id, Value::Object(serde_json::Map::new()))
                } else {
                    JsonRpcResponse::failure(
                        request.id,
                        METHOD_NOT_FOUND,
                        format!("method not supported by client: {}", request.method),
                    )
                };
                if let Err(e) = self.write_line(&reply).await {
                    warn!(server = %self.server_name, error = %e, "failed to answer server request");
                }
            }
        }
    }

    fn deliver(&self, response: JsonRpcResponse) {
        let Some(id) = response.request_id() else {
            warn!(server = %self.server_name, "discarding response without a usable id");
            return;
        };

        let Some(sender) = self.lock_pending().remove(&id) else {
            warn!(server = %self.server_name, id, "discarding late or unknown response");
            return;
        };

        let result = response.into_result().map_err(|err| McpError::Rpc {
            server_name: self.server_name.clone(),
            code: err.code,
            message: err.message,
            data: err.data,
        });
        if sender.send(result).is_err() {
            debug!(server = %self.server_name, id, "requester went away before response arrived");
        }
    }

    fn connection_lost(&self) {
        if self.close() {
            warn!(server = %self.server_name, "connection closed by server");
        }
        let server_name = self.server_name.clone();
        self.fail_pending(|| McpError::ConnectionLost {
            server_name: server_name.clone(),
        });
    }
}

/// Logs a `notifications/message` payload at the level the server asked for.
fn log_server_message(server_name: &str, params: Option<&Value>) {
    let level = params
        .and_then(|p| p.get("level"))
        .and_then(Value::as_str)
        .unwrap_or("info");
    let logger = params
        .and_then(|p| p.get("logger"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let data = params
        .and_then(|p| p.get("data"))
        .map(|data| match data {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();

    match level {
        "debug" => debug!(target: "mcp_server", server = server_name, logger, "{data}"),
        "info" | "notice" => info!(target: "mcp_server", server = server_name, logger, "{data}"),
        "warning" => warn!(target: "mcp_server", server = server_name, logger, "{data}"),
        _ => error!(target: "mcp_server", server = server_name, logger, "{data}"),
    }
}

struct PendingSlot<'a> {
    shared: &'a RpcShared,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.lock_pending().remove(&self.id);
    }
}

async fn read_loop<R>(shared: Arc<RpcShared>, reader: R)
where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(server = %shared.server_name, "server output reached EOF");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    shared.handle_line(trimmed).await;
                }
            }
            Err(e) => {
                warn!(server = %shared.server_name, error = %e, "failed to read from server");
                break;
            }
        }
    }
    shared.connection_lost();
}

/// One live connection to an MCP tool server speaking JSON-RPC over stdio.
///
/// Calls on a single connection are serialized in submission order. Calls on
/// different connections proceed independently.
pub struct ToolServerConnection {
    shared: Arc<RpcShared>,
    config: Option<McpServerConfig>,
    tools: Vec<ToolDescriptor>,
    server_info: Option<Implementation>,
    protocol_version: String,
    call_gate: Mutex<()>,
    child: Mutex<Option<Child>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    shutdown_grace: Duration,
}

impl std::fmt::Debug for ToolServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolServerConnection")
            .field("name", &self.shared.server_name)
            .field("state", &self.state())
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

impl ToolServerConnection {
    /// Spawns the configured server process and completes the MCP handshake.
    pub async fn start(
        config: &McpServerConfig,
        options: &ConnectionOptions,
    ) -> Result<Arc<Self>, McpError> {
        let server_name = config.name.clone();
        info!(server = %server_name, command = %config.command, "starting MCP server");

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| McpError::ConnectionFailed {
            server_name: server_name.clone(),
            message: format!("failed to spawn `{}`: {e}", config.command),
        })?;

        let missing_pipe = |pipe: &str| McpError::ConnectionFailed {
            server_name: server_name.clone(),
            message: format!("server process has no {pipe}"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let server_name_for_logging = server_name.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();

                while let Ok(len) = reader.read_line(&mut line).await {
                    if len == 0 {
                        break;
                    }
                    debug!(
                        target: "mcp_server",
                        "[{}] {}",
                        server_name_for_logging,
                        line.trim()
                    );
                    line.clear();
                }
            });
        }

        Self::establish(
            server_name,
            stdout,
            Box::new(stdin),
            Some(child),
            Some(config.clone()),
            options,
        )
        .await
    }

    /// Runs the handshake over an already-open transport.
    pub async fn connect<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        options: &ConnectionOptions,
    ) -> Result<Arc<Self>, McpError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(name.into(), reader, Box::new(writer), None, None, options).await
    }

    async fn establish<R>(
        server_name: String,
        reader: R,
        writer: BoxedWriter,
        child: Option<Child>,
        config: Option<McpServerConfig>,
        options: &ConnectionOptions,
    ) -> Result<Arc<Self>, McpError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (state, _) = watch::channel(ConnectionState::Starting);
        let shared = Arc::new(RpcShared {
            server_name,
            writer: Mutex::new(Some(writer)),
            pending: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state,
        });
        let reader_task = tokio::spawn(read_loop(Arc::clone(&shared), reader));

        let mut connection = Self {
            shared,
            config,
            tools: Vec::new(),
            server_info: None,
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            call_gate: Mutex::new(()),
            child: Mutex::new(child),
            reader_task: StdMutex::new(Some(reader_task)),
            shutdown_grace: options.shutdown_grace,
        };

        match connection.handshake(options).await {
            Ok(()) => {
                connection
                    .shared
                    .transition(ConnectionState::Starting, ConnectionState::Ready);
                info!(
                    server = %connection.name(),
                    tools = connection.tools.len(),
                    "MCP server ready"
                );
                Ok(Arc::new(connection))
            }
            Err(err) => {
                let err = connection.startup_failure(err, options.init_timeout).await;
                warn!(server = %connection.name(), error = %err, "MCP handshake failed");
                connection.stop().await;
                Err(err)
            }
        }
    }

    async fn handshake(&mut self, options: &ConnectionOptions) -> Result<(), McpError> {
        let response = self
            .shared
            .request(
                METHOD_INITIALIZE,
                Some(initialize_params(&options.client_info)),
                options.init_timeout,
            )
            .await?;
        let init: InitializeResult =
            serde_json::from_value(response).map_err(|e| self.protocol_error(format!(
                "malformed initialize response: {e}"
            )))?;

        if init.protocol_version != MCP_PROTOCOL_VERSION {
            debug!(
                server = %self.name(),
                requested = MCP_PROTOCOL_VERSION,
                negotiated = %init.protocol_version,
                "server negotiated a different protocol version"
            );
        }
        self.protocol_version = init.protocol_version;
        self.server_info = init.server_info;

        self.shared.notify(METHOD_INITIALIZED, None).await?;

        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let response = self
                .shared
                .request(
                    METHOD_LIST_TOOLS,
                    list_tools_params(cursor.as_deref()),
                    options.init_timeout,
                )
                .await?;
            let page: ListToolsResult = serde_json::from_value(response).map_err(|e| {
                self.protocol_error(format!("malformed tools/list response: {e}"))
            })?;

            self.tools
                .extend(page.tools.into_iter().map(|tool| ToolDescriptor {
                    description: tool.description.unwrap_or_default(),
                    name: tool.name,
                    input_schema: tool.input_schema,
                }));

            match page.next_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => return Ok(()),
            }
        }

        warn!(server = %self.name(), "tools/list pagination did not terminate; using tools received so far");
        Ok(())
    }

    fn protocol_error(&self, message: String) -> McpError {
        McpError::Protocol {
            server_name: self.name().to_string(),
            message,
        }
    }

    async fn startup_failure(&self, err: McpError, init_timeout: Duration) -> McpError {
        let server_name = self.name().to_string();
        match err {
            McpError::ConnectionLost { .. } | McpError::Io { .. } | McpError::Closed { .. } => {
                let message = match self.exit_status().await {
                    Some(status) => format!("server exited during initialization ({status})"),
                    None => "server closed its output during initialization".to_string(),
                };
                McpError::ConnectionFailed {
                    server_name,
                    message,
                }
            }
            McpError::Timeout { .. } => McpError::ConnectionFailed {
                server_name,
                message: format!("no initialize response within {init_timeout:?}"),
            },
            McpError::Rpc { code, message, .. } => McpError::Protocol {
                server_name,
                message: format!("initialization rejected with JSON-RPC error {code}: {message}"),
            },
            other => other,
        }
    }

    async fn exit_status(&self) -> Option<ExitStatus> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        tokio::time::timeout(Duration::from_millis(500), child.wait())
            .await
            .ok()?
            .ok()
    }

    pub fn name(&self) -> &str {
        &self.shared.server_name
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.current_state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.server_info.as_ref()
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// The process configuration this connection was started from, if any.
    pub fn config(&self) -> Option<&McpServerConfig> {
        self.config.as_ref()
    }

    /// Invokes a tool and returns its flattened text output.
    ///
    /// A result flagged `isError` by the server, or a JSON-RPC error answering
    /// the call, surfaces as [`McpError::ToolExecution`].
    pub async fn call(
        &self,
        tool_name: &str,
        arguments: &Value,
        timeout: Duration,
    ) -> Result<String, McpError> {
        let _turn = self.call_gate.lock().await;

        let response = self
            .shared
            .request(
                METHOD_CALL_TOOL,
                Some(call_tool_params(tool_name, arguments)),
                timeout,
            )
            .await
            .map_err(|err| match err {
                McpError::Rpc {
                    server_name,
                    code,
                    message,
                    ..
                } => McpError::ToolExecution {
                    server_name,
                    tool_name: tool_name.to_string(),
                    payload: format!("JSON-RPC error {code}: {message}"),
                },
                other => other,
            })?;

        let result: CallToolResult = match serde_json::from_value(response) {
            Ok(result) => result,
            Err(e) => {
                let err = self.protocol_error(format!("malformed tools/call response: {e}"));
                warn!(server = %self.name(), error = %err, "closing MCP server after protocol error");
                self.stop().await;
                return Err(err);
            }
        };

        if result.is_error {
            Err(McpError::ToolExecution {
                server_name: self.name().to_string(),
                tool_name: tool_name.to_string(),
                payload: result.text(),
            })
        } else {
            Ok(result.text())
        }
    }

    /// Closes the connection: stdin is closed, the process is given a grace
    /// period to exit and is killed afterwards. Safe to call more than once.
    pub async fn stop(&self) {
        if self.shared.close() {
            info!(server = %self.name(), "stopping MCP server");
        }

        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let server_name = self.name().to_string();
        self.shared.fail_pending(|| McpError::Closed {
            server_name: server_name.clone(),
        });

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => debug!(server = %self.name(), %status, "MCP server exited"),
                Ok(Err(e)) => warn!(server = %self.name(), error = %e, "failed to wait for MCP server"),
                Err(_) => {
                    warn!(server = %self.name(), "MCP server did not exit in time; killing");
                    if let Err(e) = child.kill().await {
                        warn!(server = %self.name(), error = %e, "failed to kill MCP server");
                    }
                }
            }
        }

        let reader_task = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = reader_task {
            task.abort();
        }
    }
}

impl Drop for ToolServerConnection {
    fn drop(&mut self) {
        let reader_task = self
            .reader_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = reader_task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeTool, FakeToolServer};
    use serde_json::json;

    fn quick_options() -> ConnectionOptions {
        ConnectionOptions {
            init_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(200),
            ..ConnectionOptions::default()
        }
    }

    #[tokio::test]
    async fn handshake_discovers_tools() {
        let server = FakeToolServer::new("files")
            .with_tool(FakeTool::reply("read_file", "contents"))
            .with_tool(FakeTool::reply("list_dir", "a\nb"));

        let connection = server.connect(&quick_options()).await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Ready);
        let names: Vec<_> = connection.tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["read_file", "list_dir"]);
        assert_eq!(connection.protocol_version(), MCP_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn call_returns_flattened_text() {
        let server = FakeToolServer::new("files").with_tool(FakeTool::reply("read_file", "hello"));
        let connection = server.connect(&quick_options()).await.unwrap();

        let output = connection
            .call("read_file", &json!({"path": "a.txt"}), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(output, "hello");
        assert_eq!(server.calls(), vec![("read_file".to_string(), json!({"path": "a.txt"}))]);
    }

    #[tokio::test]
    async fn is_error_result_is_a_tool_execution_error() {
        let server = FakeToolServer::new("files").with_tool(FakeTool::fail("read_file", "no such file"));
        let connection = server.connect(&quick_options()).await.unwrap();

        let err = connection
            .call("read_file", &json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(
            matches!(err, McpError::ToolExecution { ref payload, .. } if payload == "no such file")
        );
        assert_eq!(connection.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn timeout_degrades_connection_and_discards_late_response() {
        let server = FakeToolServer::new("slow")
            .with_tool(FakeTool::delayed("wait", Duration::from_millis(200), "late"))
            .with_tool(FakeTool::reply("echo", "fresh"));
        let connection = server.connect(&quick_options()).await.unwrap();

        let err = connection
            .call("wait", &json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert_eq!(connection.state(), ConnectionState::Degraded);

        // The late answer to `wait` arrives first and must not be mistaken for
        // the answer to `echo`.
        let output = connection
            .call("echo", &json!({}), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(output, "fresh");
        assert_eq!(connection.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn exit_mid_call_fails_pending_with_connection_lost() {
        let server = FakeToolServer::new("flaky").with_tool(FakeTool::exit("crash"));
        let connection = server.connect(&quick_options()).await.unwrap();
        let mut states = connection.subscribe_state();

        let err = connection
            .call("crash", &json!({}), Duration::from_secs(2))
            .await
            .unwrap_err();

        assert!(matches!(err, McpError::ConnectionLost { .. }));
        states
            .wait_for(|state| *state == ConnectionState::Closed)
            .await
            .unwrap();

        let err = connection
            .call("crash", &json!({}), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Closed { .. }));
    }

    #[tokio::test]
    async fn malformed_handshake_is_a_protocol_error() {
        let server = FakeToolServer::new("broken").with_malformed_handshake();

        let err = server.connect(&quick_options()).await.unwrap_err();

        assert!(matches!(err, McpError::Protocol { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn malformed_call_result_closes_the_connection() {
        let server = FakeToolServer::new("broken").with_tool(FakeTool::raw_result(
            "read_file",
            json!({ "content": "not-an-array" }),
        ));
        let connection = server.connect(&quick_options()).await.unwrap();
        let mut state = connection.subscribe_state();

        let err = connection
            .call("read_file", &json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, McpError::Protocol { .. }), "got {err:?}");
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(*state.borrow_and_update(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn stop_is_terminal_and_idempotent() {
        let server = FakeToolServer::new("files").with_tool(FakeTool::reply("read_file", "x"));
        let connection = server.connect(&quick_options()).await.unwrap();

        connection.stop().await;
        connection.stop().await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        let err = connection
            .call("read_file", &json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Closed { .. }));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::collections::HashMap;

        fn shell(name: &str, script: &str) -> McpServerConfig {
            McpServerConfig {
                name: name.to_string(),
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                env: HashMap::new(),
                enabled: true,
            }
        }

        #[tokio::test]
        async fn spawn_failure_is_a_connection_error() {
            let config = McpServerConfig {
                name: "missing".to_string(),
                command: "/definitely/not/a/real/binary".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                enabled: true,
            };

            let err = ToolServerConnection::start(&config, &quick_options())
                .await
                .unwrap_err();

            assert!(matches!(err, McpError::ConnectionFailed { .. }));
        }

        #[tokio::test]
        async fn immediate_exit_fails_the_handshake() {
            let err = ToolServerConnection::start(&shell("quitter", "exit 3"), &quick_options())
                .await
                .unwrap_err();

            match err {
                McpError::ConnectionFailed { message, .. } => {
                    assert!(message.contains("initialization"), "{message}");
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[tokio::test]
        async fn scripted_server_round_trip() {
            // Answers initialize (id 1), tools/list (id 2) and one tools/call (id 3).
            let script = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"sh","version":"0"}}}'
read line
read line
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"greet","inputSchema":{"type":"object"}}]}}'
read line
echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hi"}]}}'
read line
"#;
            let connection = ToolServerConnection::start(&shell("sh", script), &quick_options())
                .await
                .unwrap();

            assert_eq!(connection.tools().len(), 1);
            assert_eq!(connection.server_info().map(|i| i.name.as_str()), Some("sh"));

            let output = connection
                .call("greet", &json!({}), Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(output, "hi");

            connection.stop().await;
            assert_eq!(connection.state(), ConnectionState::Closed);
        }

        #[tokio::test]
        async fn process_exit_mid_call_is_connection_lost() {
            let script = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'
read line
read line
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"boom","inputSchema":{"type":"object"}}]}}'
read line
exit 1
"#;
            let connection = ToolServerConnection::start(&shell("sh", script), &quick_options())
                .await
                .unwrap();

            let err = connection
                .call("boom", &json!({}), Duration::from_secs(5))
                .await
                .unwrap_err();

            assert!(matches!(err, McpError::ConnectionLost { .. }), "got {err:?}");
        }
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, instrument, warn};

use super::error::{Result, ToolError};
use super::mcp::{ConnectionOptions, ConnectionState, ToolServerConnection};
use super::schema::{ToolCallRequest, ToolDescriptor};
use super::validation::{ArgumentValidator, normalize_arguments};
use crate::config::McpServerConfig;

const WARNING_CAPACITY: usize = 64;

/// Notices about registry changes that were not directly requested.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryWarning {
    DuplicateTool {
        tool_name: String,
        existing_server: String,
        rejected_server: String,
    },
    ServerClosed {
        server_name: String,
        tools: Vec<String>,
    },
}

impl std::fmt::Display for RegistryWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryWarning::DuplicateTool {
                tool_name,
                existing_server,
                rejected_server,
            } => write!(
                f,
                "server {rejected_server} was not registered: tool {tool_name} is already provided by {existing_server}"
            ),
            RegistryWarning::ServerClosed { server_name, tools } => write!(
                f,
                "server {server_name} closed; removed {} tool(s)",
                tools.len()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSummary {
    pub name: String,
    pub state: ConnectionState,
    pub tools: Vec<String>,
}

#[derive(Clone)]
struct RegisteredTool {
    connection: Arc<ToolServerConnection>,
    descriptor: ToolDescriptor,
    validator: Arc<ArgumentValidator>,
}

#[derive(Default)]
struct RegistryState {
    connections: Vec<Arc<ToolServerConnection>>,
    tools: HashMap<String, RegisteredTool>,
}

impl RegistryState {
    /// Removes `server_name` if it is still backed by `connection`.
    fn remove_connection(
        &mut self,
        server_name: &str,
        connection: Option<&Arc<ToolServerConnection>>,
    ) -> Option<(Arc<ToolServerConnection>, Vec<String>)> {
        let position = self.connections.iter().position(|existing| {
            existing.name() == server_name
                && connection.is_none_or(|expected| Arc::ptr_eq(existing, expected))
        })?;
        let removed = self.connections.remove(position);

        let mut tools: Vec<String> = self
            .tools
            .iter()
            .filter(|(_, tool)| Arc::ptr_eq(&tool.connection, &removed))
            .map(|(name, _)| name.clone())
            .collect();
        tools.sort();
        for name in &tools {
            self.tools.remove(name);
        }
        Some((removed, tools))
    }
}

/// Drops a closed connection's tools, announces it and stops the process.
/// Only the first caller for a given connection does anything.
async fn prune_closed(
    state: &RwLock<RegistryState>,
    warnings: &broadcast::Sender<RegistryWarning>,
    connection: &Arc<ToolServerConnection>,
) {
    let removed = state
        .write()
        .await
        .remove_connection(connection.name(), Some(connection));

    if let Some((_, tools)) = removed {
        let warning = RegistryWarning::ServerClosed {
            server_name: connection.name().to_string(),
            tools,
        };
        warn!("{warning}");
        let _ = warnings.send(warning);
        connection.stop().await;
    }
}

/// Maps tool names to the connection that provides them.
///
/// A tool name belongs to at most one connection. Registration of a server
/// whose tools collide with already-registered names is rejected as a whole,
/// so the first registrant keeps the name.
pub struct ToolRegistry {
    state: Arc<RwLock<RegistryState>>,
    warnings: broadcast::Sender<RegistryWarning>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        let (warnings, _) = broadcast::channel(WARNING_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            warnings,
        }
    }

    pub fn subscribe_warnings(&self) -> broadcast::Receiver<RegistryWarning> {
        self.warnings.subscribe()
    }

    fn warn(&self, warning: RegistryWarning) {
        warn!("{warning}");
        let _ = self.warnings.send(warning);
    }

    /// Adds every tool advertised by `connection`.
    pub async fn register(&self, connection: Arc<ToolServerConnection>) -> Result<()> {
        let mut state = self.state.write().await;

        if state
            .connections
            .iter()
            .any(|existing| existing.name() == connection.name())
        {
            return Err(ToolError::DuplicateServer(connection.name().to_string()));
        }

        let mut seen = HashSet::new();
        for descriptor in connection.tools() {
            if !seen.insert(descriptor.name.as_str()) {
                drop(state);
                self.warn(RegistryWarning::DuplicateTool {
                    tool_name: descriptor.name.clone(),
                    existing_server: connection.name().to_string(),
                    rejected_server: connection.name().to_string(),
                });
                return Err(ToolError::DuplicateTool {
                    tool_name: descriptor.name.clone(),
                    existing_server: connection.name().to_string(),
                    rejected_server: connection.name().to_string(),
                });
            }
            if let Some(existing) = state.tools.get(&descriptor.name) {
                let existing_server = existing.connection.name().to_string();
                drop(state);
                self.warn(RegistryWarning::DuplicateTool {
                    tool_name: descriptor.name.clone(),
                    existing_server: existing_server.clone(),
                    rejected_server: connection.name().to_string(),
                });
                return Err(ToolError::DuplicateTool {
                    tool_name: descriptor.name.clone(),
                    existing_server,
                    rejected_server: connection.name().to_string(),
                });
            }
        }

        for descriptor in connection.tools() {
            let validator = Arc::new(ArgumentValidator::new(
                &descriptor.name,
                &descriptor.input_schema,
            ));
            state.tools.insert(
                descriptor.name.clone(),
                RegisteredTool {
                    connection: Arc::clone(&connection),
                    descriptor: descriptor.clone(),
                    validator,
                },
            );
        }
        state.connections.push(Arc::clone(&connection));
        drop(state);

        info!(
            server = %connection.name(),
            tools = connection.tools().len(),
            "registered tool server"
        );
        self.watch_for_close(&connection);
        Ok(())
    }

    /// Prunes a connection's tools as soon as it reports `Closed`.
    fn watch_for_close(&self, connection: &Arc<ToolServerConnection>) {
        let mut states = connection.subscribe_state();
        let registry_state: Weak<RwLock<RegistryState>> = Arc::downgrade(&self.state);
        let watched: Weak<ToolServerConnection> = Arc::downgrade(connection);
        let warnings = self.warnings.clone();

        tokio::spawn(async move {
            loop {
                if *states.borrow_and_update() == ConnectionState::Closed {
                    break;
                }
                if states.changed().await.is_err() {
                    break;
                }
            }

            let (Some(registry_state), Some(connection)) = (registry_state.upgrade(), watched.upgrade())
            else {
                return;
            };
            prune_closed(&registry_state, &warnings, &connection).await;
        });
    }

    /// Starts a server from configuration and registers its tools.
    pub async fn connect(
        &self,
        config: &McpServerConfig,
        options: &ConnectionOptions,
    ) -> Result<Arc<ToolServerConnection>> {
        if self.connection(&config.name).await.is_some() {
            return Err(ToolError::DuplicateServer(config.name.clone()));
        }

        let connection = ToolServerConnection::start(config, options).await?;
        if let Err(err) = self.register(Arc::clone(&connection)).await {
            connection.stop().await;
            return Err(err);
        }
        Ok(connection)
    }

    /// Unregisters a server and stops its process.
    pub async fn remove(&self, server_name: &str) -> Result<()> {
        let removed = self
            .state
            .write()
            .await
            .remove_connection(server_name, None);

        match removed {
            Some((connection, tools)) => {
                info!(server = %server_name, tools = tools.len(), "removing tool server");
                connection.stop().await;
                Ok(())
            }
            None => Err(ToolError::UnknownServer(server_name.to_string())),
        }
    }

    /// Stops a process-backed server and starts it again from the same config.
    pub async fn restart(
        &self,
        server_name: &str,
        options: &ConnectionOptions,
    ) -> Result<Arc<ToolServerConnection>> {
        let connection = self
            .connection(server_name)
            .await
            .ok_or_else(|| ToolError::UnknownServer(server_name.to_string()))?;
        let config = connection
            .config()
            .cloned()
            .ok_or_else(|| ToolError::UnknownServer(server_name.to_string()))?;

        self.remove(server_name).await?;
        self.connect(&config, options).await
    }

    pub async fn connection(&self, server_name: &str) -> Option<Arc<ToolServerConnection>> {
        self.state
            .read()
            .await
            .connections
            .iter()
            .find(|c| c.name() == server_name)
            .cloned()
    }

    /// Returns the connection that owns `tool_name`.
    pub async fn resolve(&self, tool_name: &str) -> Result<Arc<ToolServerConnection>> {
        self.lookup(tool_name).await.map(|tool| tool.connection)
    }

    async fn lookup(&self, tool_name: &str) -> Result<RegisteredTool> {
        let tool = self
            .state
            .read()
            .await
            .tools
            .get(tool_name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;

        if tool.connection.state() == ConnectionState::Closed {
            let server_name = tool.connection.name().to_string();
            prune_closed(&self.state, &self.warnings, &tool.connection).await;
            return Err(ToolError::ConnectionClosed {
                tool_name: tool_name.to_string(),
                server_name,
            });
        }
        Ok(tool)
    }

    /// Validates and runs one tool call, returning the text for the model.
    #[instrument(skip_all, fields(tool = %call.tool_name, call_id = %call.id))]
    pub async fn dispatch(&self, call: &ToolCallRequest, timeout: Duration) -> Result<String> {
        let tool = self.lookup(&call.tool_name).await?;

        let arguments = validate_call(&tool, call)?;
        debug!(server = %tool.connection.name(), "dispatching tool call");

        tool.connection
            .call(&call.tool_name, &arguments, timeout)
            .await
            .map_err(|err| ToolError::from_call(&call.tool_name, err))
    }

    /// All registered tools, grouped by server in registration order.
    pub async fn descriptors(&self) -> Vec<ToolDescriptor> {
        let state = self.state.read().await;
        state
            .connections
            .iter()
            .flat_map(|connection| connection.tools().iter())
            .filter(|descriptor| state.tools.contains_key(&descriptor.name))
            .cloned()
            .collect()
    }

    pub async fn servers(&self) -> Vec<ServerSummary> {
        let state = self.state.read().await;
        state
            .connections
            .iter()
            .map(|connection| ServerSummary {
                name: connection.name().to_string(),
                state: connection.state(),
                tools: connection.tools().iter().map(|t| t.name.clone()).collect(),
            })
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.connections.is_empty()
    }

    /// Stops every registered server.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = {
            let mut state = self.state.write().await;
            state.tools.clear();
            std::mem::take(&mut state.connections)
        };
        futures::future::join_all(connections.iter().map(|c| c.stop())).await;
    }
}

fn validate_call(tool: &RegisteredTool, call: &ToolCallRequest) -> Result<Value> {
    let invalid = |message: String| ToolError::InvalidArguments {
        tool_name: call.tool_name.clone(),
        message,
    };

    let arguments = normalize_arguments(&call.arguments).map_err(invalid)?;
    tool.validator.validate(&arguments).map_err(invalid)?;
    debug!(tool = %tool.descriptor.name, "arguments validated");
    Ok(arguments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeTool, FakeToolServer};
    use serde_json::json;

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            init_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(200),
            ..ConnectionOptions::default()
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_owning_server() {
        let registry = ToolRegistry::new();
        let files = FakeToolServer::new("files").with_tool(FakeTool::reply("read_file", "from files"));
        let web = FakeToolServer::new("web").with_tool(FakeTool::reply("fetch", "from web"));
        registry.register(files.connect(&options()).await.unwrap()).await.unwrap();
        registry.register(web.connect(&options()).await.unwrap()).await.unwrap();

        let output = registry
            .dispatch(&ToolCallRequest::new("1", "fetch", json!({})), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(output, "from web");
        assert_eq!(registry.resolve("read_file").await.unwrap().name(), "files");
        assert!(files.calls().is_empty());
    }

    #[tokio::test]
    async fn duplicate_tool_rejects_second_server() {
        let registry = ToolRegistry::new();
        let mut warnings = registry.subscribe_warnings();
        let first = FakeToolServer::new("first").with_tool(FakeTool::reply("read_file", "first"));
        let second = FakeToolServer::new("second")
            .with_tool(FakeTool::reply("write_file", "second"))
            .with_tool(FakeTool::reply("read_file", "second"));

        registry.register(first.connect(&options()).await.unwrap()).await.unwrap();
        let err = registry
            .register(second.connect(&options()).await.unwrap())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ToolError::DuplicateTool { ref tool_name, ref existing_server, ref rejected_server }
                if tool_name == "read_file" && existing_server == "first" && rejected_server == "second"
        ));
        assert_eq!(registry.resolve("read_file").await.unwrap().name(), "first");
        assert!(matches!(
            registry.resolve("write_file").await,
            Err(ToolError::UnknownTool(_))
        ));
        assert!(matches!(
            warnings.recv().await.unwrap(),
            RegistryWarning::DuplicateTool { ref existing_server, .. } if existing_server == "first"
        ));
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let registry = ToolRegistry::new();
        let err = registry
            .dispatch(&ToolCallRequest::new("1", "nope", json!({})), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::UnknownTool("nope".to_string()));
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_the_server() {
        let registry = ToolRegistry::new();
        let server = FakeToolServer::new("files").with_tool(
            FakeTool::reply("read_file", "x").with_schema(json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            })),
        );
        registry.register(server.connect(&options()).await.unwrap()).await.unwrap();

        let missing = registry
            .dispatch(&ToolCallRequest::new("1", "read_file", json!({})), Duration::from_secs(1))
            .await
            .unwrap_err();
        let malformed = registry
            .dispatch(
                &ToolCallRequest::new("2", "read_file", json!("{\"path\": ")),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();

        assert_eq!(missing.kind(), "invalid_arguments");
        assert_eq!(malformed.kind(), "invalid_arguments");
        assert!(server.calls().is_empty());
    }

    #[tokio::test]
    async fn closed_connection_is_pruned() {
        let registry = ToolRegistry::new();
        let mut warnings = registry.subscribe_warnings();
        let server = FakeToolServer::new("flaky")
            .with_tool(FakeTool::exit("crash"))
            .with_tool(FakeTool::reply("ok", "fine"));
        registry.register(server.connect(&options()).await.unwrap()).await.unwrap();

        let err = registry
            .dispatch(&ToolCallRequest::new("1", "crash", json!({})), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "connection_lost");

        let warning = warnings.recv().await.unwrap();
        assert_eq!(
            warning,
            RegistryWarning::ServerClosed {
                server_name: "flaky".to_string(),
                tools: vec!["crash".to_string(), "ok".to_string()],
            }
        );
        assert!(matches!(
            registry
                .dispatch(&ToolCallRequest::new("2", "ok", json!({})), Duration::from_secs(1))
                .await,
            Err(ToolError::UnknownTool(_))
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn closure_seen_at_dispatch_is_announced_once() {
        let registry = ToolRegistry::new();
        let mut warnings = registry.subscribe_warnings();
        let server = FakeToolServer::new("gone").with_tool(FakeTool::reply("read_file", "x"));
        let connection = server.connect(&options()).await.unwrap();
        connection.stop().await;
        // The close watcher has not run yet, so dispatch sees `Closed` first.
        registry.register(Arc::clone(&connection)).await.unwrap();

        let err = registry
            .dispatch(&ToolCallRequest::new("1", "read_file", json!({})), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "connection_closed");

        let warning = tokio::time::timeout(Duration::from_secs(1), warnings.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            warning,
            RegistryWarning::ServerClosed {
                server_name: "gone".to_string(),
                tools: vec!["read_file".to_string()],
            }
        );
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(warnings.try_recv().is_err());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn server_listing_a_name_twice_is_rejected() {
        let registry = ToolRegistry::new();
        let server = FakeToolServer::new("twice")
            .with_tool(FakeTool::reply("read_file", "first"))
            .with_tool(FakeTool::reply("read_file", "second"));

        let err = registry
            .register(server.connect(&options()).await.unwrap())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ToolError::DuplicateTool { ref tool_name, ref existing_server, ref rejected_server }
                if tool_name == "read_file" && existing_server == "twice" && rejected_server == "twice"
        ));
        assert!(registry.descriptors().await.is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn remove_stops_server_and_forgets_tools() {
        let registry = ToolRegistry::new();
        let server = FakeToolServer::new("files").with_tool(FakeTool::reply("read_file", "x"));
        let connection = server.connect(&options()).await.unwrap();
        registry.register(Arc::clone(&connection)).await.unwrap();

        registry.remove("files").await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(registry.descriptors().await.is_empty());
        assert!(matches!(
            registry.remove("files").await,
            Err(ToolError::UnknownServer(_))
        ));
    }
}

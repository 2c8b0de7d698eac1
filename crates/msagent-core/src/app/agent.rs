use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{Provider, create_provider};
use crate::app::agent_loop::{AgentLoop, AgentLoopConfig, AgentLoopError, TurnEvent, TurnOutcome};
use crate::app::conversation::{ConversationState, Message};
use crate::app::prompts::system_prompt;
use crate::config::{AppConfig, McpServerConfig};
use crate::error::Result;
use crate::tools::{
    ConnectionOptions, RegistryWarning, ServerSummary, ToolDescriptor, ToolError, ToolRegistry,
};

/// A tool server that could not be started.
#[derive(Debug, Clone)]
pub struct ServerStartFailure {
    pub server_name: String,
    pub error: ToolError,
}

/// The entry point a user interface drives: one conversation plus the set of
/// running tool servers.
pub struct Agent {
    config: AppConfig,
    registry: Arc<ToolRegistry>,
    agent_loop: AgentLoop,
    connection_options: ConnectionOptions,
}

impl Agent {
    /// Builds the model client from `config.llm`.
    pub fn new(config: AppConfig) -> Result<Self> {
        let provider = create_provider(&config.llm)?;
        Ok(Self::with_provider(config, provider))
    }

    pub fn with_provider(config: AppConfig, provider: Arc<dyn Provider>) -> Self {
        let registry = Arc::new(ToolRegistry::new());
        let agent_loop = AgentLoop::new(
            provider,
            Arc::clone(&registry),
            AgentLoopConfig::from_settings(&config.llm, &config.agent),
        );
        Self {
            connection_options: config.agent.connection_options(),
            config,
            registry,
            agent_loop,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Starts every enabled server concurrently. Servers that fail to start
    /// are reported and skipped.
    pub async fn start_servers(&self) -> Vec<ServerStartFailure> {
        let servers: Vec<McpServerConfig> =
            self.config.enabled_mcp_servers().cloned().collect();
        let results = join_all(
            servers
                .iter()
                .map(|server| self.registry.connect(server, &self.connection_options)),
        )
        .await;

        servers
            .into_iter()
            .zip(results)
            .filter_map(|(server, result)| match result {
                Ok(_) => None,
                Err(error) => {
                    warn!(server = %server.name, error = %error, "failed to start MCP server");
                    Some(ServerStartFailure {
                        server_name: server.name,
                        error,
                    })
                }
            })
            .collect()
    }

    /// Starts a server and adds it to the running set.
    pub async fn add_server(&mut self, server: McpServerConfig) -> Result<()> {
        self.registry
            .connect(&server, &self.connection_options)
            .await?;
        info!(server = %server.name, "added MCP server");
        self.config.mcp_servers.retain(|s| s.name != server.name);
        self.config.mcp_servers.push(server);
        Ok(())
    }

    /// Stops a running server and forgets its configuration.
    pub async fn remove_server(&mut self, name: &str) -> Result<()> {
        self.registry.remove(name).await?;
        self.config.mcp_servers.retain(|s| s.name != name);
        Ok(())
    }

    pub async fn restart_server(&self, name: &str) -> Result<()> {
        self.registry
            .restart(name, &self.connection_options)
            .await?;
        Ok(())
    }

    pub async fn servers(&self) -> Vec<ServerSummary> {
        self.registry.servers().await
    }

    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.registry.descriptors().await
    }

    pub fn subscribe_warnings(&self) -> broadcast::Receiver<RegistryWarning> {
        self.registry.subscribe_warnings()
    }

    /// Runs one turn. The system prompt is rebuilt from the servers that
    /// are live right now.
    pub async fn run_turn(
        &mut self,
        text: impl Into<String>,
        events: &mpsc::Sender<TurnEvent>,
        token: CancellationToken,
    ) -> std::result::Result<TurnOutcome, AgentLoopError> {
        let servers = self.registry.servers().await;
        let prompt = system_prompt(&servers, self.config.agent.system_prompt.as_deref());
        self.agent_loop.set_system_prompt(Some(prompt));
        self.agent_loop.run_turn(text, events, token).await
    }

    pub fn history(&self) -> &[Message] {
        self.agent_loop.conversation().messages()
    }

    pub fn conversation(&self) -> &ConversationState {
        self.agent_loop.conversation()
    }

    pub fn clear_history(&mut self) {
        self.agent_loop.clear();
    }

    /// Stops every tool server.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

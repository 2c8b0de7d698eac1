use clap::{Parser, Subcommand};
use msagent_core::config::ProviderKind;
use std::path::PathBuf;

/// A terminal assistant that answers with the help of MCP tool servers.
#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file (defaults to ./config.json, then the user config directory)
    #[arg(long, global = true, env = "MSAGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Chat with the agent (interactive when no message is given)
    Chat {
        /// Send a single message and exit
        message: Option<String>,
        /// Print the answer once it is complete instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },
    /// Ask a single question
    Ask {
        question: String,
        /// Print the answer once it is complete instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },
    /// Show or change the model configuration
    Config {
        /// Print the current configuration
        #[arg(long)]
        show: bool,
        #[arg(long, value_enum, ignore_case = true)]
        llm_provider: Option<ProviderArg>,
        #[arg(long)]
        llm_api_key: Option<String>,
        #[arg(long)]
        llm_base_url: Option<String>,
        #[arg(long)]
        llm_model: Option<String>,
    },
    /// Manage MCP tool servers
    Mcp {
        #[command(subcommand)]
        action: McpCommands,
    },
    /// Show version and configuration details
    Info,
}

#[derive(Subcommand, Clone)]
pub enum McpCommands {
    /// Add or replace a server
    Add {
        #[arg(long)]
        name: String,
        /// Executable that speaks MCP over stdio
        #[arg(long)]
        command: String,
        /// Comma-separated arguments
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        args: Vec<String>,
        /// Environment variables as KEY=VALUE (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Keep the entry but do not start it
        #[arg(long)]
        disabled: bool,
    },
    /// Remove a server
    Remove {
        #[arg(long)]
        name: String,
    },
    /// List configured servers
    List {
        /// Start the enabled servers and list the tools they provide
        #[arg(long)]
        probe: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderArg {
    Openai,
    Anthropic,
    Gemini,
    Custom,
}

impl From<ProviderArg> for ProviderKind {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Openai => ProviderKind::OpenAI,
            ProviderArg::Anthropic => ProviderKind::Anthropic,
            ProviderArg::Gemini => ProviderKind::Gemini,
            ProviderArg::Custom => ProviderKind::Custom,
        }
    }
}

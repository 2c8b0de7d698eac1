use clap::Parser;
use eyre::Result;
use msagent::cli::{Cli, Commands};
use msagent::commands::{
    Command, ask::AskCommand, chat::ChatCommand, config::ConfigCommand, info::InfoCommand,
    mcp::McpCommand,
};
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    // Install color-eyre for better error reports
    color_eyre::install()?;

    let cli = Cli::parse();

    // Load .env file if it exists
    msagent::cli::config::load_env()?;

    // Initialize tracing (level configured via RUST_LOG env var)
    let log_file = msagent_core::utils::init_tracing()?;
    debug!(log_file = ?log_file, "msagent starting");

    let config_path = cli.config;
    match cli.command {
        Some(Commands::Chat { message, no_stream }) => {
            ChatCommand {
                config_path,
                message,
                stream: !no_stream,
            }
            .execute()
            .await
        }
        Some(Commands::Ask {
            question,
            no_stream,
        }) => {
            AskCommand {
                config_path,
                question,
                stream: !no_stream,
            }
            .execute()
            .await
        }
        Some(Commands::Config {
            show,
            llm_provider,
            llm_api_key,
            llm_base_url,
            llm_model,
        }) => {
            ConfigCommand {
                config_path,
                show,
                provider: llm_provider.map(Into::into),
                api_key: llm_api_key,
                base_url: llm_base_url,
                model: llm_model,
            }
            .execute()
            .await
        }
        Some(Commands::Mcp { action }) => McpCommand { config_path, action }.execute().await,
        Some(Commands::Info) => InfoCommand { config_path }.execute().await,
        None => {
            ChatCommand {
                config_path,
                message: None,
                stream: true,
            }
            .execute()
            .await
        }
    }
}

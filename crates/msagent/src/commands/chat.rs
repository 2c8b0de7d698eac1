use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use colored::Colorize;
use eyre::{Result, bail};
use msagent_core::app::{Agent, AgentLoopError, TurnOutcome};
use msagent_core::config::{AppConfig, ProviderKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Command, load_store};
use crate::render::print_events;

const EVENT_BUFFER: usize = 256;

const HELP: &str = "\
Commands:
  /help    Show this help
  /clear   Start a new conversation
  /tools   List the tools the running servers provide
  /exit    Leave the chat (also /quit, /q)";

pub struct ChatCommand {
    pub config_path: Option<PathBuf>,
    pub message: Option<String>,
    pub stream: bool,
}

#[async_trait]
impl Command for ChatCommand {
    async fn execute(&self) -> Result<()> {
        let config = load_store(self.config_path.as_deref())?.load()?;
        let mut agent = start_agent(config).await?;

        let result = match &self.message {
            Some(message) => run_turn(&mut agent, message, self.stream)
                .await
                .map(|_| ())
                .map_err(Into::into),
            None => self.repl(&mut agent).await,
        };

        agent.shutdown().await;
        result
    }
}

impl ChatCommand {
    async fn repl(&self, agent: &mut Agent) -> Result<()> {
        let mut stdout = std::io::stdout();
        writeln!(
            stdout,
            "{} Type /help for commands, /exit to leave.",
            "msagent".bold()
        )?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            write!(stdout, "{} ", ">".green().bold())?;
            stdout.flush()?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => {
                    writeln!(stdout)?;
                    None
                }
            };
            let Some(line) = line else {
                break;
            };
            let input = line.trim();
            if input.is_empty() {
                continue;
            }

            match input {
                "/exit" | "/quit" | "/q" => break,
                "/help" => writeln!(stdout, "{HELP}")?,
                "/clear" => {
                    agent.clear_history();
                    writeln!(stdout, "{}", "Conversation cleared.".dimmed())?;
                }
                "/tools" => print_tools(agent).await?,
                command if command.starts_with('/') => {
                    writeln!(stdout, "Unknown command {command}. Type /help for commands.")?;
                }
                message => {
                    if let Err(err) = run_turn(agent, message, self.stream).await {
                        writeln!(stdout, "{} {err}", "error:".red().bold())?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Builds the agent and starts the configured tool servers. Servers that fail
/// to start are reported and skipped.
pub async fn start_agent(config: AppConfig) -> Result<Agent> {
    if !config.llm.is_configured() && config.llm.provider != ProviderKind::Custom {
        bail!(
            "No API key configured for provider '{}'. Set it with `msagent config --llm-api-key <KEY>` or the matching environment variable.",
            config.llm.provider
        );
    }

    let agent = Agent::new(config)?;
    let failures = agent.start_servers().await;
    let mut stdout = std::io::stdout();
    for failure in &failures {
        writeln!(
            stdout,
            "{} server {} did not start: {}",
            "warning:".yellow(),
            failure.server_name,
            failure.error
        )?;
    }
    let started = agent.servers().await.len();
    info!(started, failed = failures.len(), "tool servers started");
    Ok(agent)
}

/// Runs one turn, printing its progress. Ctrl-C cancels the turn.
pub async fn run_turn(
    agent: &mut Agent,
    message: &str,
    stream: bool,
) -> std::result::Result<TurnOutcome, AgentLoopError> {
    let token = CancellationToken::new();
    let interrupt = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupt received, cancelling turn");
                token.cancel();
            }
        })
    };

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let printer = tokio::spawn(print_events(rx, stream));
    let result = agent.run_turn(message, &tx, token).await;
    drop(tx);
    let _ = printer.await;
    interrupt.abort();

    let mut stdout = std::io::stdout();
    match &result {
        Ok(outcome) if stream => {
            if !outcome.text.is_empty() {
                let _ = writeln!(stdout);
            }
        }
        Ok(outcome) => {
            let _ = writeln!(stdout, "{}", outcome.text);
        }
        Err(AgentLoopError::Cancelled) => {
            let _ = writeln!(stdout, "\n{}", "Cancelled.".dimmed());
        }
        Err(_) => {}
    }
    result
}

async fn print_tools(agent: &Agent) -> Result<()> {
    let mut stdout = std::io::stdout();
    let tools = agent.tools().await;
    if tools.is_empty() {
        writeln!(stdout, "No tools available.")?;
        return Ok(());
    }
    for tool in tools {
        writeln!(stdout, "  {} {}", tool.name.cyan(), tool.description.dimmed())?;
    }
    Ok(())
}

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use colored::Colorize;
use eyre::{Result, eyre};
use msagent_core::config::{AppConfig, McpServerConfig};
use msagent_core::tools::{ConnectionState, ToolRegistry};

use super::{Command, load_store};
use crate::cli::McpCommands;

/// Manages the configured MCP tool servers.
pub struct McpCommand {
    pub config_path: Option<PathBuf>,
    pub action: McpCommands,
}

#[async_trait]
impl Command for McpCommand {
    async fn execute(&self) -> Result<()> {
        let store = load_store(self.config_path.as_deref())?;
        let mut stdout = std::io::stdout();

        match &self.action {
            McpCommands::Add {
                name,
                command,
                args,
                env,
                disabled,
            } => {
                let server = McpServerConfig {
                    name: name.clone(),
                    command: command.clone(),
                    args: args.clone(),
                    env: parse_env(env)?,
                    enabled: !disabled,
                };
                store.add_mcp_server(server)?;
                writeln!(stdout, "{} server {name}", "Added".green())?;
            }
            McpCommands::Remove { name } => {
                if store.remove_mcp_server(name)? {
                    writeln!(stdout, "{} server {name}", "Removed".green())?;
                } else {
                    writeln!(stdout, "No server named {name} is configured.")?;
                }
            }
            McpCommands::List { probe } => {
                let config = store.load()?;
                if config.mcp_servers.is_empty() {
                    writeln!(stdout, "No MCP servers configured.")?;
                    return Ok(());
                }
                for server in &config.mcp_servers {
                    let status = if server.enabled {
                        "enabled".green()
                    } else {
                        "disabled".dimmed()
                    };
                    writeln!(
                        stdout,
                        "{} [{status}] {} {}",
                        server.name.bold(),
                        server.command,
                        server.args.join(" ")
                    )?;
                }
                if *probe {
                    probe_servers(&config).await?;
                }
            }
        }
        Ok(())
    }
}

/// Starts the enabled servers and prints what each one offers.
async fn probe_servers(config: &AppConfig) -> Result<()> {
    let mut stdout = std::io::stdout();
    writeln!(stdout)?;
    let registry = ToolRegistry::new();
    let options = config.agent.connection_options();
    for server in config.enabled_mcp_servers() {
        if let Err(err) = registry.connect(server, &options).await {
            writeln!(stdout, "{} {}: {err}", "✗".red(), server.name)?;
        }
    }
    for server in registry.servers().await {
        let marker = match server.state {
            ConnectionState::Ready => "✓".green(),
            ConnectionState::Starting | ConnectionState::Degraded => "!".yellow(),
            ConnectionState::Closed => "✗".red(),
        };
        writeln!(
            stdout,
            "{marker} {} ({}): {}",
            server.name,
            server.state,
            server.tools.join(", ")
        )?;
    }
    registry.shutdown().await;
    Ok(())
}

/// Parses repeated `KEY=VALUE` arguments.
fn parse_env(entries: &[String]) -> Result<HashMap<String, String>> {
    entries
        .iter()
        .map(|entry| {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| eyre!("Invalid environment entry '{entry}': expected KEY=VALUE"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(eyre!("Invalid environment entry '{entry}': empty key"));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use msagent_core::config::ConfigStore;
    use tempfile::TempDir;

    #[test]
    fn env_entries_split_on_first_equals() {
        let env = parse_env(&["TOKEN=a=b".to_string(), " DEBUG =1".to_string()]).unwrap();
        assert_eq!(env.get("TOKEN").map(String::as_str), Some("a=b"));
        assert_eq!(env.get("DEBUG").map(String::as_str), Some("1"));
    }

    #[test]
    fn malformed_env_entries_are_rejected() {
        assert!(parse_env(&["NOVALUE".to_string()]).is_err());
        assert!(parse_env(&["=value".to_string()]).is_err());
    }

    #[tokio::test]
    async fn add_then_remove_round_trips_through_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let add = McpCommand {
            config_path: Some(path.clone()),
            action: McpCommands::Add {
                name: "files".to_string(),
                command: "mcp-files".to_string(),
                args: vec!["--root".to_string(), "/tmp".to_string()],
                env: vec!["TOKEN=abc".to_string()],
                disabled: true,
            },
        };
        add.execute().await.unwrap();

        let store = ConfigStore::new(&path);
        let config = store.load_with_env(|_| None).unwrap();
        assert_eq!(config.mcp_servers.len(), 1);
        assert!(!config.mcp_servers[0].enabled);
        assert_eq!(config.mcp_servers[0].env.get("TOKEN").map(String::as_str), Some("abc"));

        let remove = McpCommand {
            config_path: Some(path),
            action: McpCommands::Remove {
                name: "files".to_string(),
            },
        };
        remove.execute().await.unwrap();
        assert!(store.load_with_env(|_| None).unwrap().mcp_servers.is_empty());
    }
}

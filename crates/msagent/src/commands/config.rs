use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use colored::Colorize;
use eyre::Result;
use msagent_core::config::{AppConfig, LlmConfig, ProviderKind};

use super::{Command, load_store};

/// Shows the configuration or updates the model settings.
pub struct ConfigCommand {
    pub config_path: Option<PathBuf>,
    pub show: bool,
    pub provider: Option<ProviderKind>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

#[async_trait]
impl Command for ConfigCommand {
    async fn execute(&self) -> Result<()> {
        let store = load_store(self.config_path.as_deref())?;
        let mut stdout = std::io::stdout();

        if self.has_updates() {
            let mut config = store.load()?;
            self.apply(&mut config.llm);
            store.save(&config)?;
            writeln!(
                stdout,
                "{} {}",
                "Saved configuration to".green(),
                store.path().display()
            )?;
        }

        if self.show || !self.has_updates() {
            let config = store.load()?;
            writeln!(stdout, "Configuration file: {}", store.path().display())?;
            writeln!(stdout, "{}", render(&config))?;
        }
        Ok(())
    }
}

impl ConfigCommand {
    fn has_updates(&self) -> bool {
        self.provider.is_some()
            || self.api_key.is_some()
            || self.base_url.is_some()
            || self.model.is_some()
    }

    fn apply(&self, llm: &mut LlmConfig) {
        if let Some(provider) = self.provider {
            llm.provider = provider;
        }
        if let Some(api_key) = &self.api_key {
            llm.api_key.clone_from(api_key);
        }
        if let Some(base_url) = &self.base_url {
            llm.base_url.clone_from(base_url);
        }
        if let Some(model) = &self.model {
            llm.model.clone_from(model);
        }
    }
}

/// Keeps the first and last four characters of a key.
fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.is_empty() {
        return "(not set)".to_string();
    }
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

fn render(config: &AppConfig) -> String {
    let mut lines = vec![
        format!("  provider:    {}", config.llm.provider),
        format!("  model:       {}", config.llm.model),
        format!("  api key:     {}", mask_api_key(&config.llm.api_key)),
        format!(
            "  base url:    {}",
            config.llm.base_url().unwrap_or("(provider default)")
        ),
        format!("  temperature: {}", config.llm.temperature),
        format!("  max tokens:  {}", config.llm.max_tokens),
        format!("  mcp servers: {}", config.mcp_servers.len()),
    ];
    for server in &config.mcp_servers {
        let status = if server.enabled { "" } else { " (disabled)" };
        lines.push(format!("    - {}: {}{status}", server.name, server.command));
    }
    lines.join("\n")
}

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use colored::Colorize;
use eyre::Result;
use msagent_core::utils::log_dir;

use super::{Command, load_store};

pub struct InfoCommand {
    pub config_path: Option<PathBuf>,
}

#[async_trait]
impl Command for InfoCommand {
    async fn execute(&self) -> Result<()> {
        let store = load_store(self.config_path.as_deref())?;
        let config = store.load()?;
        let enabled = config.enabled_mcp_servers().count();

        let mut stdout = std::io::stdout();
        writeln!(stdout, "{} {}", "msagent".bold(), env!("CARGO_PKG_VERSION"))?;
        writeln!(stdout, "config file: {}", store.path().display())?;
        writeln!(stdout, "provider:    {}", config.llm.provider)?;
        writeln!(stdout, "model:       {}", config.llm.model)?;
        writeln!(
            stdout,
            "mcp servers: {} configured, {enabled} enabled",
            config.mcp_servers.len()
        )?;
        match log_dir() {
            Some(dir) => writeln!(stdout, "logs:        {}", dir.display())?,
            None => writeln!(stdout, "logs:        stderr")?,
        }
        Ok(())
    }
}

use std::path::PathBuf;

use async_trait::async_trait;
use eyre::Result;

use super::chat::{run_turn, start_agent};
use super::{Command, load_store};

/// Answers one question and exits.
pub struct AskCommand {
    pub config_path: Option<PathBuf>,
    pub question: String,
    pub stream: bool,
}

#[async_trait]
impl Command for AskCommand {
    async fn execute(&self) -> Result<()> {
        let config = load_store(self.config_path.as_deref())?.load()?;
        let mut agent = start_agent(config).await?;
        let result = run_turn(&mut agent, &self.question, self.stream).await;
        agent.shutdown().await;
        result?;
        Ok(())
    }
}

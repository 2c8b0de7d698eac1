use std::path::Path;

use async_trait::async_trait;
use eyre::Result;
use msagent_core::config::ConfigStore;

pub mod ask;
pub mod chat;
pub mod config;
pub mod info;
pub mod mcp;

#[async_trait]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

/// The store named on the command line, or the discovered default.
pub fn load_store(path: Option<&Path>) -> Result<ConfigStore> {
    match path {
        Some(path) => Ok(ConfigStore::new(path)),
        None => Ok(ConfigStore::discover()?),
    }
}

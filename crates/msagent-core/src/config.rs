use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::tools::ConnectionOptions;

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProviderKind {
    #[default]
    OpenAI,
    Anthropic,
    Gemini,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAI,
            api_key: String::new(),
            base_url: String::new(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

impl LlmConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    pub fn base_url(&self) -> Option<&str> {
        let trimmed = self.base_url.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

fn default_enabled() -> bool {
    true
}

/// How to launch one MCP tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl McpServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_iterations: usize,
    pub tool_timeout_secs: u64,
    pub stream_open_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub init_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tool_timeout_secs: 60,
            stream_open_timeout_secs: 60,
            stream_idle_timeout_secs: 120,
            init_timeout_secs: 30,
            system_prompt: None,
        }
    }
}

impl AgentSettings {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn stream_open_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_open_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            init_timeout: Duration::from_secs(self.init_timeout_secs),
            ..ConnectionOptions::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub mcp_servers: Vec<McpServerConfig>,
    pub agent: AgentSettings,
}

impl AppConfig {
    pub fn enabled_mcp_servers(&self) -> impl Iterator<Item = &McpServerConfig> {
        self.mcp_servers.iter().filter(|server| server.enabled)
    }

    /// Fills the LLM section from provider environment variables.
    ///
    /// `OPENAI_*`, `ANTHROPIC_*` and `GEMINI_*` are tried in that order;
    /// `CUSTOM_*` wins over all of them.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let presets = [
            (ProviderKind::OpenAI, "OPENAI", "gpt-4o-mini"),
            (ProviderKind::Anthropic, "ANTHROPIC", "claude-3-5-sonnet-20241022"),
            (ProviderKind::Gemini, "GEMINI", "gemini-pro"),
        ];
        for (provider, prefix, default_model) in presets {
            if let Some(api_key) = get(&format!("{prefix}_API_KEY")) {
                self.llm.provider = provider;
                self.llm.api_key = api_key;
                self.llm.model =
                    get(&format!("{prefix}_MODEL")).unwrap_or_else(|| default_model.to_string());
                break;
            }
        }

        if let Some(api_key) = get("CUSTOM_API_KEY") {
            self.llm.provider = ProviderKind::Custom;
            self.llm.api_key = api_key;
            self.llm.base_url = get("CUSTOM_BASE_URL").unwrap_or_default();
            self.llm.model = get("CUSTOM_MODEL").unwrap_or_default();
        }
    }
}

/// Reads and writes the JSON configuration file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Uses `./config.json` when present, otherwise the per-user config file.
    pub fn discover() -> Result<Self> {
        let local = std::env::current_dir()?.join(CONFIG_FILE_NAME);
        if local.is_file() {
            debug!(path = %local.display(), "using local config file");
            return Ok(Self::new(local));
        }
        Ok(Self::new(default_config_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the file; without one, returns defaults with environment
    /// overrides applied.
    pub fn load(&self) -> Result<AppConfig> {
        self.load_with_env(|key| std::env::var(key).ok())
    }

    pub fn load_with_env(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<AppConfig> {
        if !self.path.exists() {
            let mut config = AppConfig::default();
            config.apply_env_overrides(lookup);
            return Ok(config);
        }

        let contents = fs::read_to_string(&self.path).map_err(|e| {
            Error::Configuration(format!(
                "Failed to read config file {}: {e}",
                self.path.display()
            ))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            Error::Configuration(format!(
                "Failed to parse config file {}: {e}",
                self.path.display()
            ))
        })
    }

    pub fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Configuration(format!("Failed to create config directory: {e}"))
            })?;
        }
        let contents = serde_json::to_string_pretty(config)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {e}")))?;
        fs::write(&self.path, contents).map_err(|e| {
            Error::Configuration(format!(
                "Failed to write config file {}: {e}",
                self.path.display()
            ))
        })
    }

    /// Adds a server, replacing any existing entry with the same name.
    pub fn add_mcp_server(&self, server: McpServerConfig) -> Result<AppConfig> {
        let mut config = self.load()?;
        config.mcp_servers.retain(|existing| existing.name != server.name);
        config.mcp_servers.push(server);
        self.save(&config)?;
        Ok(config)
    }

    /// Removes a server by name; returns whether one was removed.
    pub fn remove_mcp_server(&self, name: &str) -> Result<bool> {
        let mut config = self.load()?;
        let before = config.mcp_servers.len();
        config.mcp_servers.retain(|existing| existing.name != name);
        if config.mcp_servers.len() == before {
            warn!(server = name, "no configured MCP server with that name");
            return Ok(false);
        }
        self.save(&config)?;
        Ok(true)
    }

    pub fn update_llm(&self, llm: LlmConfig) -> Result<AppConfig> {
        let mut config = self.load()?;
        config.llm = llm;
        self.save(&config)?;
        Ok(config)
    }
}

/// `<config dir>/msagent/config.json`
pub fn default_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::Configuration("Could not find config directory".to_string()))?;
    Ok(config_dir.join("msagent").join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tempfile::TempDir;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.llm.provider, ProviderKind::OpenAI);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert!((config.llm.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.llm.max_tokens, 4096);
        assert!(!config.llm.is_configured());
        assert_eq!(config.agent.max_iterations, 10);
        assert!(config.mcp_servers.is_empty());
    }

    #[test]
    fn missing_file_uses_env_overrides() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));

        let config = store
            .load_with_env(env(&[("ANTHROPIC_API_KEY", "sk-ant"), ("GEMINI_API_KEY", "g")]))
            .unwrap();

        assert_eq!(config.llm.provider, ProviderKind::Anthropic);
        assert_eq!(config.llm.api_key, "sk-ant");
        assert_eq!(config.llm.model, "claude-3-5-sonnet-20241022");
    }

    #[test]
    fn custom_provider_wins_over_presets() {
        let mut config = AppConfig::default();
        config.apply_env_overrides(env(&[
            ("OPENAI_API_KEY", "sk-openai"),
            ("CUSTOM_API_KEY", "sk-custom"),
            ("CUSTOM_BASE_URL", "http://localhost:8000/v1"),
            ("CUSTOM_MODEL", "local-model"),
        ]));

        assert_eq!(config.llm.provider, ProviderKind::Custom);
        assert_eq!(config.llm.api_key, "sk-custom");
        assert_eq!(config.llm.base_url(), Some("http://localhost:8000/v1"));
        assert_eq!(config.llm.model, "local-model");
    }

    #[test]
    fn existing_file_ignores_env() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let mut saved = AppConfig::default();
        saved.llm.api_key = "from-file".to_string();
        store.save(&saved).unwrap();

        let loaded = store
            .load_with_env(env(&[("OPENAI_API_KEY", "from-env")]))
            .unwrap();

        assert_eq!(loaded, saved);
    }

    #[test]
    fn add_and_remove_servers() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("nested").join("config.json"));
        store.save(&AppConfig::default()).unwrap();

        let mut files = McpServerConfig::new("files", "mcp-files");
        store.add_mcp_server(files.clone()).unwrap();
        files.args = vec!["--root".to_string(), "/tmp".to_string()];
        let config = store.add_mcp_server(files.clone()).unwrap();

        assert_eq!(config.mcp_servers, vec![files]);
        assert!(store.remove_mcp_server("files").unwrap());
        assert!(!store.remove_mcp_server("files").unwrap());
        assert!(store.load().unwrap().mcp_servers.is_empty());
    }

    #[test]
    fn server_config_defaults_when_fields_missing() {
        let server: McpServerConfig =
            serde_json::from_str(r#"{"name": "x", "command": "run-x"}"#).unwrap();
        assert!(server.enabled);
        assert!(server.args.is_empty());

        let mut config = AppConfig::default();
        config.mcp_servers = vec![
            server,
            McpServerConfig {
                enabled: false,
                ..McpServerConfig::new("off", "run-off")
            },
        ];
        let names: Vec<_> = config.enabled_mcp_servers().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["x"]);
    }

    #[test]
    fn malformed_file_is_a_configuration_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let err = ConfigStore::new(path).load().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn provider_kind_parses_case_insensitively() {
        assert_eq!(ProviderKind::from_str("Anthropic").unwrap(), ProviderKind::Anthropic);
        assert_eq!(ProviderKind::Custom.to_string(), "custom");
        assert!(ProviderKind::from_str("bedrock").is_err());
    }
}

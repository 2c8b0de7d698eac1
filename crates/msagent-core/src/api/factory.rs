use std::sync::Arc;

use crate::api::anthropic::AnthropicClient;
use crate::api::error::ApiError;
use crate::api::gemini::GeminiClient;
use crate::api::openai::OpenAIClient;
use crate::api::provider::Provider;
use crate::config::{LlmConfig, ProviderKind};

/// Builds the streaming client for the configured provider.
///
/// Hosted providers require an API key; `custom` endpoints (local
/// OpenAI-compatible servers) may run without one but need a base URL.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn Provider>, ApiError> {
    let api_key = config.api_key.trim();
    let require_key = || {
        if api_key.is_empty() {
            Err(ApiError::Configuration(format!(
                "No API key configured for provider '{}'",
                config.provider
            )))
        } else {
            Ok(api_key.to_string())
        }
    };

    match config.provider {
        ProviderKind::OpenAI => Ok(Arc::new(OpenAIClient::new(
            "openai",
            Some(require_key()?),
            config.base_url(),
        )?)),
        ProviderKind::Custom => {
            let base_url = config.base_url().ok_or_else(|| {
                ApiError::Configuration("Custom provider requires a base URL".to_string())
            })?;
            Ok(Arc::new(OpenAIClient::new(
                "custom",
                Some(api_key.to_string()),
                Some(base_url),
            )?))
        }
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicClient::new(
            require_key()?,
            config.base_url(),
        )?)),
        ProviderKind::Gemini => Ok(Arc::new(GeminiClient::new(
            require_key()?,
            config.base_url(),
        )?)),
    }
}

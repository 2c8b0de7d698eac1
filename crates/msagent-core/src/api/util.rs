use std::time::Duration;

use crate::api::error::ApiError;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Ensures a chat completions URL ends with `/chat/completions`, adding `/v1`
/// when the base carries no version segment.
pub fn normalize_chat_url(base_url: Option<&str>, default_url: &str) -> String {
    let base_url = base_url.unwrap_or(default_url).trim().to_string();

    if base_url.ends_with("/chat/completions") {
        return base_url;
    }

    if let Ok(mut parsed) = url::Url::parse(&base_url) {
        let path = parsed.path().trim_end_matches('/').to_string();
        if path.ends_with("/v1") {
            parsed.set_path(&format!("{path}/chat/completions"));
        } else if path.is_empty() {
            parsed.set_path("/v1/chat/completions");
        } else {
            parsed.set_path(&format!("{path}/v1/chat/completions"));
        }
        parsed.to_string()
    } else {
        format!("{}/v1/chat/completions", base_url.trim_end_matches('/'))
    }
}

/// Strips trailing slashes so endpoint paths can be appended directly.
pub fn trim_base_url(base_url: Option<&str>, default_url: &str) -> String {
    base_url
        .unwrap_or(default_url)
        .trim()
        .trim_end_matches('/')
        .to_string()
}

/// HTTP client for streaming requests: bounded connect time, no total timeout.
pub fn streaming_client() -> Result<reqwest::Client, ApiError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(ApiError::Network)
}

/// Reads the body of an unsuccessful response and classifies it.
pub async fn error_for_response(provider: &str, response: reqwest::Response) -> ApiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    tracing::debug!(target: "api::http", provider, %status, body = %body, "request failed");
    ApiError::from_status(provider, status, body)
}

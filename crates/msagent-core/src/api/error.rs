use eventsource_stream::EventStreamError;
use strum_macros::Display;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SseParseError {
    #[error("UTF-8 error: {details}")]
    Utf8 { details: String },
    #[error("Parse error: {details}")]
    Parser { details: String },
    #[error("Transport error: {details}")]
    Transport { details: String },
}

impl<E> From<EventStreamError<E>> for SseParseError
where
    E: std::error::Error,
{
    fn from(err: EventStreamError<E>) -> Self {
        match err {
            EventStreamError::Utf8(err) => Self::Utf8 {
                details: err.to_string(),
            },
            EventStreamError::Parser(err) => Self::Parser {
                details: err.to_string(),
            },
            EventStreamError::Transport(err) => Self::Transport {
                details: err.to_string(),
            },
        }
    }
}

/// Classification of a failed model stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StreamErrorKind {
    Authentication,
    RateLimited,
    InvalidRequest,
    Server,
    Overloaded,
    Network,
    MalformedStream,
    Timeout,
    Cancelled,
    Provider,
}

impl StreamErrorKind {
    /// Maps the `type` field of a provider's in-stream error object.
    pub fn from_provider_error_type(error_type: &str) -> Self {
        match error_type {
            "authentication_error" | "permission_error" | "invalid_api_key" => Self::Authentication,
            "rate_limit_exceeded" | "rate_limit_error" => Self::RateLimited,
            "invalid_request_error" => Self::InvalidRequest,
            "overloaded_error" => Self::Overloaded,
            "api_error" | "server_error" | "service_unavailable_error" => Self::Server,
            "timeout_error" => Self::Timeout,
            _ => Self::Provider,
        }
    }
}

/// Terminal failure delivered as the last event of a model stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<SseParseError> for StreamError {
    fn from(err: SseParseError) -> Self {
        let kind = match err {
            SseParseError::Transport { .. } => StreamErrorKind::Network,
            SseParseError::Utf8 { .. } | SseParseError::Parser { .. } => {
                StreamErrorKind::MalformedStream
            }
        };
        Self::new(kind, err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Authentication failed: {details}")]
    AuthenticationFailed { provider: String, details: String },

    #[error("Rate limited by {provider}: {details}")]
    RateLimited { provider: String, details: String },

    #[error("Invalid request to {provider}: {details}")]
    InvalidRequest { provider: String, details: String },

    #[error("{provider} server error (Status: {status_code}): {details}")]
    ServerError {
        provider: String,
        status_code: u16,
        details: String,
    },

    #[error("Request timed out for {provider}")]
    Timeout { provider: String },

    #[error("Request cancelled for {provider}")]
    Cancelled { provider: String },

    #[error("Failed to parse response from {provider}: {details}")]
    ResponseParsingError { provider: String, details: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown API error from {provider}: {details}")]
    Unknown { provider: String, details: String },
}

impl ApiError {
    /// Builds the error for a non-success HTTP status.
    pub fn from_status(provider: &str, status: reqwest::StatusCode, details: String) -> Self {
        let provider = provider.to_string();
        match status.as_u16() {
            401 | 403 => ApiError::AuthenticationFailed { provider, details },
            429 => ApiError::RateLimited { provider, details },
            400..=499 => ApiError::InvalidRequest { provider, details },
            code @ 500..=599 => ApiError::ServerError {
                provider,
                status_code: code,
                details,
            },
            _ => ApiError::Unknown { provider, details },
        }
    }
}

impl From<&ApiError> for StreamError {
    fn from(err: &ApiError) -> Self {
        let kind = match err {
            ApiError::Network(e) if e.is_timeout() => StreamErrorKind::Timeout,
            ApiError::Network(_) => StreamErrorKind::Network,
            ApiError::AuthenticationFailed { .. } => StreamErrorKind::Authentication,
            ApiError::RateLimited { .. } => StreamErrorKind::RateLimited,
            ApiError::InvalidRequest { .. } | ApiError::Configuration(_) => {
                StreamErrorKind::InvalidRequest
            }
            ApiError::ServerError { .. } => StreamErrorKind::Server,
            ApiError::Timeout { .. } => StreamErrorKind::Timeout,
            ApiError::Cancelled { .. } => StreamErrorKind::Cancelled,
            ApiError::ResponseParsingError { .. } => StreamErrorKind::MalformedStream,
            ApiError::Unknown { .. } => StreamErrorKind::Provider,
        };
        StreamError::new(kind, err.to_string())
    }
}

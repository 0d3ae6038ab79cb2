use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-level error surfaced to clients and background loops.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    #[error("upstream provider error: {message}")]
    Upstream {
        message: String,
        provider_status: Option<u16>,
    },

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("websocket connection failed: {0}")]
    ConnectFailed(String),

    #[error("rate limit exceeded, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("payload exceeds {limit_bytes} byte limit")]
    PayloadTooLarge { limit_bytes: usize },

    #[error("request deadline exceeded before data was available")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn upstream(message: impl Into<String>, provider_status: Option<u16>) -> Self {
        Self::Upstream {
            message: message.into(),
            provider_status,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Machine-readable error code attached to client responses.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "engine.invalid_input",
            Self::UnknownEndpoint(_) => "engine.unknown_endpoint",
            Self::Upstream { .. } => "engine.upstream",
            Self::CacheUnavailable(_) => "engine.cache_unavailable",
            Self::ConnectFailed(_) => "engine.connect_failed",
            Self::RateLimited { .. } => "engine.rate_limited",
            Self::PayloadTooLarge { .. } => "engine.payload_too_large",
            Self::Timeout => "engine.timeout",
            Self::Internal(_) => "engine.internal",
        }
    }

    /// HTTP status the public server maps this error onto.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::UnknownEndpoint(_) => 404,
            Self::Upstream { .. } => 502,
            Self::PayloadTooLarge { .. } => 413,
            Self::RateLimited { .. } => 429,
            Self::Timeout => 504,
            Self::CacheUnavailable(_) | Self::ConnectFailed(_) | Self::Internal(_) => 500,
        }
    }

    pub const fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Upstream { .. }
                | Self::CacheUnavailable(_)
                | Self::ConnectFailed(_)
                | Self::RateLimited { .. }
                | Self::Timeout
        )
    }
}

/// Client-facing error payload, serialized by the public server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status_code: u16,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_status_code: Option<u16>,
}

impl From<&EngineError> for ErrorBody {
    fn from(error: &EngineError) -> Self {
        let provider_status_code = match error {
            EngineError::Upstream {
                provider_status, ..
            } => *provider_status,
            _ => None,
        };

        Self {
            status_code: error.status_code(),
            code: error.code().to_owned(),
            message: error.to_string(),
            provider_status_code,
        }
    }
}

/// Endpoint schema problems detected when an adapter is assembled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("parameter '{name}' cannot be both required and carry a default")]
    RequiredWithDefault { name: String },

    #[error("parameter '{name}' references undeclared parameter '{target}' in {relation}")]
    UnknownReference {
        name: String,
        target: String,
        relation: &'static str,
    },

    #[error("alias '{alias}' is declared more than once within the endpoint")]
    DuplicateAlias { alias: String },

    #[error("default for parameter '{name}' does not match its declared type")]
    DefaultTypeMismatch { name: String },

    #[error("endpoint alias '{alias}' is registered by more than one endpoint")]
    DuplicateEndpointAlias { alias: String },

    #[error("transport name '{name}' must be non-empty lowercase ASCII")]
    InvalidTransportName { name: String },

    #[error("endpoint '{endpoint}' has no transports registered")]
    NoTransports { endpoint: String },
}

/// Problems that prevent an adapter from starting. All are fatal: the
/// process should exit rather than serve with a partial engine.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Environment configuration problems, fatal at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be an integer between {min} and {max}: '{value}'")]
    IntOutOfBounds {
        name: &'static str,
        value: String,
        min: u64,
        max: u64,
    },

    #[error("{name} must be a port between 1 and 65535: '{value}'")]
    InvalidPort { name: &'static str, value: String },

    #[error("{name} must be a valid URL: '{value}'")]
    InvalidUrl { name: &'static str, value: String },

    #[error("{name} must be a valid IP address or DNS name: '{value}'")]
    InvalidHost { name: &'static str, value: String },

    #[error("{name} must be one of {expected}: '{value}'")]
    InvalidChoice {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(EngineError::invalid_input("bad").status_code(), 400);
        assert_eq!(
            EngineError::UnknownEndpoint(String::from("price")).status_code(),
            404
        );
        assert_eq!(EngineError::upstream("boom", Some(500)).status_code(), 502);
        assert_eq!(EngineError::Timeout.status_code(), 504);
        assert_eq!(
            EngineError::RateLimited { retry_after_ms: 50 }.status_code(),
            429
        );
    }

    #[test]
    fn error_body_carries_provider_status() {
        let error = EngineError::upstream("provider said no", Some(503));
        let body = ErrorBody::from(&error);

        assert_eq!(body.status_code, 502);
        assert_eq!(body.provider_status_code, Some(503));
        assert_eq!(body.code, "engine.upstream");
    }

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(EngineError::Timeout.retryable());
        assert!(EngineError::CacheUnavailable(String::from("down")).retryable());
        assert!(!EngineError::invalid_input("nope").retryable());
    }
}

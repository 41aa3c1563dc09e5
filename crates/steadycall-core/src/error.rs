use thiserror::Error;

/// Validation and contract errors exposed by `steadycall-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("provider id cannot be empty")]
    EmptyProviderId,
    #[error("provider id '{value}' may only contain lowercase ASCII letters, digits, '-', '_' or '/'")]
    InvalidProviderId { value: String },
    #[error("duplicate provider id '{id}' in configuration")]
    DuplicateProvider { id: String },
    #[error("unknown provider '{value}', expected 'auto' or one of: {known}")]
    UnknownProvider { value: String, known: String },

    #[error("provider '{provider}': base_delay_ms must be greater than zero")]
    ZeroBaseDelay { provider: String },
    #[error("provider '{provider}': max_delay_ms ({max_ms}) must be >= base_delay_ms ({base_ms})")]
    MaxDelayBelowBase {
        provider: String,
        base_ms: u64,
        max_ms: u64,
    },
    #[error("provider '{provider}': failure_threshold must be greater than zero")]
    ZeroFailureThreshold { provider: String },
    #[error("provider '{provider}': cooldown_ms must be greater than zero")]
    ZeroCooldown { provider: String },
    #[error("provider '{provider}' is enabled but its endpoint '{value}' is not an http(s) url")]
    InvalidEndpoint { provider: String, value: String },

    #[error("mirror url cannot be empty")]
    EmptyMirrorUrl,
    #[error("mirror url must start with http:// or https://: '{value}'")]
    InvalidMirrorUrl { value: String },

    #[error("resource id cannot be empty")]
    EmptyResourceId,
    #[error("strategy list cannot be empty")]
    EmptyStrategyList,
    #[error("strategy name cannot be empty")]
    EmptyStrategyName,
    #[error("unknown strategy '{value}', expected one of: {known}")]
    UnknownStrategy { value: String, known: String },
}

/// Top-level error type for loading configuration.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to read '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

//! Error types for the shelter ledger.

use std::time::Duration;

/// Failure of a whole message. Per-intent problems never surface here;
/// they end up in the message report instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ledger unavailable: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Duplicate(#[from] DuplicateMessageError),
}

/// Startup configuration problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    MissingEnvVar(String),

    #[error("{key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Ledger store errors. The only hard failure of a commit.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database connection: {0}")]
    Pool(String),

    #[error("query: {0}")]
    Query(String),

    #[error("no {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("constraint: {0}")]
    Constraint(String),

    #[error("migration: {0}")]
    Migration(String),

    #[error("bad stored value: {0}")]
    Serialization(String),
}

/// An intent payload that is missing or has malformed required fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{intent} is missing or has invalid fields: {}", .missing_fields.join(", "))]
pub struct ValidationError {
    /// Intent type label as received (may be unknown).
    pub intent: String,
    pub missing_fields: Vec<String>,
}

impl ValidationError {
    pub fn new(intent: impl Into<String>, missing_fields: Vec<String>) -> Self {
        Self {
            intent: intent.into(),
            missing_fields,
        }
    }
}

/// Why an animal name did not resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionFailure {
    Unmatched,
    Ambiguous { candidates: Vec<i64> },
}

impl std::fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unmatched => write!(f, "not found"),
            Self::Ambiguous { candidates } => {
                write!(f, "is ambiguous ({} candidates)", candidates.len())
            }
        }
    }
}

/// Non-fatal: an animal name could not be resolved, so the line item was
/// committed without allocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("animal '{name}' {reason}")]
pub struct ResolutionWarning {
    pub name: String,
    pub reason: ResolutionFailure,
}

/// A message that was already claimed or processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message {key} already processed")]
pub struct DuplicateMessageError {
    pub key: String,
}

/// Transport errors (outbound replies, media download).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("{name} send failed: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("unreadable delivery: {0}")]
    InvalidMessage(String),

    #[error("{name} rejected the access token: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("transport: {0}")]
    Http(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("classifier {provider}: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("classifier {provider} is throttling (retry after {retry_after:?})")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("classifier {provider} sent an unusable reply: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("classifier {provider} refused the API key")]
    AuthFailed { provider: String },
}

/// Photo storage errors.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("photo upload: {0}")]
    Upload(String),

    #[error("photo store: {0}")]
    Io(#[from] std::io::Error),
}

/// Extraction and confirmation failures.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("could not read intents: {0}")]
    Extraction(String),

    #[error("confirmation channel: {0}")]
    Confirmation(String),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

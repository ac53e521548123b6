// ── Core error types ──
//
// Service-level errors of the subscription fabric. Callers never see raw
// wire failures: the `From<openscada_net::Error>` impl folds transport
// errors into `Protocol` or `Resource`.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    // ── Session errors ───────────────────────────────────────────────
    #[error("Invalid session")]
    InvalidSession,

    #[error("Unable to create session: {reason}")]
    UnableToCreateSession { reason: String },

    // ── Request errors ───────────────────────────────────────────────
    #[error("Unknown query: {query}")]
    UnknownQuery { query: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Result closed")]
    ResultClosed,

    #[error("Operation not supported: {operation}")]
    Unsupported { operation: String },

    // ── Variant conversion errors ────────────────────────────────────
    #[error("Value is null")]
    NullValue,

    #[error("Value {value} is not convertable to {target}")]
    NotConvertable { value: String, target: String },

    // ── Transport / resource errors ──────────────────────────────────
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Resource unavailable: {message}")]
    Resource { message: String },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Fatal: {message}")]
    Fatal { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    pub fn unknown_query(query: impl Into<String>) -> Self {
        Self::UnknownQuery {
            query: query.into(),
        }
    }

    /// Subscribe operations surface key validation failures as
    /// `UnknownQuery`; everything else passes through.
    pub fn into_unknown_query(self, query: &str) -> Self {
        match self {
            Self::Validation { .. } => Self::unknown_query(query),
            other => other,
        }
    }

    /// Returns `true` if the caller may retry after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Resource { .. } | Self::UnableToCreateSession { .. }
        )
    }
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<openscada_net::Error> for CoreError {
    fn from(err: openscada_net::Error) -> Self {
        match err {
            openscada_net::Error::Protocol { message } => CoreError::Protocol { message },
            openscada_net::Error::Failed { message } => CoreError::Resource {
                message: format!("remote request failed: {message}"),
            },
            openscada_net::Error::UnknownCommand { code } => CoreError::Unsupported {
                operation: format!("remote command 0x{code:08x}"),
            },
            other => CoreError::Resource {
                message: other.to_string(),
            },
        }
    }
}

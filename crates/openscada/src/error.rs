//! CLI error types with miette diagnostics.
//!
//! Maps core, config and wire errors into user-facing errors with help
//! text and a process exit code.

use miette::Diagnostic;
use thiserror::Error;

use openscada_config::ConfigError;
use openscada_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────

    #[error("Could not connect to GMPP server at {uri}: {reason}")]
    #[diagnostic(
        code(openscada::connection_failed),
        help(
            "Check that the server is running and reachable.\n\
             Start one with: openscada serve --listen {uri}"
        )
    )]
    ConnectionFailed { uri: String, reason: String },

    #[error("Cannot listen on {listen}: {reason}")]
    #[diagnostic(
        code(openscada::bind_failed),
        help("Pick another address with --listen or [server] listen.")
    )]
    Bind { listen: String, reason: String },

    #[error("Timed out after {seconds}s")]
    #[diagnostic(
        code(openscada::timeout),
        help("Increase the timeout with --timeout or check the server.")
    )]
    Timeout { seconds: u64 },

    // ── Items ────────────────────────────────────────────────────────

    #[error("Item '{item}' is not served by {uri}")]
    #[diagnostic(code(openscada::item_not_found))]
    ItemNotFound { item: String, uri: String },

    #[error("Request failed: {message}")]
    #[diagnostic(code(openscada::request_failed))]
    Request { message: String },

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(openscada::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Configuration file already exists at {path}")]
    #[diagnostic(
        code(openscada::config_exists),
        help("Use --force to overwrite it.")
    )]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(
        code(openscada::config),
        help("Inspect the effective configuration with: openscada config show")
    )]
    Config(#[from] ConfigError),

    // ── IO / Serialization ───────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Cannot render JSON output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cannot render YAML output: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::Bind { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::ItemNotFound { .. } => exit_code::NOT_FOUND,
            Self::Validation { .. } | Self::ConfigExists { .. } => exit_code::USAGE,
            Self::Config(_) => exit_code::CONFIG,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation { message } => CliError::Validation {
                field: "input".into(),
                reason: message,
            },
            CoreError::NullValue => CliError::Validation {
                field: "value".into(),
                reason: "value is null".into(),
            },
            CoreError::NotConvertable { value, target } => CliError::Validation {
                field: "value".into(),
                reason: format!("'{value}' is not a valid {target}"),
            },
            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },
            other => CliError::Request {
                message: other.to_string(),
            },
        }
    }
}

impl From<openscada_net::Error> for CliError {
    fn from(err: openscada_net::Error) -> Self {
        match err {
            openscada_net::Error::Timeout { timeout_ms } => CliError::Timeout {
                seconds: timeout_ms.div_ceil(1000),
            },
            openscada_net::Error::Failed { message } => CliError::Request { message },
            other => CliError::Request {
                message: other.to_string(),
            },
        }
    }
}

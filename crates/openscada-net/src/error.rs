use thiserror::Error;

/// Top-level error type for the `openscada-net` crate.
///
/// Covers every failure mode of the wire layer: framing, transport IO,
/// keepalive and request/reply correlation. `openscada-core` maps these
/// into service-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Framing ─────────────────────────────────────────────────────
    /// The peer sent bytes that do not decode as GMPP (unknown value tag,
    /// oversized frame, invalid UTF-8, truncated body).
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// Socket-level IO failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The address could not be parsed or resolved.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The connection has been closed (locally or by the peer).
    #[error("Connection closed")]
    ConnectionClosed,

    /// No traffic from the peer within the keepalive window, or a request
    /// did not receive its reply in time.
    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // ── Replies ─────────────────────────────────────────────────────
    /// The peer answered a request with `Failed`.
    #[error("Request failed: {message}")]
    Failed { message: String },

    /// The peer does not know the command code of a request.
    #[error("Unknown command code 0x{code:08x}")]
    UnknownCommand { code: u32 },
}

impl Error {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns `true` if the failure concerns the transport and a
    /// reconnect might resolve it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::Timeout { .. }
        )
    }

    /// Returns `true` if the peer violated the framing rules.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}

// Shared transport configuration for GMPP connections.
//
// Client and server sides of a connection share the keepalive and framing
// limits through this module.

use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_LEN;

/// Keepalive, framing and buffering settings for one connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Send a `Ping` after this long without outbound traffic.
    pub idle_ping: Duration,
    /// Close the connection when nothing was received for this long.
    pub ping_timeout: Duration,
    /// How long a request waits for its reply.
    pub request_timeout: Duration,
    /// Upper bound on a single frame body.
    pub max_frame_len: usize,
    /// Capacity of the outbound and inbound message queues.
    pub queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_ping: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            queue_capacity: 1024,
        }
    }
}

impl TransportConfig {
    /// Milliseconds form of `ping_timeout`, used in timeout errors.
    pub(crate) fn ping_timeout_ms(&self) -> u64 {
        u64::try_from(self.ping_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    pub(crate) fn request_timeout_ms(&self) -> u64 {
        u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.idle_ping, Duration::from_secs(10));
        assert_eq!(config.ping_timeout, Duration::from_secs(30));
        assert_eq!(config.ping_timeout_ms(), 30_000);
    }
}

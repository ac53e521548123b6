// ── Reconnect backoff ──
//
// Exponential backoff with a deterministic spread for upstream clients that
// re-establish dropped GMPP connections.

use std::time::Duration;

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    /// A config whose first retry waits `delay` and later retries back off
    /// up to ten times that.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay.saturating_mul(10),
            max_retries: None,
        }
    }

    /// Returns `true` once `attempt` reached the configured retry limit.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries.is_some_and(|max| attempt >= max)
    }
}

/// Delay before reconnection attempt `attempt`.
///
/// The initial delay doubles per attempt until it reaches `max_delay`, then
/// a spread of 80% to 120% cycling over five attempts keeps a fleet of
/// clients from retrying in lockstep.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let doubled = config
        .initial_delay
        .saturating_mul(1_u32 << attempt.min(20));
    let ceiling = doubled.min(config.max_delay);

    let percent = 80 + 10 * (attempt % 5);
    ceiling.saturating_mul(percent) / 100
}

// ── Runtime service configuration ──
//
// These types describe how the services behave and which items a hive
// serves. They never touch disk: the config crate builds them from TOML
// and environment, tests build them directly.

use std::time::Duration;

use openscada_net::{ReconnectConfig, TransportConfig};
use serde::{Deserialize, Serialize};

use crate::model::{Attributes, Variant};

/// Encoding of event data in the replication table.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DataFormat {
    /// JSON text.
    #[default]
    Json,
    /// GMPP map encoding stored as a BLOB.
    Blob,
    /// GMPP map encoding stored as raw bytes.
    Bytes,
}

/// Behaviour shared by the DA, AE and HD services.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Upstream GMPP address (`host:port`), if any.
    pub connection_uri: Option<String>,
    pub reconnect_delay: Duration,
    pub idle_ping: Duration,
    pub ping_timeout: Duration,
    /// Replication batch size.
    pub query_limit: usize,
    /// Delete replication rows that fail to decode.
    pub delete_failed: bool,
    pub data_format: DataFormat,
    /// Prefix of the replication table names.
    pub schema: String,
    /// Pause between replication batches.
    pub loop_delay: Duration,
    /// Forced close of open queries.
    pub query_timeout: Duration,
    pub max_sessions: Option<usize>,
    /// Events kept by the event pool for replay.
    pub event_pool_size: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            connection_uri: None,
            reconnect_delay: Duration::from_millis(10_000),
            idle_ping: Duration::from_millis(10_000),
            ping_timeout: Duration::from_millis(30_000),
            query_limit: 2000,
            delete_failed: false,
            data_format: DataFormat::Json,
            schema: String::new(),
            loop_delay: Duration::from_millis(10_000),
            query_timeout: Duration::from_secs(3600),
            max_sessions: None,
            event_pool_size: 1000,
        }
    }
}

impl ServiceSettings {
    /// Keepalive settings for GMPP connections.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            idle_ping: self.idle_ping,
            ping_timeout: self.ping_timeout,
            ..TransportConfig::default()
        }
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig::with_delay(self.reconnect_delay)
    }
}

// ── Item declarations ────────────────────────────────────────────────

/// One upstream of a proxy item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamSpec {
    /// Catalogue id of the remote connection.
    pub connection: String,
    /// Item id on the remote side.
    pub item: String,
    /// Tie-break between equal qualities; lower wins.
    #[serde(default)]
    pub priority: i32,
}

/// Declaration of a hive item, resolved by the item factory registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemSpec {
    pub name: String,
    /// Registry key, e.g. `memory`, `constant`, `proxy`.
    pub kind: String,
    pub initial_value: Variant,
    pub attributes: Attributes,
    pub upstreams: Vec<UpstreamSpec>,
}

impl ItemSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            initial_value: Variant::Null,
            attributes: Attributes::new(),
            upstreams: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<Variant>) -> Self {
        self.initial_value = value.into();
        self
    }

    pub fn with_upstream(mut self, connection: &str, item: &str, priority: i32) -> Self {
        self.upstreams.push(UpstreamSpec {
            connection: connection.into(),
            item: item.into(),
            priority,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let settings = ServiceSettings::default();
        assert_eq!(settings.query_limit, 2000);
        assert_eq!(settings.loop_delay, Duration::from_secs(10));
        assert_eq!(settings.query_timeout, Duration::from_secs(3600));
        assert_eq!(settings.data_format, DataFormat::Json);
        assert!(!settings.delete_failed);
    }

    #[test]
    fn transport_takes_keepalive_settings() {
        let settings = ServiceSettings {
            idle_ping: Duration::from_secs(3),
            ..ServiceSettings::default()
        };
        let transport = settings.transport();
        assert_eq!(transport.idle_ping, Duration::from_secs(3));
        assert_eq!(transport.ping_timeout, Duration::from_secs(30));
        assert_eq!(settings.reconnect().initial_delay, Duration::from_secs(10));
    }

    #[test]
    fn data_format_names() {
        assert_eq!("blob".parse::<DataFormat>().ok(), Some(DataFormat::Blob));
        assert_eq!(DataFormat::Bytes.to_string(), "bytes");
    }
}

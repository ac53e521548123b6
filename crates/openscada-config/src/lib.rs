//! Configuration for openSCADA services.
//!
//! TOML file plus `OPENSCADA_` environment overrides, validated and
//! translated into `openscada_core` settings and item declarations. The
//! core crate never reads configuration itself.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
    value::{Uncased, UncasedStr},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use openscada_core::{Attributes, DataFormat, ItemSpec, ServiceSettings, UpstreamSpec, Variant};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub service: ServiceSection,
    pub server: ServerSection,
    pub replication: ReplicationSection,
    /// Upstream GMPP connections by id.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub connections: BTreeMap<String, ConnectionSection>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ItemSection>,
}

/// `[service]`: shared tuning, durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServiceSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_uri: Option<String>,
    pub reconnect_delay_ms: u64,
    pub idle_ping_ms: u64,
    pub ping_timeout_ms: u64,
    pub query_limit: usize,
    pub delete_failed: bool,
    pub data_format: DataFormat,
    pub schema: String,
    pub loop_delay_ms: u64,
    pub query_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,
    pub event_pool_size: usize,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            connection_uri: None,
            reconnect_delay_ms: 10_000,
            idle_ping_ms: 10_000,
            ping_timeout_ms: 30_000,
            query_limit: 2000,
            delete_failed: false,
            data_format: DataFormat::Json,
            schema: String::new(),
            loop_delay_ms: 10_000,
            query_timeout_ms: 3_600_000,
            max_sessions: None,
            event_pool_size: 1000,
        }
    }
}

/// `[server]`: the GMPP DA listener.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerSection {
    pub listen: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:1202".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ReplicationSection {
    pub enabled: bool,
}

/// `[connections.<id>]`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectionSection {
    /// GMPP address, `host:port`.
    pub uri: String,
    /// User the upstream session is opened for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// `[[items]]`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ItemSection {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<ScalarValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, ScalarValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<UpstreamSpec>,
}

fn default_kind() -> String {
    "memory".into()
}

/// A plain TOML scalar.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<&ScalarValue> for Variant {
    fn from(value: &ScalarValue) -> Self {
        match value {
            ScalarValue::Bool(b) => Self::Bool(*b),
            ScalarValue::Integer(i) => Self::Int64(*i),
            ScalarValue::Float(f) => Self::Float64(*f),
            ScalarValue::Text(s) => Self::String(s.clone()),
        }
    }
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Check the whole file: settings, endpoints and item declarations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service_settings()?;
        check_address("server.listen", &self.server.listen)?;
        for (id, connection) in &self.connections {
            check_address(&format!("connections.{id}.uri"), &connection.uri)?;
        }
        self.item_specs()?;
        Ok(())
    }

    /// `[service]` as core settings.
    pub fn service_settings(&self) -> Result<ServiceSettings, ConfigError> {
        let s = &self.service;
        if s.query_limit == 0 {
            return Err(invalid("service.query-limit", "must be greater than 0"));
        }
        if s.event_pool_size == 0 {
            return Err(invalid("service.event-pool-size", "must be greater than 0"));
        }
        if s.max_sessions == Some(0) {
            return Err(invalid("service.max-sessions", "must be greater than 0"));
        }
        if let Some(uri) = &s.connection_uri {
            check_address("service.connection-uri", uri)?;
        }

        Ok(ServiceSettings {
            connection_uri: s.connection_uri.clone(),
            reconnect_delay: millis("service.reconnect-delay-ms", s.reconnect_delay_ms)?,
            idle_ping: millis("service.idle-ping-ms", s.idle_ping_ms)?,
            ping_timeout: millis("service.ping-timeout-ms", s.ping_timeout_ms)?,
            query_limit: s.query_limit,
            delete_failed: s.delete_failed,
            data_format: s.data_format,
            schema: s.schema.clone(),
            loop_delay: millis("service.loop-delay-ms", s.loop_delay_ms)?,
            query_timeout: millis("service.query-timeout-ms", s.query_timeout_ms)?,
            max_sessions: s.max_sessions,
            event_pool_size: s.event_pool_size,
        })
    }

    /// `[[items]]` as factory declarations.
    pub fn item_specs(&self) -> Result<Vec<ItemSpec>, ConfigError> {
        let mut seen = BTreeSet::new();
        self.items
            .iter()
            .map(|item| {
                if item.name.trim().is_empty() {
                    return Err(invalid("items.name", "must not be empty"));
                }
                if !seen.insert(item.name.as_str()) {
                    return Err(invalid(
                        "items.name",
                        format!("'{}' is declared twice", item.name),
                    ));
                }
                for upstream in &item.upstreams {
                    if !self.connections.contains_key(&upstream.connection) {
                        return Err(invalid(
                            format!("items.{}.upstreams", item.name),
                            format!("connection '{}' is not declared", upstream.connection),
                        ));
                    }
                }

                let attributes = item
                    .attributes
                    .iter()
                    .fold(Attributes::new(), |attrs, (name, value)| {
                        attrs.with(name.as_str(), Variant::from(value))
                    });
                Ok(ItemSpec {
                    name: item.name.clone(),
                    kind: item.kind.clone(),
                    initial_value: item.initial_value.as_ref().map(Variant::from).unwrap_or_default(),
                    attributes,
                    upstreams: item.upstreams.clone(),
                })
            })
            .collect()
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn millis(field: &str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(invalid(field, "must be greater than 0"));
    }
    Ok(Duration::from_millis(ms))
}

/// `host:port` with a non-empty host and a numeric port.
fn check_address(field: &str, address: &str) -> Result<(), ConfigError> {
    let valid = address
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if valid {
        Ok(())
    } else {
        Err(invalid(field, format!("expected host:port, got '{address}'")))
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "openscada", "openscada").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("openscada");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// `OPENSCADA_SERVICE__QUERY_LIMIT` → `service.query-limit`.
fn env_key(key: &UncasedStr) -> Uncased<'_> {
    key.as_str().replace("__", ".").replace('_', "-").into()
}

/// Defaults, then the file at `path`, then the environment.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("OPENSCADA_").map(env_key))
}

/// Load and validate the config at `path`, or the default path.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let config: Config = figment(&path).extract()?;
    config.validate()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize `cfg` to TOML at `path`, creating parent directories.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, cfg.to_toml()?)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn load(toml: &str) -> Result<Config, ConfigError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, toml).unwrap();
        load_config(Some(&path))
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, Config::default());

        let settings = config.service_settings().unwrap();
        assert_eq!(settings.query_limit, 2000);
        assert_eq!(settings.query_timeout, Duration::from_secs(3600));
        assert_eq!(config.server.listen, "127.0.0.1:1202");
    }

    #[test]
    fn file_values_are_translated() {
        let config = load(
            r#"
            [service]
            query-limit = 50
            data-format = "bytes"
            schema = "scada."
            loop-delay-ms = 500

            [replication]
            enabled = true

            [connections.plant]
            uri = "10.0.0.5:1202"
            user = "proxy"

            [[items]]
            name = "tank.level"
            initial-value = 0.5
            attributes = { unit = "m", alarm = false }

            [[items]]
            name = "tank.level.proxy"
            kind = "proxy"
            upstreams = [{ connection = "plant", item = "tank.level", priority = 1 }]
            "#,
        )
        .unwrap();

        let settings = config.service_settings().unwrap();
        assert_eq!(settings.query_limit, 50);
        assert_eq!(settings.data_format, DataFormat::Bytes);
        assert_eq!(settings.schema, "scada.");
        assert_eq!(settings.loop_delay, Duration::from_millis(500));
        assert!(config.replication.enabled);
        assert_eq!(config.connections["plant"].user.as_deref(), Some("proxy"));

        let specs = config.item_specs().unwrap();
        assert_eq!(
            specs[0],
            ItemSpec {
                attributes: Attributes::new().with("alarm", false).with("unit", "m"),
                ..ItemSpec::new("tank.level", "memory").with_value(Variant::Float64(0.5))
            }
        );
        assert_eq!(
            specs[1],
            ItemSpec::new("tank.level.proxy", "proxy").with_upstream("plant", "tank.level", 1)
        );
    }

    #[test]
    fn undeclared_upstream_connections_are_rejected() {
        let err = load(
            r#"
            [[items]]
            name = "p"
            kind = "proxy"
            upstreams = [{ connection = "nowhere", item = "x" }]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "items.p.upstreams"));
    }

    #[test]
    fn zero_limits_and_durations_are_rejected() {
        for toml in [
            "[service]\nquery-limit = 0",
            "[service]\nloop-delay-ms = 0",
            "[service]\nquery-timeout-ms = 0",
            "[service]\nmax-sessions = 0",
        ] {
            assert!(matches!(load(toml), Err(ConfigError::Validation { .. })), "{toml}");
        }
    }

    #[test]
    fn duplicate_items_and_bad_addresses_are_rejected() {
        let err = load("[[items]]\nname = \"a\"\n[[items]]\nname = \"a\"").unwrap_err();
        assert!(err.to_string().contains("declared twice"));

        let err = load("[server]\nlisten = \"nowhere\"").unwrap_err();
        assert!(err.to_string().contains("server.listen"));
    }

    #[test]
    fn unknown_data_formats_fail_to_load() {
        assert!(matches!(
            load("[service]\ndata-format = \"xml\""),
            Err(ConfigError::Figment(_))
        ));
    }

    #[test]
    fn env_keys_map_to_nested_kebab_case() {
        assert_eq!(
            env_key(UncasedStr::new("service__query_limit")).as_str(),
            "service.query-limit"
        );
        assert_eq!(env_key(UncasedStr::new("server__listen")).as_str(), "server.listen");
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.connections.insert(
            "plant".into(),
            ConnectionSection {
                uri: "localhost:1202".into(),
                user: None,
            },
        );
        save_config(&config, &path).unwrap();
        assert_eq!(load_config(Some(&path)).unwrap(), config);
    }
}

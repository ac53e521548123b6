// ── Alarms & Events model ──
//
// Events are immutable records identified by a UUID. Monitors carry a
// latched condition status that operators acknowledge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::attributes::Attributes;
use super::variant::Variant;

// ── Event ────────────────────────────────────────────────────────────

/// A single AE event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// When the event happened at its source.
    pub source_timestamp: DateTime<Utc>,
    /// When the event entered the system.
    pub entry_timestamp: DateTime<Utc>,
    /// Cluster node that recorded the event.
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Event {
    /// A fresh event stamped with the current time.
    pub fn new(node_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_timestamp: now,
            entry_timestamp: now,
            node_id: node_id.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Variant>) -> Self {
        self.attributes.insert(name, value);
        self
    }

    pub fn with_source_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.source_timestamp = ts;
        self
    }

    /// Field lookup used by query filters. Well-known fields come first,
    /// then attributes by name.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.to_string()),
            "source_timestamp" | "sourceTimestamp" => {
                Some(self.source_timestamp.timestamp_millis().to_string())
            }
            "entry_timestamp" | "entryTimestamp" => {
                Some(self.entry_timestamp.timestamp_millis().to_string())
            }
            "node_id" | "nodeId" => Some(self.node_id.clone()),
            other => self
                .attributes
                .get(other)
                .filter(|v| !v.is_null())
                .map(ToString::to_string),
        }
    }
}

// ── Monitors ─────────────────────────────────────────────────────────

/// Latched condition status of a monitor.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorStatus {
    /// No evaluation yet.
    Init,
    /// Monitoring disabled.
    Inactive,
    Ok,
    /// Failing; no acknowledgement required.
    NotOk,
    /// Failing and acknowledged.
    NotOkAkn,
    /// Recovered, but the failure was never acknowledged.
    NotAkn,
    /// Failing and not yet acknowledged.
    NotOkNotAkn,
}

impl MonitorStatus {
    /// Returns `true` while an operator acknowledgement is outstanding.
    pub fn requires_akn(self) -> bool {
        matches!(self, Self::NotAkn | Self::NotOkNotAkn)
    }

    pub fn is_failing(self) -> bool {
        matches!(self, Self::NotOk | Self::NotOkAkn | Self::NotOkNotAkn)
    }
}

/// Snapshot of one monitor as pushed to condition listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStatusInformation {
    pub id: String,
    pub status: MonitorStatus,
    pub status_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub value: Variant,
    #[serde(default)]
    pub last_akn_user: Option<String>,
    #[serde(default)]
    pub last_akn_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl MonitorStatusInformation {
    pub fn new(id: impl Into<String>, status: MonitorStatus) -> Self {
        Self {
            id: id.into(),
            status,
            status_timestamp: Utc::now(),
            value: Variant::Null,
            last_akn_user: None,
            last_akn_timestamp: None,
            attributes: Attributes::new(),
        }
    }
}

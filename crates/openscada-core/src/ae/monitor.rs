// ── Monitor registry ──
//
// Condition monitors and their latched status. The registry is a
// condition source (always Granted) and an acknowledge handler for the
// monitors it owns. Status changes and acknowledgements can be reported
// to an event pool.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::pool::EventPool;
use crate::model::{Event, MonitorStatus, MonitorStatusInformation, SubscriptionState, Variant};
use crate::subscription::{ListenerHandle, MonitorCache, Source, SourceBase, Update};

/// Handles operator acknowledgements for the monitors it owns.
pub trait AknHandler: Send + Sync {
    /// Returns `true` if `monitor` belongs to this handler.
    fn acknowledge(&self, monitor: &str, user: Option<&str>, timestamp: DateTime<Utc>) -> bool;
}

pub struct MonitorRegistry {
    id: String,
    base: SourceBase<MonitorCache>,
    events: Option<Arc<EventPool>>,
}

impl MonitorRegistry {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(id.into(), None))
    }

    /// Report status changes and acknowledgements to `events`.
    pub fn with_events(id: impl Into<String>, events: Arc<EventPool>) -> Arc<Self> {
        Arc::new(Self::build(id.into(), Some(events)))
    }

    fn build(id: String, events: Option<Arc<EventPool>>) -> Self {
        Self {
            id,
            base: SourceBase::new(SubscriptionState::Granted, MonitorCache::default()),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self, monitor: &str) -> Option<MonitorStatusInformation> {
        self.base.monitor(monitor)
    }

    pub fn monitors(&self) -> Vec<MonitorStatusInformation> {
        self.base.with_cache(|c| c.monitors.values().cloned().collect())
    }

    /// The monitored value is fine. An unacknowledged failure stays
    /// visible as NotAkn.
    pub fn set_ok(&self, monitor: &str, value: Variant, timestamp: DateTime<Utc>) {
        self.transition(monitor, value, timestamp, |current| match current {
            MonitorStatus::NotOkNotAkn | MonitorStatus::NotAkn => MonitorStatus::NotAkn,
            _ => MonitorStatus::Ok,
        });
    }

    /// The monitored value failed. With `requires_akn` the failure latches
    /// until acknowledged.
    pub fn set_failure(
        &self,
        monitor: &str,
        value: Variant,
        timestamp: DateTime<Utc>,
        requires_akn: bool,
    ) {
        self.transition(monitor, value, timestamp, |current| {
            if !requires_akn {
                MonitorStatus::NotOk
            } else if current == MonitorStatus::NotOkAkn {
                MonitorStatus::NotOkAkn
            } else {
                MonitorStatus::NotOkNotAkn
            }
        });
    }

    pub fn set_inactive(&self, monitor: &str, timestamp: DateTime<Utc>) {
        self.transition(monitor, Variant::Null, timestamp, |_| MonitorStatus::Inactive);
    }

    pub fn remove(&self, monitor: &str) {
        self.base.update_monitors(Vec::new(), &[monitor.to_owned()]);
    }

    fn transition(
        &self,
        monitor: &str,
        value: Variant,
        timestamp: DateTime<Utc>,
        next: impl FnOnce(MonitorStatus) -> MonitorStatus,
    ) {
        let mut changed = None;
        self.base.update(|cache| {
            let info = cache
                .monitors
                .entry(monitor.to_owned())
                .or_insert_with(|| {
                    let mut info = MonitorStatusInformation::new(monitor, MonitorStatus::Init);
                    info.status_timestamp = timestamp;
                    info
                });
            let status = next(info.status);
            if status == info.status && info.value == value {
                return Vec::new();
            }
            if status != info.status {
                changed = Some((info.status, status));
                info.status = status;
                info.status_timestamp = timestamp;
            }
            info.value = value;
            vec![Update::Monitors {
                changed: vec![info.clone()],
                removed: Vec::new(),
                full: false,
            }]
        });

        if let Some((from, to)) = changed {
            debug!(registry = %self.id, monitor, %from, %to, "monitor status changed");
            self.emit(
                Event::new(&self.id)
                    .with_source_timestamp(timestamp)
                    .with_attribute("sourceId", monitor)
                    .with_attribute("eventType", "STATUS")
                    .with_attribute("status", to.to_string()),
            );
        }
    }

    fn emit(&self, event: Event) {
        if let Some(pool) = &self.events {
            pool.push(vec![event]);
        }
    }
}

impl AknHandler for MonitorRegistry {
    /// Acknowledge up to `timestamp`. A status newer than the
    /// acknowledgement stays latched.
    fn acknowledge(&self, monitor: &str, user: Option<&str>, timestamp: DateTime<Utc>) -> bool {
        let mut owned = false;
        let mut acknowledged = false;
        self.base.update(|cache| {
            let Some(info) = cache.monitors.get_mut(monitor) else {
                return Vec::new();
            };
            owned = true;
            if timestamp < info.status_timestamp {
                return Vec::new();
            }
            let status = match info.status {
                MonitorStatus::NotOkNotAkn => MonitorStatus::NotOkAkn,
                MonitorStatus::NotAkn => MonitorStatus::Ok,
                _ => return Vec::new(),
            };
            info.status = status;
            info.status_timestamp = timestamp;
            info.last_akn_user = user.map(str::to_owned);
            info.last_akn_timestamp = Some(timestamp);
            acknowledged = true;
            vec![Update::Monitors {
                changed: vec![info.clone()],
                removed: Vec::new(),
                full: false,
            }]
        });

        if acknowledged {
            info!(registry = %self.id, monitor, user = user.unwrap_or("-"), "monitor acknowledged");
            self.emit(
                Event::new(&self.id)
                    .with_source_timestamp(timestamp)
                    .with_attribute("sourceId", monitor)
                    .with_attribute("eventType", "AKN")
                    .with_attribute("actorName", user.unwrap_or_default()),
            );
        }
        owned
    }
}

impl Source for MonitorRegistry {
    fn attach(&self, key: &str, listener: &ListenerHandle, view: Option<SubscriptionState>) {
        Source::attach(&self.base, key, listener, view);
    }

    fn detach(&self, key: &str, listener: &ListenerHandle, teardown: bool) {
        Source::detach(&self.base, key, listener, teardown);
    }

    fn current_state(&self) -> SubscriptionState {
        self.base.state()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::subscription::testing::Recorder;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn status(registry: &MonitorRegistry, id: &str) -> MonitorStatus {
        registry.status(id).unwrap().status
    }

    #[test]
    fn latched_failure_needs_an_acknowledgement() {
        let registry = MonitorRegistry::new("levels");
        registry.set_failure("m1", Variant::from(99), ts(10), true);
        assert_eq!(status(&registry, "m1"), MonitorStatus::NotOkNotAkn);

        registry.set_ok("m1", Variant::from(1), ts(20));
        assert_eq!(status(&registry, "m1"), MonitorStatus::NotAkn);

        // Older than the current status: ignored, but still owned.
        assert!(registry.acknowledge("m1", Some("op"), ts(15)));
        assert_eq!(status(&registry, "m1"), MonitorStatus::NotAkn);

        assert!(registry.acknowledge("m1", Some("op"), ts(30)));
        let info = registry.status("m1").unwrap();
        assert_eq!(info.status, MonitorStatus::Ok);
        assert_eq!(info.last_akn_user.as_deref(), Some("op"));
        assert_eq!(info.last_akn_timestamp, Some(ts(30)));
    }

    #[test]
    fn acknowledged_failures_stay_acknowledged() {
        let registry = MonitorRegistry::new("levels");
        registry.set_failure("m1", Variant::from(1), ts(10), true);
        assert!(registry.acknowledge("m1", None, ts(11)));
        assert_eq!(status(&registry, "m1"), MonitorStatus::NotOkAkn);

        registry.set_failure("m1", Variant::from(2), ts(12), true);
        assert_eq!(status(&registry, "m1"), MonitorStatus::NotOkAkn);

        registry.set_ok("m1", Variant::from(0), ts(13));
        assert_eq!(status(&registry, "m1"), MonitorStatus::Ok);

        registry.set_failure("m1", Variant::from(5), ts(14), false);
        assert_eq!(status(&registry, "m1"), MonitorStatus::NotOk);
        registry.set_inactive("m1", ts(15));
        assert_eq!(status(&registry, "m1"), MonitorStatus::Inactive);
        assert!(!registry.acknowledge("other", None, ts(16)));
    }

    #[test]
    fn listeners_see_status_changes_and_events_are_emitted() {
        let pool = EventPool::new("events", 10, None);
        let registry = MonitorRegistry::with_events("levels", Arc::clone(&pool));
        let (recorder, handle) = Recorder::handle();
        registry.attach("levels", &handle, None);
        assert_eq!(
            recorder.take(),
            vec![
                Update::State(SubscriptionState::Granted),
                Update::Monitors {
                    changed: Vec::new(),
                    removed: Vec::new(),
                    full: true,
                },
            ]
        );

        registry.set_failure("m1", Variant::from(7), ts(10), true);
        let updates = recorder.take();
        assert!(matches!(
            &updates[..],
            [Update::Monitors { changed, full: false, .. }] if changed[0].status == MonitorStatus::NotOkNotAkn
        ));
        assert!(registry.acknowledge("m1", Some("op"), ts(11)));
        registry.remove("m1");
        assert!(registry.monitors().is_empty());

        let kinds: Vec<Option<String>> = pool.events().iter().map(|e| e.field("eventType")).collect();
        assert_eq!(kinds, vec![Some("STATUS".into()), Some("AKN".into())]);
    }
}

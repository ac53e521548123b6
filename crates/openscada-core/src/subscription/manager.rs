// ── Subscription manager ──
//
// Keyed registry of subscription slots. A slot binds an optional source
// to the listeners of one key. Lock order: slot map shard -> slot ->
// source. The shard lock is only held to look up or insert a slot.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::listener::{ListenerHandle, Update};
use super::source::Source;
use crate::error::CoreError;
use crate::model::SubscriptionState;

/// Keys starting with this prefix are reserved for internal use.
pub const RESERVED_PREFIX: &str = "$";

#[derive(Default)]
struct Slot {
    source: Option<Arc<dyn Source>>,
    listeners: Vec<ListenerHandle>,
    /// Set once the slot was removed from the map; holders must retry.
    dead: bool,
}

impl Slot {
    fn is_idle(&self) -> bool {
        self.source.is_none() && self.listeners.is_empty()
    }
}

type SlotRef = Arc<Mutex<Slot>>;

/// Registry of sources and per-key listener sets.
pub struct SubscriptionManager {
    name: String,
    slots: DashMap<String, SlotRef>,
}

impl SubscriptionManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind `source` to `key`, replacing any previous source.
    ///
    /// Attached listeners first see the old source torn down, then the
    /// new source's state (and data, if Granted).
    pub fn set_source(&self, key: &str, source: Option<Arc<dyn Source>>) {
        loop {
            let slot = self.slot_or_insert(key);
            let mut guard = slot.lock();
            if guard.dead {
                continue;
            }

            if let Some(old) = guard.source.take() {
                for listener in &guard.listeners {
                    old.detach(key, listener, true);
                }
            }
            if let Some(new) = &source {
                for listener in &guard.listeners {
                    new.attach(key, listener, Some(SubscriptionState::Disconnected));
                }
            }
            debug!(
                manager = %self.name,
                key,
                bound = source.is_some(),
                listeners = guard.listeners.len(),
                "source replaced"
            );
            guard.source = source;

            self.remove_if_idle(key, &slot, &mut guard);
            return;
        }
    }

    /// Attach `listener` to `key`. Subscribing an already attached
    /// listener again has no effect.
    pub fn subscribe(&self, key: &str, listener: &ListenerHandle) -> Result<(), CoreError> {
        validate_key(key)?;
        loop {
            let slot = self.slot_or_insert(key);
            let mut guard = slot.lock();
            if guard.dead {
                continue;
            }
            if guard.listeners.contains(listener) {
                return Ok(());
            }
            guard.listeners.push(listener.clone());
            match &guard.source {
                Some(source) => source.attach(key, listener, None),
                None => listener.deliver(key, Update::State(SubscriptionState::Disconnected)),
            }
            return Ok(());
        }
    }

    /// Detach `listener` from `key`. Unknown pairs are a no-op.
    pub fn unsubscribe(&self, key: &str, listener: &ListenerHandle) {
        let Some(slot) = self.slots.get(key).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let mut guard = slot.lock();
        if guard.dead {
            return;
        }
        let Some(pos) = guard.listeners.iter().position(|l| l == listener) else {
            return;
        };
        guard.listeners.remove(pos);
        if let Some(source) = &guard.source {
            source.detach(key, listener, false);
        }
        self.remove_if_idle(key, &slot, &mut guard);
    }

    /// Detach `listener` from every key.
    pub fn unsubscribe_all(&self, listener: &ListenerHandle) {
        for key in self.keys() {
            self.unsubscribe(&key, listener);
        }
    }

    /// Keys that currently have a slot.
    pub fn keys(&self) -> Vec<String> {
        self.slots.iter().map(|e| e.key().clone()).collect()
    }

    pub fn source(&self, key: &str) -> Option<Arc<dyn Source>> {
        let slot = self.slots.get(key).map(|s| Arc::clone(s.value()))?;
        let guard = slot.lock();
        guard.source.clone()
    }

    pub fn listener_count(&self, key: &str) -> usize {
        self.slots
            .get(key)
            .map(|s| Arc::clone(s.value()))
            .map_or(0, |slot| slot.lock().listeners.len())
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn slot_or_insert(&self, key: &str) -> SlotRef {
        Arc::clone(
            self.slots
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
                .value(),
        )
    }

    fn remove_if_idle(&self, key: &str, slot: &SlotRef, guard: &mut Slot) {
        if guard.is_idle() {
            guard.dead = true;
            self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, slot));
        }
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("name", &self.name)
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// Keys must be non-empty and outside the reserved namespace.
pub fn validate_key(key: &str) -> Result<(), CoreError> {
    if key.is_empty() {
        return Err(CoreError::validation("subscription key is empty"));
    }
    if key.starts_with(RESERVED_PREFIX) {
        return Err(CoreError::validation(format!(
            "subscription key '{key}' uses the reserved prefix '{RESERVED_PREFIX}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::model::{AttributeMode, Attributes, Variant};
    use crate::subscription::listener::testing::Recorder;
    use crate::subscription::source::{Activation, ItemCache, SourceBase};
    use pretty_assertions::assert_eq;
    use SubscriptionState::{Connected, Disconnected, Granted};

    /// Item source counting its lifecycle hooks.
    struct TestItem {
        base: SourceBase<ItemCache>,
        activated: AtomicUsize,
        deactivated: AtomicUsize,
    }

    impl TestItem {
        fn granted(value: i32) -> Arc<Self> {
            let item = Arc::new(Self {
                base: SourceBase::new(Disconnected, ItemCache::default()),
                activated: AtomicUsize::new(0),
                deactivated: AtomicUsize::new(0),
            });
            item.base.publish(
                Some(Variant::Int32(value)),
                Some(&Attributes::new().with("unit", "V")),
                AttributeMode::Set,
            );
            item.base.notify(Granted);
            item
        }
    }

    impl Activation for TestItem {
        fn on_activate(&self) {
            self.activated.fetch_add(1, Ordering::SeqCst);
        }

        fn on_deactivate(&self) {
            self.deactivated.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Source for TestItem {
        fn attach(&self, key: &str, listener: &ListenerHandle, view: Option<SubscriptionState>) {
            self.base.attach(key, listener, view, self);
        }

        fn detach(&self, key: &str, listener: &ListenerHandle, teardown: bool) {
            self.base.detach(key, listener, teardown, self);
        }

        fn current_state(&self) -> SubscriptionState {
            self.base.state()
        }
    }

    #[test]
    fn attach_after_grant_sequence() {
        let manager = SubscriptionManager::new("da");
        let item = TestItem::granted(42);
        manager.set_source("s1", Some(item));

        let (recorder, listener) = Recorder::handle();
        manager.subscribe("s1", &listener).unwrap();

        assert_eq!(
            recorder.updates(),
            vec![
                Update::State(Granted),
                Update::Value(Variant::Int32(42)),
                Update::Attributes {
                    attributes: Attributes::new().with("unit", "V"),
                    full: true
                },
            ]
        );
    }

    #[test]
    fn last_unsubscribe_deactivates() {
        let manager = SubscriptionManager::new("da");
        let item = TestItem::granted(1);
        manager.set_source("s1", Some(item.clone()));

        let (_a, first) = Recorder::handle();
        let (_b, second) = Recorder::handle();
        manager.subscribe("s1", &first).unwrap();
        manager.subscribe("s1", &second).unwrap();
        manager.unsubscribe("s1", &first);
        manager.unsubscribe("s1", &second);

        assert_eq!(item.activated.load(Ordering::SeqCst), 1);
        assert_eq!(item.deactivated.load(Ordering::SeqCst), 1);
        assert_eq!(item.current_state(), Disconnected);
    }

    #[test]
    fn subscribe_without_source_reports_disconnected() {
        let manager = SubscriptionManager::new("da");
        let (recorder, listener) = Recorder::handle();
        manager.subscribe("missing", &listener).unwrap();
        assert_eq!(recorder.updates(), vec![Update::State(Disconnected)]);

        manager.set_source("missing", Some(TestItem::granted(5)));
        let updates = recorder.updates();
        assert_eq!(updates[1], Update::State(Connected));
        assert_eq!(updates[2], Update::State(Granted));
        assert_eq!(updates[3], Update::Value(Variant::Int32(5)));
    }

    #[test]
    fn replacing_a_source_tears_down_first() {
        let manager = SubscriptionManager::new("da");
        manager.set_source("s1", Some(TestItem::granted(1)));
        let (recorder, listener) = Recorder::handle();
        manager.subscribe("s1", &listener).unwrap();
        recorder.take();

        manager.set_source("s1", Some(TestItem::granted(2)));

        assert_eq!(
            recorder.take(),
            vec![
                Update::State(Connected),
                Update::State(Disconnected),
                Update::Value(Variant::Null),
                Update::Attributes {
                    attributes: Attributes::new(),
                    full: true
                },
                Update::State(Connected),
                Update::State(Granted),
                Update::Value(Variant::Int32(2)),
                Update::Attributes {
                    attributes: Attributes::new().with("unit", "V"),
                    full: true
                },
            ]
        );
    }

    #[test]
    fn malformed_keys_are_rejected() {
        let manager = SubscriptionManager::new("da");
        let (_r, listener) = Recorder::handle();
        assert!(matches!(
            manager.subscribe("", &listener),
            Err(CoreError::Validation { .. })
        ));
        assert!(matches!(
            manager.subscribe("$internal", &listener),
            Err(CoreError::Validation { .. })
        ));
        assert!(manager.is_empty());
    }

    #[test]
    fn duplicate_subscribe_and_foreign_unsubscribe_are_no_ops() {
        let manager = SubscriptionManager::new("da");
        let item = TestItem::granted(1);
        manager.set_source("s1", Some(item.clone()));
        let (recorder, listener) = Recorder::handle();
        let (_other, stranger) = Recorder::handle();

        manager.subscribe("s1", &listener).unwrap();
        manager.subscribe("s1", &listener).unwrap();
        manager.unsubscribe("s1", &stranger);
        manager.unsubscribe("nope", &listener);

        assert_eq!(recorder.updates().len(), 3);
        assert_eq!(manager.listener_count("s1"), 1);
        assert_eq!(item.deactivated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_all_leaves_no_idle_slots() {
        let manager = SubscriptionManager::new("da");
        let (_r, listener) = Recorder::handle();
        manager.subscribe("a", &listener).unwrap();
        manager.subscribe("b", &listener).unwrap();
        assert_eq!(manager.keys().len(), 2);

        manager.unsubscribe_all(&listener);

        assert!(manager.is_empty());
    }

    #[test]
    fn concurrent_subscribers_all_attach() {
        let manager = Arc::new(SubscriptionManager::new("da"));
        let item = TestItem::granted(1);
        manager.set_source("s1", Some(item.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    let (recorder, listener) = Recorder::handle();
                    for _ in 0..50 {
                        manager.subscribe("s1", &listener).unwrap();
                        manager.unsubscribe("s1", &listener);
                    }
                    manager.subscribe("s1", &listener).unwrap();
                    recorder
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(manager.listener_count("s1"), 8);
        let activated = item.activated.load(Ordering::SeqCst);
        let deactivated = item.deactivated.load(Ordering::SeqCst);
        assert_eq!(activated, deactivated + 1);
    }
}

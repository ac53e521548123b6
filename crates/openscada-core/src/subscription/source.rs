// ── Source base ──
//
// State tracking, cached data and fan-out shared by every source. A
// concrete source embeds a `SourceBase` and implements `Activation` for
// its lifecycle hooks.
//
// Locks: `lifecycle` serialises listener-count changes with the hooks;
// `inner` guards state, cache and attached listeners. Hooks run with
// `lifecycle` held but `inner` released, so they may notify or publish.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use tracing::trace;

use super::listener::{ListenerHandle, Update};
use crate::model::{
    AttributeMode, Attributes, Event, MonitorStatusInformation, SubscriptionState, Variant,
};

// ── Source trait ─────────────────────────────────────────────────────

/// A value-producing component bound into a subscription manager.
pub trait Source: Send + Sync {
    /// Attach `listener` under `key`.
    ///
    /// `view` is the state the listener was last told for this key. With
    /// `None` the listener receives the current state as one delivery;
    /// otherwise it is stepped from `view` through the legal transitions.
    /// A Granted source then sends its cached data.
    fn attach(&self, key: &str, listener: &ListenerHandle, view: Option<SubscriptionState>);

    /// Detach `listener`. With `teardown` the listener is walked to
    /// Disconnected and its cached data cleared first. Detaching an
    /// unknown listener is a no-op.
    fn detach(&self, key: &str, listener: &ListenerHandle, teardown: bool);

    fn current_state(&self) -> SubscriptionState;
}

/// Lifecycle hooks of a source.
pub trait Activation: Send + Sync {
    /// The listener count rose from 0 to 1.
    fn on_activate(&self) {}

    /// The listener count fell to 0. Must release external resources.
    fn on_deactivate(&self) {}

    /// Whether the source drops to Disconnected after deactivation.
    fn permits_deactivation(&self) -> bool {
        true
    }
}

/// Hooks that do nothing and permit deactivation.
pub struct Passive;

impl Activation for Passive {}

// ── Cached data ──────────────────────────────────────────────────────

/// Data a source replays to listeners.
pub trait SourceCache: Send {
    /// Brings a listener that just saw Granted up to date.
    fn snapshot(&self) -> Vec<Update>;

    /// Sent when the source re-enters Granted.
    fn regrant(&self) -> Vec<Update> {
        self.snapshot()
    }

    /// Tells a torn-down listener that its data is gone.
    fn cleared(&self) -> Vec<Update>;
}

/// Last value and attribute map of a data item.
#[derive(Debug, Default)]
pub struct ItemCache {
    pub value: Variant,
    pub attributes: Attributes,
}

impl SourceCache for ItemCache {
    fn snapshot(&self) -> Vec<Update> {
        vec![
            Update::Value(self.value.clone()),
            Update::Attributes {
                attributes: self.attributes.clone(),
                full: true,
            },
        ]
    }

    fn cleared(&self) -> Vec<Update> {
        vec![
            Update::Value(Variant::Null),
            Update::Attributes {
                attributes: Attributes::new(),
                full: true,
            },
        ]
    }
}

/// Current monitor set of a condition source.
#[derive(Debug, Default)]
pub struct MonitorCache {
    pub monitors: BTreeMap<String, MonitorStatusInformation>,
}

impl SourceCache for MonitorCache {
    fn snapshot(&self) -> Vec<Update> {
        vec![Update::Monitors {
            changed: self.monitors.values().cloned().collect(),
            removed: Vec::new(),
            full: true,
        }]
    }

    fn cleared(&self) -> Vec<Update> {
        vec![Update::Monitors {
            changed: Vec::new(),
            removed: Vec::new(),
            full: true,
        }]
    }
}

/// The most recent events of an event source, oldest first.
#[derive(Debug)]
pub struct EventCache {
    events: VecDeque<Event>,
    capacity: usize,
}

impl EventCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
        }
    }

    /// Append and trim to capacity.
    pub fn push(&mut self, events: &[Event]) {
        self.events.extend(events.iter().cloned());
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}

impl SourceCache for EventCache {
    fn snapshot(&self) -> Vec<Update> {
        if self.events.is_empty() {
            Vec::new()
        } else {
            vec![Update::Events(self.events.iter().cloned().collect())]
        }
    }

    // Events are not replayed to listeners that already saw them.
    fn regrant(&self) -> Vec<Update> {
        Vec::new()
    }

    fn cleared(&self) -> Vec<Update> {
        Vec::new()
    }
}

// ── SourceBase ───────────────────────────────────────────────────────

struct Attached {
    key: String,
    listener: ListenerHandle,
}

struct Inner<C> {
    state: SubscriptionState,
    cache: C,
    attached: Vec<Attached>,
}

impl<C: SourceCache> Inner<C> {
    fn fan_out(&self, updates: &[Update]) {
        for attached in &self.attached {
            for update in updates {
                attached.listener.deliver(&attached.key, update.clone());
            }
        }
    }
}

/// Shared implementation of [`Source`] over a cache type.
pub struct SourceBase<C> {
    lifecycle: Mutex<usize>,
    inner: Mutex<Inner<C>>,
}

impl<C: SourceCache> SourceBase<C> {
    pub fn new(state: SubscriptionState, cache: C) -> Self {
        Self {
            lifecycle: Mutex::new(0),
            inner: Mutex::new(Inner {
                state,
                cache,
                attached: Vec::new(),
            }),
        }
    }

    pub fn attach(
        &self,
        key: &str,
        listener: &ListenerHandle,
        view: Option<SubscriptionState>,
        hooks: &dyn Activation,
    ) {
        let mut count = self.lifecycle.lock();
        {
            let mut inner = self.inner.lock();
            if inner.attached.iter().any(|a| a.listener == *listener) {
                return;
            }
            let steps = match view {
                None => vec![inner.state],
                Some(view) => view.path_to(inner.state),
            };
            for step in steps {
                listener.deliver(key, Update::State(step));
            }
            if inner.state.is_granted() {
                for update in inner.cache.snapshot() {
                    listener.deliver(key, update);
                }
            }
            inner.attached.push(Attached {
                key: key.to_owned(),
                listener: listener.clone(),
            });
        }

        *count += 1;
        if *count == 1 {
            trace!(key, "activating source");
            hooks.on_activate();
        }
    }

    pub fn detach(
        &self,
        key: &str,
        listener: &ListenerHandle,
        teardown: bool,
        hooks: &dyn Activation,
    ) {
        let mut count = self.lifecycle.lock();
        {
            let mut inner = self.inner.lock();
            let Some(pos) = inner
                .attached
                .iter()
                .position(|a| a.listener == *listener)
            else {
                return;
            };
            let attached = inner.attached.remove(pos);
            if teardown {
                for step in inner.state.path_to(SubscriptionState::Disconnected) {
                    attached.listener.deliver(&attached.key, Update::State(step));
                }
                for update in inner.cache.cleared() {
                    attached.listener.deliver(&attached.key, update);
                }
            }
        }

        *count = count.saturating_sub(1);
        if *count == 0 {
            trace!(key, "deactivating source");
            hooks.on_deactivate();
            if hooks.permits_deactivation() {
                self.notify(SubscriptionState::Disconnected);
            }
        }
    }

    /// Move the source to `state`, stepping every listener through the
    /// legal transitions. Re-entering Granted replays the cache.
    pub fn notify(&self, state: SubscriptionState) {
        let mut inner = self.inner.lock();
        if inner.state == state {
            return;
        }
        let steps = inner.state.path_to(state);
        inner.state = state;
        for step in steps {
            inner.fan_out(&[Update::State(step)]);
        }
        if state.is_granted() {
            let regrant = inner.cache.regrant();
            inner.fan_out(&regrant);
        }
    }

    /// Mutate the cache. The returned updates reach listeners only while
    /// the source is Granted.
    pub fn update(&self, f: impl FnOnce(&mut C) -> Vec<Update>) {
        let mut inner = self.inner.lock();
        let updates = f(&mut inner.cache);
        if inner.state.is_granted() && !updates.is_empty() {
            inner.fan_out(&updates);
        }
    }

    /// Read the cache.
    pub fn with_cache<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        f(&self.inner.lock().cache)
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.lock().state
    }

    pub fn listener_count(&self) -> usize {
        *self.lifecycle.lock()
    }
}

impl<C: SourceCache> Source for SourceBase<C> {
    fn attach(&self, key: &str, listener: &ListenerHandle, view: Option<SubscriptionState>) {
        SourceBase::attach(self, key, listener, view, &Passive);
    }

    fn detach(&self, key: &str, listener: &ListenerHandle, teardown: bool) {
        SourceBase::detach(self, key, listener, teardown, &Passive);
    }

    fn current_state(&self) -> SubscriptionState {
        self.state()
    }
}

// ── Item sources ─────────────────────────────────────────────────────

impl SourceBase<ItemCache> {
    /// Update value and attributes.
    ///
    /// A value equal to the cached one is suppressed; attribute changes
    /// are still delivered.
    pub fn publish(&self, value: Option<Variant>, attributes: Option<&Attributes>, mode: AttributeMode) {
        self.update(|cache| {
            let mut updates = Vec::new();
            if let Some(value) = value {
                if value != cache.value {
                    cache.value = value.clone();
                    updates.push(Update::Value(value));
                }
            }
            if let Some(attributes) = attributes {
                if let Some(diff) = cache.attributes.apply(attributes, mode) {
                    updates.push(Update::Attributes {
                        attributes: diff,
                        full: mode == AttributeMode::Set,
                    });
                }
            }
            updates
        });
    }

    pub fn value(&self) -> Variant {
        self.with_cache(|c| c.value.clone())
    }

    pub fn attributes(&self) -> Attributes {
        self.with_cache(|c| c.attributes.clone())
    }
}

// ── Condition sources ────────────────────────────────────────────────

impl SourceBase<MonitorCache> {
    /// Insert or replace monitors and drop `removed` ids.
    pub fn update_monitors(&self, changed: Vec<MonitorStatusInformation>, removed: &[String]) {
        self.update(|cache| {
            let removed: Vec<String> = removed
                .iter()
                .filter(|id| cache.monitors.remove(id.as_str()).is_some())
                .cloned()
                .collect();
            for info in &changed {
                cache.monitors.insert(info.id.clone(), info.clone());
            }
            if changed.is_empty() && removed.is_empty() {
                return Vec::new();
            }
            vec![Update::Monitors {
                changed,
                removed,
                full: false,
            }]
        });
    }

    /// Drop every monitor.
    pub fn clear_monitors(&self) {
        self.update(|cache| {
            if cache.monitors.is_empty() {
                return Vec::new();
            }
            cache.monitors.clear();
            cache.cleared()
        });
    }

    pub fn monitor(&self, id: &str) -> Option<MonitorStatusInformation> {
        self.with_cache(|c| c.monitors.get(id).cloned())
    }
}

// ── Event sources ────────────────────────────────────────────────────

impl SourceBase<EventCache> {
    pub fn push_events(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        self.update(|cache| {
            cache.push(&events);
            vec![Update::Events(events)]
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::subscription::listener::testing::Recorder;
    use pretty_assertions::assert_eq;
    use SubscriptionState::{Connected, Disconnected, Granted};

    #[derive(Default)]
    struct Counting {
        activated: AtomicUsize,
        deactivated: AtomicUsize,
    }

    impl Activation for Counting {
        fn on_activate(&self) {
            self.activated.fetch_add(1, Ordering::SeqCst);
        }

        fn on_deactivate(&self) {
            self.deactivated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn granted_item() -> SourceBase<ItemCache> {
        let base = SourceBase::new(Disconnected, ItemCache::default());
        base.publish(
            Some(Variant::Int32(42)),
            Some(&Attributes::new().with("unit", "V")),
            AttributeMode::Set,
        );
        base.notify(Granted);
        base
    }

    #[test]
    fn attach_after_grant_delivers_state_value_attributes() {
        let base = granted_item();
        let (recorder, listener) = Recorder::handle();

        base.attach("s1", &listener, None, &Passive);

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
    fn attaching_twice_is_ignored() {
        let base = granted_item();
        let (recorder, listener) = Recorder::handle();
        base.attach("s1", &listener, None, &Passive);
        base.attach("s1", &listener, None, &Passive);

        assert_eq!(recorder.updates().len(), 3);
        assert_eq!(base.listener_count(), 1);
    }

    #[test]
    fn equal_values_are_suppressed_but_attributes_flow() {
        let base = granted_item();
        let (recorder, listener) = Recorder::handle();
        base.attach("s1", &listener, None, &Passive);
        recorder.take();

        base.publish(
            Some(Variant::Int32(42)),
            Some(&Attributes::new().with("alarm", true)),
            AttributeMode::Update,
        );

        assert_eq!(
            recorder.take(),
            vec![Update::Attributes {
                attributes: Attributes::new().with("alarm", true),
                full: false
            }]
        );
    }

    #[test]
    fn leaving_granted_is_seen_before_later_values() {
        let base = granted_item();
        let (recorder, listener) = Recorder::handle();
        base.attach("s1", &listener, None, &Passive);
        recorder.take();

        base.notify(Disconnected);
        base.publish(Some(Variant::Int32(7)), None, AttributeMode::Update);
        base.notify(Granted);

        assert_eq!(
            recorder.take(),
            vec![
                Update::State(Connected),
                Update::State(Disconnected),
                Update::State(Connected),
                Update::State(Granted),
                Update::Value(Variant::Int32(7)),
                Update::Attributes {
                    attributes: Attributes::new().with("unit", "V"),
                    full: true
                },
            ]
        );
    }

    #[test]
    fn activation_follows_listener_count() {
        let base = SourceBase::new(Connected, ItemCache::default());
        let hooks = Counting::default();
        let (_a, first) = Recorder::handle();
        let (_b, second) = Recorder::handle();

        base.attach("s1", &first, None, &hooks);
        base.attach("s1", &second, None, &hooks);
        base.detach("s1", &first, false, &hooks);
        base.detach("s1", &second, false, &hooks);

        assert_eq!(hooks.activated.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.deactivated.load(Ordering::SeqCst), 1);
        assert_eq!(base.state(), Disconnected);
    }

    #[test]
    fn teardown_walks_back_and_clears() {
        let base = granted_item();
        let (recorder, listener) = Recorder::handle();
        base.attach("s1", &listener, None, &Passive);
        recorder.take();

        base.detach("s1", &listener, true, &Passive);

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
            ]
        );
    }

    #[test]
    fn attach_with_view_steps_through_connected() {
        let base = granted_item();
        let (recorder, listener) = Recorder::handle();

        base.attach("s1", &listener, Some(Disconnected), &Passive);

        let updates = recorder.updates();
        assert_eq!(updates[0], Update::State(Connected));
        assert_eq!(updates[1], Update::State(Granted));
    }

    #[test]
    fn event_cache_keeps_the_newest() {
        let base = SourceBase::new(Granted, EventCache::new(2));
        let events: Vec<Event> = (0..3).map(|_| Event::new("n")).collect();
        base.push_events(events.clone());

        let (recorder, listener) = Recorder::handle();
        base.attach("pool", &listener, None, &Passive);

        assert_eq!(
            recorder.updates(),
            vec![
                Update::State(Granted),
                Update::Events(events[1..].to_vec())
            ]
        );
    }

    #[test]
    fn monitor_updates_report_effective_removals() {
        let base = SourceBase::new(Granted, MonitorCache::default());
        let (recorder, listener) = Recorder::handle();
        base.attach("c", &listener, None, &Passive);
        recorder.take();

        let info = MonitorStatusInformation::new("m1", crate::model::MonitorStatus::Ok);
        base.update_monitors(vec![info.clone()], &["unknown".to_owned()]);
        base.update_monitors(Vec::new(), &["m1".to_owned()]);

        assert_eq!(
            recorder.take(),
            vec![
                Update::Monitors {
                    changed: vec![info],
                    removed: Vec::new(),
                    full: false
                },
                Update::Monitors {
                    changed: Vec::new(),
                    removed: vec!["m1".to_owned()],
                    full: false
                },
            ]
        );
    }
}

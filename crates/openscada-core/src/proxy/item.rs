// ── Proxy item ──
//
// A data item fed by N upstream items on remote connections. The merged
// value is the Granted upstream with the best quality; equal qualities go
// to the lower priority, then to the upstream declared first.
//
// Each upstream's connection is followed through a catalogue tracker.
// Rebinding an upstream bumps its generation so late deliveries from the
// old binding are dropped, and resets its view before the new binding
// attaches.

use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::connection::RemoteConnection;
use crate::browser::BrowserEntry;
use crate::catalogue::{PROP_SERVICE_ID, ServiceCatalogue, ServiceTracker};
use crate::config::UpstreamSpec;
use crate::da::{DataItem, WriteFuture};
use crate::error::CoreError;
use crate::filter::Filter;
use crate::model::{AttributeMode, Attributes, SubscriptionState, Variant};
use crate::subscription::{Activation, ItemCache, Listener, ListenerHandle, Source, SourceBase, Update};

/// Attribute an upstream reports its quality in, within `[0, 1]`.
pub const QUALITY_ATTRIBUTE: &str = "quality";

struct Upstream {
    spec: UpstreamSpec,
    connection: Option<Arc<dyn RemoteConnection>>,
    listener: Option<ListenerHandle>,
    generation: u64,
    /// Updates accepted from the current binding.
    accepted: u64,
    state: SubscriptionState,
    value: Variant,
    attributes: Attributes,
}

impl Upstream {
    fn new(spec: UpstreamSpec) -> Self {
        Self {
            spec,
            connection: None,
            listener: None,
            generation: 0,
            accepted: 0,
            state: SubscriptionState::Disconnected,
            value: Variant::Null,
            attributes: Attributes::new(),
        }
    }

    fn quality(&self) -> f64 {
        self.attributes
            .get(QUALITY_ATTRIBUTE)
            .and_then(|q| q.as_f64().ok())
            .unwrap_or(1.0)
    }

    fn reset(&mut self) {
        self.state = SubscriptionState::Disconnected;
        self.value = Variant::Null;
        self.attributes = Attributes::new();
        self.accepted = 0;
    }

    fn binding(&self) -> Option<(Arc<dyn RemoteConnection>, ListenerHandle)> {
        Some((Arc::clone(self.connection.as_ref()?), self.listener.clone()?))
    }
}

struct State {
    upstreams: Vec<Upstream>,
    active: bool,
}

/// Data item merging several upstream items.
pub struct ProxyItem {
    id: String,
    me: Weak<ProxyItem>,
    base: SourceBase<ItemCache>,
    state: Mutex<State>,
    trackers: Mutex<Vec<ServiceTracker<dyn RemoteConnection>>>,
}

impl ProxyItem {
    /// Build the item and start tracking each upstream's connection in
    /// `connections`.
    pub fn new(
        id: impl Into<String>,
        upstreams: &[UpstreamSpec],
        connections: &Arc<ServiceCatalogue<dyn RemoteConnection>>,
    ) -> Arc<Self> {
        let proxy = Arc::new_cyclic(|me| Self {
            id: id.into(),
            me: me.clone(),
            base: SourceBase::new(SubscriptionState::Disconnected, ItemCache::default()),
            state: Mutex::new(State {
                upstreams: upstreams.iter().cloned().map(Upstream::new).collect(),
                active: false,
            }),
            trackers: Mutex::new(Vec::new()),
        });

        let trackers: Vec<_> = upstreams
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let weak = Arc::downgrade(&proxy);
                ServiceTracker::open(
                    connections,
                    Filter::Equal(PROP_SERVICE_ID.into(), spec.connection.clone()),
                    move |entry| {
                        if let Some(proxy) = weak.upgrade() {
                            proxy.set_connection(index, entry.map(|e| e.service));
                        }
                    },
                )
            })
            .collect();
        *proxy.trackers.lock() = trackers;
        proxy
    }

    /// Rebind upstream `index` to `connection`.
    pub fn set_connection(&self, index: usize, connection: Option<Arc<dyn RemoteConnection>>) {
        let (old, new, item) = {
            let mut state = self.state.lock();
            let active = state.active;
            let Some(upstream) = state.upstreams.get_mut(index) else {
                return;
            };
            upstream.generation += 1;
            let old = upstream.binding();
            upstream.reset();
            upstream.listener = connection
                .as_ref()
                .map(|_| self.listener(index, upstream.generation));
            upstream.connection = connection;
            let new = if active { upstream.binding() } else { None };
            let item = upstream.spec.item.clone();
            debug!(
                proxy = %self.id,
                upstream = %upstream.spec.connection,
                bound = upstream.connection.is_some(),
                "upstream rebound"
            );
            self.merge(&state);
            (old, new, item)
        };

        if let Some((connection, listener)) = old {
            connection.unsubscribe(&item, &listener);
        }
        if let Some((connection, listener)) = new {
            self.subscribe_upstream(&connection, &item, &listener);
        }
    }

    fn listener(&self, index: usize, generation: u64) -> ListenerHandle {
        ListenerHandle::new(Arc::new(UpstreamListener {
            proxy: self.me.clone(),
            index,
            generation,
        }))
    }

    /// Current state of each upstream, in declaration order.
    pub fn upstream_states(&self) -> Vec<SubscriptionState> {
        self.state.lock().upstreams.iter().map(|u| u.state).collect()
    }

    fn subscribe_upstream(&self, connection: &Arc<dyn RemoteConnection>, item: &str, listener: &ListenerHandle) {
        if let Err(e) = connection.subscribe(item, listener) {
            debug!(proxy = %self.id, upstream = connection.id(), error = %e, "upstream subscribe failed");
        }
    }

    fn on_upstream(&self, index: usize, generation: u64, update: Update) {
        let mut state = self.state.lock();
        let Some(upstream) = state.upstreams.get_mut(index) else {
            return;
        };
        if upstream.generation != generation {
            trace!(proxy = %self.id, index, generation, "update from a released binding dropped");
            return;
        }
        // Stamped under the state lock, in the order updates are applied.
        upstream.accepted += 1;
        trace!(proxy = %self.id, index, sequence = upstream.accepted, "upstream update");
        match update {
            Update::State(s) => {
                upstream.state = s;
                if s == SubscriptionState::Disconnected {
                    upstream.value = Variant::Null;
                    upstream.attributes = Attributes::new();
                }
            }
            Update::Value(v) => upstream.value = v,
            Update::Attributes { attributes, full } => {
                let mode = if full {
                    AttributeMode::Set
                } else {
                    AttributeMode::Update
                };
                upstream.attributes.apply(&attributes, mode);
            }
            Update::Monitors { .. } | Update::Events(_) => return,
        }
        self.merge(&state);
    }

    /// Index of the upstream whose value is reported.
    fn winner(state: &State) -> Option<usize> {
        state
            .upstreams
            .iter()
            .enumerate()
            .filter(|(_, u)| u.state.is_granted())
            .max_by(|(ia, a), (ib, b)| {
                a.quality()
                    .total_cmp(&b.quality())
                    .then(b.spec.priority.cmp(&a.spec.priority))
                    .then(ib.cmp(ia))
            })
            .map(|(i, _)| i)
    }

    // Runs with the state lock held so merged output keeps upstream order.
    fn merge(&self, state: &State) {
        let merged = if state.upstreams.iter().any(|u| u.state.is_granted()) {
            SubscriptionState::Granted
        } else if state
            .upstreams
            .iter()
            .any(|u| u.state == SubscriptionState::Connected)
        {
            SubscriptionState::Connected
        } else {
            SubscriptionState::Disconnected
        };

        match Self::winner(state).and_then(|i| state.upstreams.get(i)) {
            Some(best) => {
                self.base
                    .publish(Some(best.value.clone()), Some(&best.attributes), AttributeMode::Set);
                self.base.notify(merged);
            }
            None => {
                self.base.notify(merged);
                self.base
                    .publish(Some(Variant::Null), Some(&Attributes::new()), AttributeMode::Set);
            }
        }
    }
}

impl Activation for ProxyItem {
    fn on_activate(&self) {
        let bindings: Vec<_> = {
            let mut state = self.state.lock();
            state.active = true;
            state
                .upstreams
                .iter()
                .filter_map(|u| u.binding().map(|b| (u.spec.item.clone(), b)))
                .collect()
        };
        for (item, (connection, listener)) in bindings {
            self.subscribe_upstream(&connection, &item, &listener);
        }
    }

    fn on_deactivate(&self) {
        let bindings: Vec<_> = {
            let mut state = self.state.lock();
            state.active = false;
            let mut bindings = Vec::new();
            for (index, upstream) in state.upstreams.iter_mut().enumerate() {
                if let Some(binding) = upstream.binding() {
                    bindings.push((upstream.spec.item.clone(), binding));
                }
                // Deliveries still queued for the old binding are stale.
                upstream.generation += 1;
                upstream.reset();
                upstream.listener = upstream
                    .connection
                    .as_ref()
                    .map(|_| self.listener(index, upstream.generation));
            }
            self.merge(&state);
            bindings
        };
        for (item, (connection, listener)) in bindings {
            connection.unsubscribe(&item, &listener);
        }
    }
}

impl Source for ProxyItem {
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

impl DataItem for ProxyItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn read(&self) -> Variant {
        self.base.value()
    }

    fn attributes(&self) -> Attributes {
        self.base.attributes()
    }

    fn write(&self, value: Variant, user: Option<&str>) -> WriteFuture {
        let target = {
            let state = self.state.lock();
            Self::winner(&state)
                .and_then(|i| state.upstreams.get(i))
                .and_then(|u| Some((Arc::clone(u.connection.as_ref()?), u.spec.item.clone())))
        };
        match target {
            Some((connection, item)) => connection.write(&item, value, user.map(str::to_owned)),
            None => {
                let err = CoreError::resource(format!("no upstream of proxy '{}' is granted", self.id));
                future::ready(Err(err)).boxed()
            }
        }
    }

    fn information(&self) -> BrowserEntry {
        let upstreams = self.state.lock().upstreams.len();
        BrowserEntry::new(&self.id).with_description(format!("Proxy over {upstreams} upstreams"))
    }
}

impl Drop for ProxyItem {
    fn drop(&mut self) {
        for upstream in &self.state.get_mut().upstreams {
            if let Some((connection, listener)) = upstream.binding() {
                connection.unsubscribe(&upstream.spec.item, &listener);
            }
        }
    }
}

/// Listener bound to one generation of one upstream.
struct UpstreamListener {
    proxy: Weak<ProxyItem>,
    index: usize,
    generation: u64,
}

impl Listener for UpstreamListener {
    fn deliver(&self, _key: &str, update: Update) {
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.on_upstream(self.index, self.generation, update);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::catalogue::Registration;
    use crate::config::ServiceSettings;
    use crate::da::{DaHive, MemoryItem};
    use crate::proxy::LocalConnection;
    use crate::subscription::testing::Recorder;

    struct Upstreams {
        catalogue: Arc<ServiceCatalogue<dyn RemoteConnection>>,
        hives: Vec<Arc<DaHive>>,
        connections: Vec<Arc<LocalConnection>>,
        registrations: Vec<Registration<dyn RemoteConnection>>,
    }

    impl Upstreams {
        /// One hive per `(value, quality)`, each serving item `src`.
        fn new(items: &[(f64, f64)]) -> Self {
            let catalogue: Arc<ServiceCatalogue<dyn RemoteConnection>> = ServiceCatalogue::new();
            let mut upstreams = Self {
                catalogue,
                hives: Vec::new(),
                connections: Vec::new(),
                registrations: Vec::new(),
            };
            for (i, (value, quality)) in items.iter().enumerate() {
                let hive = DaHive::new(&ServiceSettings::default());
                hive.register_item(MemoryItem::new(
                    "src",
                    Variant::Float64(*value),
                    Attributes::new().with(QUALITY_ATTRIBUTE, *quality),
                ));
                let id = format!("u{}", i + 1);
                let connection = LocalConnection::new(&id, Arc::clone(&hive));
                upstreams.registrations.push(upstreams.catalogue.register(
                    id,
                    BTreeMap::new(),
                    Arc::clone(&connection) as Arc<dyn RemoteConnection>,
                ));
                upstreams.hives.push(hive);
                upstreams.connections.push(connection);
            }
            upstreams
        }

        async fn flush(&self) {
            for connection in &self.connections {
                connection.flush().await;
            }
        }
    }

    fn spec(connection: &str, priority: i32) -> UpstreamSpec {
        UpstreamSpec {
            connection: connection.into(),
            item: "src".into(),
            priority,
        }
    }

    #[tokio::test]
    async fn equal_quality_goes_to_the_lower_priority() {
        let upstreams = Upstreams::new(&[(1.0, 0.8), (2.0, 0.8)]);
        let proxy = ProxyItem::new("p", &[spec("u1", 10), spec("u2", 5)], &upstreams.catalogue);
        let (_recorder, listener) = Recorder::handle();

        proxy.attach("p", &listener, None);
        upstreams.flush().await;

        assert_eq!(proxy.current_state(), SubscriptionState::Granted);
        assert_eq!(proxy.read(), Variant::Float64(2.0));
    }

    #[tokio::test]
    async fn better_quality_wins_over_priority() {
        let upstreams = Upstreams::new(&[(1.0, 0.9), (2.0, 0.5)]);
        let proxy = ProxyItem::new("p", &[spec("u1", 10), spec("u2", 5)], &upstreams.catalogue);
        let (_recorder, listener) = Recorder::handle();

        proxy.attach("p", &listener, None);
        upstreams.flush().await;

        assert_eq!(proxy.read(), Variant::Float64(1.0));
    }

    #[tokio::test]
    async fn losing_an_upstream_falls_back_to_the_other() {
        let mut upstreams = Upstreams::new(&[(1.0, 0.8), (2.0, 0.8)]);
        let proxy = ProxyItem::new("p", &[spec("u1", 10), spec("u2", 5)], &upstreams.catalogue);
        let (recorder, listener) = Recorder::handle();
        proxy.attach("p", &listener, None);
        upstreams.flush().await;
        recorder.take();

        upstreams.registrations.remove(1).unregister();
        upstreams.flush().await;

        assert_eq!(proxy.read(), Variant::Float64(1.0));
        assert_eq!(
            proxy.upstream_states(),
            vec![SubscriptionState::Granted, SubscriptionState::Disconnected]
        );
        assert!(recorder.updates().contains(&Update::Value(Variant::Float64(1.0))));
        assert_eq!(upstreams.hives[1].manager().listener_count("src"), 0);
    }

    #[tokio::test]
    async fn without_upstreams_the_proxy_is_disconnected() {
        let upstreams = Upstreams::new(&[]);
        let proxy = ProxyItem::new("p", &[spec("missing", 0)], &upstreams.catalogue);
        let (recorder, listener) = Recorder::handle();

        proxy.attach("p", &listener, None);

        assert_eq!(recorder.updates(), vec![Update::State(SubscriptionState::Disconnected)]);
        let err = proxy.write(Variant::Int32(1), None).await.unwrap_err();
        assert!(matches!(err, CoreError::Resource { .. }));
    }

    #[test]
    fn concurrent_upstream_deliveries_are_all_applied() {
        let upstreams = Upstreams::new(&[]);
        let proxy = ProxyItem::new("p", &[spec("u1", 0)], &upstreams.catalogue);
        let current = proxy.listener(0, 0);

        std::thread::scope(|scope| {
            for t in 0..4 {
                let listener = current.clone();
                scope.spawn(move || {
                    for i in 0..50 {
                        listener.deliver(
                            "src",
                            Update::Attributes {
                                attributes: Attributes::new().with("n", t * 100 + i),
                                full: false,
                            },
                        );
                    }
                });
            }
        });
        assert_eq!(proxy.state.lock().upstreams[0].accepted, 200);

        proxy.listener(0, 7).deliver("src", Update::Value(Variant::Int32(1)));
        assert_eq!(proxy.state.lock().upstreams[0].accepted, 200);
        assert_eq!(proxy.state.lock().upstreams[0].value, Variant::Null);
    }

    #[tokio::test]
    async fn writes_go_to_the_winning_upstream() {
        let upstreams = Upstreams::new(&[(1.0, 0.8), (2.0, 0.9)]);
        let proxy = ProxyItem::new("p", &[spec("u1", 0), spec("u2", 0)], &upstreams.catalogue);
        let (_recorder, listener) = Recorder::handle();
        proxy.attach("p", &listener, None);
        upstreams.flush().await;

        proxy.write(Variant::Float64(7.0), Some("op")).await.unwrap();
        upstreams.flush().await;

        assert_eq!(upstreams.hives[1].item("src").unwrap().read(), Variant::Float64(7.0));
        assert_eq!(upstreams.hives[0].item("src").unwrap().read(), Variant::Float64(1.0));
        assert_eq!(proxy.read(), Variant::Float64(7.0));
    }

    #[tokio::test]
    async fn last_listener_unsubscribes_upstreams() {
        let upstreams = Upstreams::new(&[(1.0, 0.8)]);
        let proxy = ProxyItem::new("p", &[spec("u1", 0)], &upstreams.catalogue);
        let (_recorder, listener) = Recorder::handle();
        proxy.attach("p", &listener, None);
        upstreams.flush().await;
        assert_eq!(upstreams.hives[0].manager().listener_count("src"), 1);

        proxy.detach("p", &listener, false);
        upstreams.flush().await;

        assert_eq!(upstreams.hives[0].manager().listener_count("src"), 0);
        assert_eq!(proxy.current_state(), SubscriptionState::Disconnected);
        assert_eq!(proxy.read(), Variant::Null);
    }
}

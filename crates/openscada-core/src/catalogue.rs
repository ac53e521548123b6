// ── Service catalogue ──
//
// Typed registry of runtime services (remote connections, AE query
// sources, historical items, akn handlers). Components discover each
// other through it instead of holding direct references, and follow
// services that come and go through listeners and trackers.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::debug;

use crate::filter::Filter;

/// Property holding the id a service was registered under.
pub const PROP_SERVICE_ID: &str = "service.id";
/// Property ordering competing services; lower wins.
pub const PROP_SERVICE_RANKING: &str = "service.ranking";

/// A registered service.
pub struct ServiceEntry<T: ?Sized> {
    /// Registration order; unique per catalogue.
    pub registration: u64,
    pub id: String,
    pub properties: BTreeMap<String, String>,
    pub service: Arc<T>,
}

impl<T: ?Sized> ServiceEntry<T> {
    pub fn ranking(&self) -> i64 {
        self.properties
            .get(PROP_SERVICE_RANKING)
            .and_then(|r| r.trim().parse().ok())
            .unwrap_or(0)
    }
}

impl<T: ?Sized> Clone for ServiceEntry<T> {
    fn clone(&self) -> Self {
        Self {
            registration: self.registration,
            id: self.id.clone(),
            properties: self.properties.clone(),
            service: Arc::clone(&self.service),
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for ServiceEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("registration", &self.registration)
            .field("id", &self.id)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// Catalogue change delivered to listeners.
pub enum ServiceEvent<T: ?Sized> {
    Added(ServiceEntry<T>),
    Removed(ServiceEntry<T>),
}

type Callback<T> = Arc<dyn Fn(&ServiceEvent<T>) + Send + Sync>;

struct State<T: ?Sized> {
    next_registration: u64,
    next_listener: u64,
    entries: BTreeMap<u64, ServiceEntry<T>>,
    listeners: Vec<(u64, Callback<T>)>,
}

/// Registry of services of type `T`.
pub struct ServiceCatalogue<T: ?Sized> {
    state: Mutex<State<T>>,
    /// Serialises callbacks so listeners see events in catalogue order.
    dispatch: ReentrantMutex<()>,
}

impl<T: ?Sized + Send + Sync + 'static> ServiceCatalogue<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_registration: 1,
                next_listener: 1,
                entries: BTreeMap::new(),
                listeners: Vec::new(),
            }),
            dispatch: ReentrantMutex::new(()),
        })
    }

    /// Register `service` under `id`. The id is also stored as the
    /// `service.id` property.
    pub fn register(
        self: &Arc<Self>,
        id: impl Into<String>,
        mut properties: BTreeMap<String, String>,
        service: Arc<T>,
    ) -> Registration<T> {
        let id = id.into();
        properties.insert(PROP_SERVICE_ID.into(), id.clone());

        let _dispatch = self.dispatch.lock();
        let (entry, listeners) = {
            let mut state = self.state.lock();
            let registration = state.next_registration;
            state.next_registration += 1;
            let entry = ServiceEntry {
                registration,
                id,
                properties,
                service,
            };
            state.entries.insert(registration, entry.clone());
            (entry, callbacks(&state))
        };
        debug!(id = %entry.id, registration = entry.registration, "service registered");

        let registration = Registration {
            catalogue: Arc::downgrade(self),
            registration: entry.registration,
        };
        let event = ServiceEvent::Added(entry);
        for listener in listeners {
            listener(&event);
        }
        registration
    }

    fn unregister(&self, registration: u64) {
        let _dispatch = self.dispatch.lock();
        let (entry, listeners) = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.remove(&registration) else {
                return;
            };
            (entry, callbacks(&state))
        };
        debug!(id = %entry.id, registration, "service unregistered");

        let event = ServiceEvent::Removed(entry);
        for listener in listeners {
            listener(&event);
        }
    }

    /// Matching services, best first (lowest ranking, then earliest).
    pub fn lookup(&self, filter: Option<&Filter>) -> Vec<ServiceEntry<T>> {
        let mut found: Vec<ServiceEntry<T>> = self
            .state
            .lock()
            .entries
            .values()
            .filter(|e| filter.is_none_or(|f| f.matches(&e.properties)))
            .cloned()
            .collect();
        found.sort_by_key(|e| (e.ranking(), e.registration));
        found
    }

    /// Best service registered under `id`.
    pub fn get(&self, id: &str) -> Option<ServiceEntry<T>> {
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|e| e.id == id)
            .min_by_key(|e| (e.ranking(), e.registration))
            .cloned()
    }

    /// Add a listener. Current services are replayed to it as `Added`
    /// before any later change.
    pub fn add_listener(&self, listener: impl Fn(&ServiceEvent<T>) + Send + Sync + 'static) -> u64 {
        let listener: Callback<T> = Arc::new(listener);
        let _dispatch = self.dispatch.lock();
        let (id, existing) = {
            let mut state = self.state.lock();
            let id = state.next_listener;
            state.next_listener += 1;
            state.listeners.push((id, Arc::clone(&listener)));
            (id, state.entries.values().cloned().collect::<Vec<_>>())
        };
        for entry in existing {
            listener(&ServiceEvent::Added(entry));
        }
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.state.lock().listeners.retain(|(l, _)| *l != id);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

fn callbacks<T: ?Sized>(state: &State<T>) -> Vec<Callback<T>> {
    state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
}

/// Handle to a registered service.
pub struct Registration<T: ?Sized + Send + Sync + 'static> {
    catalogue: Weak<ServiceCatalogue<T>>,
    registration: u64,
}

impl<T: ?Sized + Send + Sync + 'static> Registration<T> {
    /// Remove the service. Listeners see `Removed`.
    pub fn unregister(self) {
        if let Some(catalogue) = self.catalogue.upgrade() {
            catalogue.unregister(self.registration);
        }
    }

    pub fn id(&self) -> u64 {
        self.registration
    }
}

// ── ServiceTracker ───────────────────────────────────────────────────

/// Follows the best service matching a filter and reports every change
/// of that choice, including to and from "none".
pub struct ServiceTracker<T: ?Sized + Send + Sync + 'static> {
    catalogue: Weak<ServiceCatalogue<T>>,
    listener: u64,
    current: Arc<Mutex<Option<ServiceEntry<T>>>>,
}

impl<T: ?Sized + Send + Sync + 'static> ServiceTracker<T> {
    pub fn open(
        catalogue: &Arc<ServiceCatalogue<T>>,
        filter: Filter,
        on_change: impl Fn(Option<ServiceEntry<T>>) + Send + Sync + 'static,
    ) -> Self {
        let current: Arc<Mutex<Option<ServiceEntry<T>>>> = Arc::new(Mutex::new(None));
        let weak = Arc::downgrade(catalogue);
        let tracked = Arc::clone(&current);

        let listener = catalogue.add_listener(move |event| {
            let entry = match event {
                ServiceEvent::Added(e) | ServiceEvent::Removed(e) => e,
            };
            if !filter.matches(&entry.properties) {
                return;
            }
            let Some(catalogue) = weak.upgrade() else {
                return;
            };
            let best = catalogue.lookup(Some(&filter)).into_iter().next();
            let changed = {
                let mut current = tracked.lock();
                let same = match (&*current, &best) {
                    (Some(a), Some(b)) => a.registration == b.registration,
                    (None, None) => true,
                    _ => false,
                };
                if !same {
                    current.clone_from(&best);
                }
                !same
            };
            if changed {
                on_change(best);
            }
        });

        Self {
            catalogue: Arc::downgrade(catalogue),
            listener,
            current,
        }
    }

    pub fn current(&self) -> Option<ServiceEntry<T>> {
        self.current.lock().clone()
    }

    /// Stop tracking. No further changes are reported.
    pub fn close(&self) {
        if let Some(catalogue) = self.catalogue.upgrade() {
            catalogue.remove_listener(self.listener);
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Drop for ServiceTracker<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> String;
    }

    struct Svc(&'static str);

    impl Named for Svc {
        fn name(&self) -> String {
            self.0.to_owned()
        }
    }

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn listeners_get_replay_then_changes() {
        let catalogue: Arc<ServiceCatalogue<dyn Named>> = ServiceCatalogue::new();
        let first = catalogue.register("a", BTreeMap::new(), Arc::new(Svc("a")));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        catalogue.add_listener(move |event| {
            let line = match event {
                ServiceEvent::Added(e) => format!("+{}", e.service.name()),
                ServiceEvent::Removed(e) => format!("-{}", e.service.name()),
            };
            log.lock().push(line);
        });

        let _second = catalogue.register("b", BTreeMap::new(), Arc::new(Svc("b")));
        first.unregister();

        assert_eq!(*seen.lock(), vec!["+a", "+b", "-a"]);
    }

    #[test]
    fn lookup_orders_by_ranking_then_age() {
        let catalogue: Arc<ServiceCatalogue<dyn Named>> = ServiceCatalogue::new();
        let _a = catalogue.register("x", props(&[("service.ranking", "5")]), Arc::new(Svc("a")));
        let _b = catalogue.register("x", props(&[("service.ranking", "1")]), Arc::new(Svc("b")));
        let _c = catalogue.register("y", BTreeMap::new(), Arc::new(Svc("c")));

        let names: Vec<String> = catalogue.lookup(None).iter().map(|e| e.service.name()).collect();
        assert_eq!(names, vec!["c", "b", "a"]);
        assert_eq!(catalogue.get("x").unwrap().service.name(), "b");

        let filter = Filter::parse("(service.id=x)").unwrap();
        assert_eq!(catalogue.lookup(Some(&filter)).len(), 2);
    }

    #[test]
    fn tracker_follows_the_best_match() {
        let catalogue: Arc<ServiceCatalogue<dyn Named>> = ServiceCatalogue::new();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&changes);
        let tracker = ServiceTracker::open(
            &catalogue,
            Filter::parse("(service.id=plc)").unwrap(),
            move |entry| log.lock().push(entry.map(|e| e.service.name())),
        );

        let low = catalogue.register("plc", props(&[("service.ranking", "10")]), Arc::new(Svc("low")));
        let high = catalogue.register("plc", props(&[("service.ranking", "1")]), Arc::new(Svc("high")));
        let _other = catalogue.register("db", BTreeMap::new(), Arc::new(Svc("db")));
        high.unregister();
        low.unregister();

        assert_eq!(
            *changes.lock(),
            vec![
                Some("low".to_owned()),
                Some("high".to_owned()),
                Some("low".to_owned()),
                None
            ]
        );
        assert!(tracker.current().is_none());
    }
}

// ── Proxy condition query ──
//
// A condition source merging the monitor sets of N upstream condition
// sources. Every monitor is owned by the upstream that reported it; an
// upstream that is rebound, drops to Disconnected or is (re)granted loses
// its monitors before new data arrives.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::catalogue::{PROP_SERVICE_ID, ServiceCatalogue, ServiceTracker};
use crate::filter::Filter;
use crate::model::{MonitorStatusInformation, SubscriptionState};
use crate::subscription::{Activation, Listener, ListenerHandle, MonitorCache, Source, SourceBase, Update};

struct Upstream {
    id: String,
    source: Option<Arc<dyn Source>>,
    listener: Option<ListenerHandle>,
    generation: u64,
    state: SubscriptionState,
}

struct State {
    upstreams: Vec<Upstream>,
    /// Monitor id to the index of the upstream owning it.
    owners: BTreeMap<String, usize>,
}

/// Condition source over several upstream condition sources.
pub struct ProxyMonitorQuery {
    id: String,
    me: Weak<ProxyMonitorQuery>,
    base: SourceBase<MonitorCache>,
    state: Mutex<State>,
    trackers: Mutex<Vec<ServiceTracker<dyn Source>>>,
}

impl ProxyMonitorQuery {
    /// Follow the condition sources registered under `upstreams` in
    /// `catalogue`.
    pub fn new(
        id: impl Into<String>,
        upstreams: &[String],
        catalogue: &Arc<ServiceCatalogue<dyn Source>>,
    ) -> Arc<Self> {
        let query = Arc::new_cyclic(|me| Self {
            id: id.into(),
            me: me.clone(),
            base: SourceBase::new(SubscriptionState::Disconnected, MonitorCache::default()),
            state: Mutex::new(State {
                upstreams: upstreams
                    .iter()
                    .map(|id| Upstream {
                        id: id.clone(),
                        source: None,
                        listener: None,
                        generation: 0,
                        state: SubscriptionState::Disconnected,
                    })
                    .collect(),
                owners: BTreeMap::new(),
            }),
            trackers: Mutex::new(Vec::new()),
        });

        let trackers = upstreams
            .iter()
            .enumerate()
            .map(|(index, upstream)| {
                let weak = Arc::downgrade(&query);
                ServiceTracker::open(
                    catalogue,
                    Filter::Equal(PROP_SERVICE_ID.into(), upstream.clone()),
                    move |entry| {
                        if let Some(query) = weak.upgrade() {
                            query.set_upstream(index, entry.map(|e| e.service));
                        }
                    },
                )
            })
            .collect();
        *query.trackers.lock() = trackers;
        query
    }

    /// Rebind upstream `index`. Its monitors are dropped first.
    pub fn set_upstream(&self, index: usize, source: Option<Arc<dyn Source>>) {
        let (old, new, key) = {
            let mut state = self.state.lock();
            let Some(upstream) = state.upstreams.get_mut(index) else {
                return;
            };
            upstream.generation += 1;
            let generation = upstream.generation;
            let old = upstream.source.take().zip(upstream.listener.take());
            upstream.state = SubscriptionState::Disconnected;
            upstream.listener = source.as_ref().map(|_| {
                ListenerHandle::new(Arc::new(UpstreamListener {
                    query: self.me.clone(),
                    index,
                    generation,
                }))
            });
            upstream.source.clone_from(&source);
            let new = upstream.source.clone().zip(upstream.listener.clone());
            let key = upstream.id.clone();
            debug!(query = %self.id, upstream = %key, bound = new.is_some(), "condition upstream rebound");

            self.clear_upstream(&mut state, index);
            self.merge_state(&state);
            (old, new, key)
        };

        if let Some((source, listener)) = old {
            source.detach(&key, &listener, false);
        }
        if let Some((source, listener)) = new {
            source.attach(&key, &listener, None);
        }
    }

    pub fn monitors(&self) -> Vec<MonitorStatusInformation> {
        self.base.with_cache(|c| c.monitors.values().cloned().collect())
    }

    fn on_upstream(&self, index: usize, generation: u64, update: Update) {
        let mut state = self.state.lock();
        let Some(upstream) = state.upstreams.get_mut(index) else {
            return;
        };
        if upstream.generation != generation {
            trace!(query = %self.id, index, "stale condition update dropped");
            return;
        }
        match update {
            Update::State(s) => {
                upstream.state = s;
                if matches!(s, SubscriptionState::Disconnected | SubscriptionState::Granted) {
                    self.clear_upstream(&mut state, index);
                }
                self.merge_state(&state);
            }
            Update::Monitors { changed, removed, full } => {
                if full {
                    self.clear_upstream(&mut state, index);
                }
                let mut dropped = Vec::new();
                for id in removed {
                    if state.owners.get(&id) == Some(&index) {
                        state.owners.remove(&id);
                        dropped.push(id);
                    }
                }
                for info in &changed {
                    state.owners.insert(info.id.clone(), index);
                }
                self.base.update_monitors(changed, &dropped);
            }
            Update::Value(_) | Update::Attributes { .. } | Update::Events(_) => {}
        }
    }

    /// Drop every monitor owned by upstream `index`.
    fn clear_upstream(&self, state: &mut State, index: usize) {
        let owned: Vec<String> = state
            .owners
            .iter()
            .filter(|(_, owner)| **owner == index)
            .map(|(id, _)| id.clone())
            .collect();
        if owned.is_empty() {
            return;
        }
        for id in &owned {
            state.owners.remove(id);
        }
        self.base.update_monitors(Vec::new(), &owned);
    }

    fn merge_state(&self, state: &State) {
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
        self.base.notify(merged);
    }
}

impl Activation for ProxyMonitorQuery {
    // Upstreams stay attached for as long as the query exists.
    fn permits_deactivation(&self) -> bool {
        false
    }
}

impl Source for ProxyMonitorQuery {
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

impl Drop for ProxyMonitorQuery {
    fn drop(&mut self) {
        for upstream in &mut self.state.get_mut().upstreams {
            if let (Some(source), Some(listener)) = (upstream.source.take(), upstream.listener.take()) {
                source.detach(&upstream.id, &listener, false);
            }
        }
    }
}

struct UpstreamListener {
    query: Weak<ProxyMonitorQuery>,
    index: usize,
    generation: u64,
}

impl Listener for UpstreamListener {
    fn deliver(&self, _key: &str, update: Update) {
        if let Some(query) = self.query.upgrade() {
            query.on_upstream(self.index, self.generation, update);
        }
    }
}

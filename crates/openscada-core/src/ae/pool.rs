// ── Event pool ──
//
// An event source keeping the most recent events for replay to new
// listeners. Accepted events are also handed to the storage, if any.

use std::sync::Arc;

use tracing::warn;

use super::storage::EventStorage;
use crate::filter::Filter;
use crate::model::{Event, SubscriptionState};
use crate::subscription::{EventCache, ListenerHandle, Source, SourceBase};

pub struct EventPool {
    id: String,
    base: SourceBase<EventCache>,
    filter: Option<Filter>,
    storage: Option<Arc<dyn EventStorage>>,
}

impl EventPool {
    /// A pool of `capacity` events accepting those matching `filter`.
    pub fn new(id: impl Into<String>, capacity: usize, filter: Option<Filter>) -> Arc<Self> {
        Self::build(id.into(), capacity, filter, None)
    }

    pub fn with_storage(
        id: impl Into<String>,
        capacity: usize,
        filter: Option<Filter>,
        storage: Arc<dyn EventStorage>,
    ) -> Arc<Self> {
        Self::build(id.into(), capacity, filter, Some(storage))
    }

    fn build(
        id: String,
        capacity: usize,
        filter: Option<Filter>,
        storage: Option<Arc<dyn EventStorage>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            base: SourceBase::new(SubscriptionState::Granted, EventCache::new(capacity)),
            filter,
            storage,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Offer `events`; those passing the filter are stored and delivered.
    pub fn push(&self, events: Vec<Event>) {
        let accepted: Vec<Event> = events
            .into_iter()
            .filter(|e| self.filter.as_ref().is_none_or(|f| f.matches(e)))
            .collect();
        if accepted.is_empty() {
            return;
        }
        if let Some(storage) = &self.storage {
            for event in &accepted {
                if let Err(e) = storage.store(event.clone()) {
                    warn!(pool = %self.id, event = %event.id, error = %e, "failed to store event");
                }
            }
        }
        self.base.push_events(accepted);
    }

    /// The pooled events, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.base.with_cache(|c| c.iter().cloned().collect())
    }
}

impl Source for EventPool {
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
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ae::MemoryEventStorage;
    use crate::subscription::Update;
    use crate::subscription::testing::Recorder;

    fn event(severity: &str) -> Event {
        Event::new("node-a").with_attribute("severity", severity)
    }

    #[test]
    fn new_listeners_get_the_pooled_events() {
        let pool = EventPool::new("all", 2, None);
        let events = vec![event("A"), event("B"), event("C")];
        pool.push(events.clone());
        assert_eq!(pool.events(), events[1..].to_vec());

        let (recorder, handle) = Recorder::handle();
        pool.attach("all", &handle, None);
        assert_eq!(
            recorder.take(),
            vec![
                Update::State(SubscriptionState::Granted),
                Update::Events(events[1..].to_vec()),
            ]
        );

        let next = event("D");
        pool.push(vec![next.clone()]);
        assert_eq!(recorder.take(), vec![Update::Events(vec![next])]);
    }

    #[test]
    fn filtered_events_are_dropped_before_storage() {
        let storage = Arc::new(MemoryEventStorage::new());
        let pool = EventPool::with_storage(
            "alarms",
            10,
            Some(Filter::parse("(severity=ALARM)").unwrap()),
            Arc::clone(&storage) as Arc<dyn EventStorage>,
        );
        pool.push(vec![event("ALARM"), event("INFO")]);
        assert_eq!(pool.events().len(), 1);
        assert_eq!(storage.len(), 1);
    }
}

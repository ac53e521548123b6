// ── Event storage ──

use std::collections::{HashSet, VecDeque};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::CoreError;
use crate::filter::Filter;
use crate::model::Event;

/// Persistent home of AE events.
pub trait EventStorage: Send + Sync {
    /// Store `event`. Storing an id twice keeps the first copy.
    fn store(&self, event: Event) -> Result<(), CoreError>;

    fn contains(&self, id: Uuid) -> Result<bool, CoreError>;

    /// Events matching `filter`, newest source timestamp first.
    fn query(&self, filter: Option<&Filter>) -> Result<Box<dyn EventCursor>, CoreError>;
}

/// Paged read over a query result.
pub trait EventCursor: Send {
    /// Up to `count` further events.
    fn next_batch(&mut self, count: usize) -> Result<Vec<Event>, CoreError>;

    /// Once `false`, stays `false`.
    fn has_more(&self) -> bool;
}

#[derive(Default)]
struct Stored {
    events: Vec<Event>,
    ids: HashSet<Uuid>,
}

/// Event storage held in memory.
#[derive(Default)]
pub struct MemoryEventStorage {
    stored: RwLock<Stored>,
}

impl MemoryEventStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stored.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stored.read().events.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<Event> {
        self.stored.read().events.iter().find(|e| e.id == id).cloned()
    }
}

impl EventStorage for MemoryEventStorage {
    fn store(&self, event: Event) -> Result<(), CoreError> {
        let mut stored = self.stored.write();
        if stored.ids.insert(event.id) {
            stored.events.push(event);
        }
        Ok(())
    }

    fn contains(&self, id: Uuid) -> Result<bool, CoreError> {
        Ok(self.stored.read().ids.contains(&id))
    }

    fn query(&self, filter: Option<&Filter>) -> Result<Box<dyn EventCursor>, CoreError> {
        let mut events: Vec<Event> = self
            .stored
            .read()
            .events
            .iter()
            .filter(|e| filter.is_none_or(|f| f.matches(*e)))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.source_timestamp.cmp(&a.source_timestamp));
        Ok(Box::new(MemoryCursor {
            events: events.into(),
        }))
    }
}

struct MemoryCursor {
    events: VecDeque<Event>,
}

impl EventCursor for MemoryCursor {
    fn next_batch(&mut self, count: usize) -> Result<Vec<Event>, CoreError> {
        let take = count.min(self.events.len());
        Ok(self.events.drain(..take).collect())
    }

    fn has_more(&self) -> bool {
        !self.events.is_empty()
    }
}

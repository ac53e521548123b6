// ── Listeners ──
//
// A listener receives the updates of every key it is subscribed to.
// Identity is per handle: two handles wrapping the same object are two
// listeners.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::executor::SerialExecutor;
use crate::model::{Attributes, Event, MonitorStatusInformation, SubscriptionState, Variant};

/// One delivery from a source to a listener.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    State(SubscriptionState),
    Value(Variant),
    /// `full` replaces the listener's map; otherwise Null values mark
    /// removed attributes.
    Attributes { attributes: Attributes, full: bool },
    /// `full` replaces the listener's monitor set.
    Monitors {
        changed: Vec<MonitorStatusInformation>,
        removed: Vec<String>,
        full: bool,
    },
    Events(Vec<Event>),
}

/// Receiver of subscription updates.
///
/// Called with source locks held: implementations must hand the update
/// off (to an executor or channel) and return. They must never call back
/// into the source that delivered.
pub trait Listener: Send + Sync {
    fn deliver(&self, key: &str, update: Update);
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// A listener with a stable identity.
#[derive(Clone)]
pub struct ListenerHandle {
    id: u64,
    inner: Arc<dyn Listener>,
}

impl ListenerHandle {
    pub fn new(listener: Arc<dyn Listener>) -> Self {
        Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            inner: listener,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver an update. A panicking listener is logged and otherwise
    /// ignored so it cannot disturb the source or other listeners.
    pub fn deliver(&self, key: &str, update: Update) {
        let result = catch_unwind(AssertUnwindSafe(|| self.inner.deliver(key, update)));
        if result.is_err() {
            warn!(key, listener = self.id, "listener panicked; delivery dropped");
        }
    }
}

impl PartialEq for ListenerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ListenerHandle {}

impl std::hash::Hash for ListenerHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ListenerHandle").field(&self.id).finish()
    }
}

// ── Deferred delivery ────────────────────────────────────────────────

/// Listener that re-delivers on a serial executor, moving the real
/// listener's work off the source's lock.
pub struct Deferred {
    executor: SerialExecutor,
    target: ListenerHandle,
}

impl Deferred {
    pub fn handle(executor: SerialExecutor, target: ListenerHandle) -> ListenerHandle {
        ListenerHandle::new(Arc::new(Self { executor, target }))
    }
}

impl Listener for Deferred {
    fn deliver(&self, key: &str, update: Update) {
        let target = self.target.clone();
        let key = key.to_owned();
        self.executor.submit(move || target.deliver(&key, update));
    }
}

// ── Test support ─────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::{Listener, ListenerHandle, Update};
    use std::sync::Arc;

    /// Records every delivery in order.
    #[derive(Default)]
    pub(crate) struct Recorder {
        seen: Mutex<Vec<(String, Update)>>,
    }

    impl Recorder {
        pub(crate) fn handle() -> (Arc<Self>, ListenerHandle) {
            let recorder = Arc::new(Self::default());
            let handle = ListenerHandle::new(Arc::clone(&recorder) as Arc<dyn Listener>);
            (recorder, handle)
        }

        pub(crate) fn updates(&self) -> Vec<Update> {
            self.seen.lock().iter().map(|(_, u)| u.clone()).collect()
        }

        pub(crate) fn take(&self) -> Vec<Update> {
            std::mem::take(&mut *self.seen.lock())
                .into_iter()
                .map(|(_, u)| u)
                .collect()
        }

        pub(crate) fn keys(&self) -> Vec<String> {
            self.seen.lock().iter().map(|(k, _)| k.clone()).collect()
        }
    }

    impl Listener for Recorder {
        fn deliver(&self, key: &str, update: Update) {
            self.seen.lock().push((key.to_owned(), update));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::testing::Recorder;
    use super::*;

    struct Panicking;

    impl Listener for Panicking {
        fn deliver(&self, _key: &str, _update: Update) {
            panic!("listener failure");
        }
    }

    #[test]
    fn handles_compare_by_identity() {
        let (recorder, a) = Recorder::handle();
        let b = ListenerHandle::new(recorder);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn panicking_listener_is_contained() {
        let handle = ListenerHandle::new(Arc::new(Panicking));
        handle.deliver("k", Update::State(SubscriptionState::Granted));
    }

    #[tokio::test]
    async fn deferred_delivers_in_order() {
        let executor = SerialExecutor::spawn("deferred-test");
        let (recorder, target) = Recorder::handle();
        let deferred = Deferred::handle(executor.clone(), target);

        for i in 0..5 {
            deferred.deliver("k", Update::Value(Variant::Int32(i)));
        }
        executor.flush().await;

        let expected: Vec<Update> = (0..5).map(|i| Update::Value(Variant::Int32(i))).collect();
        assert_eq!(recorder.updates(), expected);
    }
}

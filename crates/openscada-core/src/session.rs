// ── Sessions ──
//
// A session is one client's view of a service: its listener endpoints,
// the managers they are attached to, its open queries, and the push
// channel everything is delivered through. Deliveries go through the
// session's serial executor so the client sees them in order.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures_core::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::browser::BrowserEntry;
use crate::error::CoreError;
use crate::executor::SerialExecutor;
use crate::hd::QueryUpdate;
use crate::subscription::{Listener, ListenerHandle, SubscriptionManager, Update};

// ── Push messages ────────────────────────────────────────────────────

/// Which service endpoint a subscription delivery belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ListenerKind {
    /// DA item values.
    Item,
    /// AE condition queries.
    Condition,
    /// AE event queries.
    Event,
}

/// Everything a service pushes to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    Subscription {
        kind: ListenerKind,
        key: String,
        update: Update,
    },
    /// `full` replaces the client's entry list.
    Browser {
        added: Vec<BrowserEntry>,
        removed: Vec<String>,
        full: bool,
    },
    Query { query_id: u64, update: QueryUpdate },
}

/// Something owned by a session and released with it.
pub trait Disposable: Send + Sync {
    fn dispose(&self);
}

// ── Session ──────────────────────────────────────────────────────────

/// One client session of a service.
pub struct Session {
    id: Uuid,
    user: Option<String>,
    properties: BTreeMap<String, String>,
    disposed: AtomicBool,
    executor: SerialExecutor,
    push: mpsc::UnboundedSender<Push>,
    endpoints: Mutex<HashMap<ListenerKind, ListenerHandle>>,
    managers: Mutex<Vec<(ListenerKind, Arc<SubscriptionManager>)>>,
    queries: Mutex<BTreeMap<u64, Arc<dyn Disposable>>>,
}

impl Session {
    pub fn new(user: Option<String>, properties: BTreeMap<String, String>) -> (Arc<Self>, PushStream) {
        let id = Uuid::new_v4();
        let (push, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            user,
            properties,
            disposed: AtomicBool::new(false),
            executor: SerialExecutor::spawn(format!("session-{id}")),
            push,
            endpoints: Mutex::new(HashMap::new()),
            managers: Mutex::new(Vec::new()),
            queries: Mutex::new(BTreeMap::new()),
        });
        (session, PushStream::new(rx))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The opaque user identity given at creation.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn executor(&self) -> &SerialExecutor {
        &self.executor
    }

    /// The session's listener for `kind`. Always the same handle.
    pub fn endpoint(&self, kind: ListenerKind) -> ListenerHandle {
        self.endpoints
            .lock()
            .entry(kind)
            .or_insert_with(|| {
                ListenerHandle::new(Arc::new(Endpoint {
                    kind,
                    executor: self.executor.clone(),
                    push: self.push.clone(),
                }))
            })
            .clone()
    }

    /// Record that the `kind` endpoint may be attached to `manager`, and
    /// return the endpoint.
    pub fn bind(&self, kind: ListenerKind, manager: &Arc<SubscriptionManager>) -> ListenerHandle {
        {
            let mut managers = self.managers.lock();
            if !managers
                .iter()
                .any(|(k, m)| *k == kind && Arc::ptr_eq(m, manager))
            {
                managers.push((kind, Arc::clone(manager)));
            }
        }
        self.endpoint(kind)
    }

    /// Queue a push on the session executor.
    pub fn push(&self, push: Push) {
        let tx = self.push.clone();
        self.executor.submit(move || {
            let _ = tx.send(push);
        });
    }

    /// Hand a query to the session. A disposed session disposes it
    /// straight away and reports `InvalidSession`.
    pub fn track_query(&self, id: u64, query: Arc<dyn Disposable>) -> Result<(), CoreError> {
        {
            let mut queries = self.queries.lock();
            if !self.is_disposed() {
                queries.insert(id, query);
                return Ok(());
            }
        }
        query.dispose();
        Err(CoreError::InvalidSession)
    }

    pub fn untrack_query(&self, id: u64) -> Option<Arc<dyn Disposable>> {
        self.queries.lock().remove(&id)
    }

    pub fn has_query(&self, id: u64) -> bool {
        self.queries.lock().contains_key(&id)
    }

    /// Release everything the session holds. Idempotent.
    pub fn dispose(&self) {
        // Taking the query lock orders this against `track_query`.
        let queries = {
            let mut queries = self.queries.lock();
            if self.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *queries)
        };
        self.executor.dispose();

        let managers = std::mem::take(&mut *self.managers.lock());
        for (kind, manager) in managers {
            manager.unsubscribe_all(&self.endpoint(kind));
        }
        for query in queries.into_values() {
            query.dispose();
        }
        debug!(session = %self.id, "session disposed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Listener endpoint of a session.
struct Endpoint {
    kind: ListenerKind,
    executor: SerialExecutor,
    push: mpsc::UnboundedSender<Push>,
}

impl Listener for Endpoint {
    fn deliver(&self, key: &str, update: Update) {
        let push = Push::Subscription {
            kind: self.kind,
            key: key.to_owned(),
            update,
        };
        let tx = self.push.clone();
        self.executor.submit(move || {
            let _ = tx.send(push);
        });
    }
}

// ── PushStream ───────────────────────────────────────────────────────

/// The client side of a session's push channel.
pub struct PushStream {
    inner: UnboundedReceiverStream<Push>,
}

impl PushStream {
    fn new(rx: mpsc::UnboundedReceiver<Push>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    fn receiver(&mut self) -> &mut mpsc::UnboundedReceiver<Push> {
        self.inner.as_mut()
    }

    /// Next push, or `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<Push> {
        self.receiver().recv().await
    }

    /// Next push if one is already queued.
    pub fn try_recv(&mut self) -> Option<Push> {
        self.receiver().try_recv().ok()
    }
}

impl Stream for PushStream {
    type Item = Push;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

// ── SessionRegistry ──────────────────────────────────────────────────

/// The live sessions of one service.
pub struct SessionRegistry {
    service: String,
    sessions: DashMap<Uuid, Arc<Session>>,
    running: AtomicBool,
    max_sessions: Option<usize>,
}

impl SessionRegistry {
    pub fn new(service: impl Into<String>, max_sessions: Option<usize>) -> Self {
        Self {
            service: service.into(),
            sessions: DashMap::new(),
            running: AtomicBool::new(true),
            max_sessions,
        }
    }

    pub fn create(
        &self,
        user: Option<String>,
        properties: BTreeMap<String, String>,
    ) -> Result<(Arc<Session>, PushStream), CoreError> {
        if !self.is_running() {
            return Err(CoreError::UnableToCreateSession {
                reason: format!("{} service is stopped", self.service),
            });
        }
        if let Some(max) = self.max_sessions {
            if self.sessions.len() >= max {
                return Err(CoreError::UnableToCreateSession {
                    reason: format!("{} service is at its limit of {max} sessions", self.service),
                });
            }
        }

        let (session, stream) = Session::new(user, properties);
        self.sessions.insert(session.id(), Arc::clone(&session));
        info!(
            service = %self.service,
            session = %session.id(),
            user = session.user().unwrap_or("-"),
            "session created"
        );
        Ok((session, stream))
    }

    /// Look up a live session.
    pub fn get(&self, id: Uuid) -> Result<Arc<Session>, CoreError> {
        self.sessions
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .filter(|s| !s.is_disposed())
            .ok_or(CoreError::InvalidSession)
    }

    /// Remove and dispose a session.
    pub fn close(&self, id: Uuid) -> Result<Arc<Session>, CoreError> {
        let (_, session) = self.sessions.remove(&id).ok_or(CoreError::InvalidSession)?;
        session.dispose();
        info!(service = %self.service, session = %id, "session closed");
        Ok(session)
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Refuse new sessions and close the existing ones.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let ids: Vec<Uuid> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            let _ = self.close(id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::model::{SubscriptionState, Variant};
    use crate::subscription::{ItemCache, SourceBase};

    struct CountingQuery(AtomicUsize);

    impl Disposable for CountingQuery {
        fn dispose(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn deliveries_reach_the_push_stream_in_order() {
        let (session, mut stream) = Session::new(Some("operator".into()), BTreeMap::new());
        let manager = Arc::new(SubscriptionManager::new("da"));
        let source = Arc::new(SourceBase::new(SubscriptionState::Granted, ItemCache::default()));
        manager.set_source("s1", Some(source.clone()));

        let endpoint = session.bind(ListenerKind::Item, &manager);
        manager.subscribe("s1", &endpoint).unwrap();
        source.publish(Some(Variant::Int32(1)), None, crate::model::AttributeMode::Update);
        session.executor().flush().await;

        let mut kinds = Vec::new();
        while let Some(Push::Subscription { update, .. }) = stream.try_recv() {
            kinds.push(update);
        }
        assert_eq!(kinds[0], Update::State(SubscriptionState::Granted));
        assert_eq!(kinds.last(), Some(&Update::Value(Variant::Int32(1))));
    }

    #[tokio::test]
    async fn dispose_unsubscribes_and_releases_queries() {
        let (session, _stream) = Session::new(None, BTreeMap::new());
        let manager = Arc::new(SubscriptionManager::new("da"));
        let endpoint = session.bind(ListenerKind::Item, &manager);
        manager.subscribe("a", &endpoint).unwrap();
        let query = Arc::new(CountingQuery(AtomicUsize::new(0)));
        session.track_query(1, query.clone()).unwrap();

        session.dispose();
        session.dispose();

        assert!(manager.is_empty());
        assert_eq!(query.0.load(Ordering::SeqCst), 1);
        assert!(matches!(
            session.track_query(2, query.clone()),
            Err(CoreError::InvalidSession)
        ));
        assert_eq!(query.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn registry_enforces_capacity_and_running_state() {
        let registry = SessionRegistry::new("da", Some(1));
        let (session, _s) = registry.create(None, BTreeMap::new()).unwrap();
        assert!(matches!(
            registry.create(None, BTreeMap::new()),
            Err(CoreError::UnableToCreateSession { .. })
        ));

        registry.close(session.id()).unwrap();
        assert!(matches!(registry.get(session.id()), Err(CoreError::InvalidSession)));
        assert!(matches!(registry.close(session.id()), Err(CoreError::InvalidSession)));

        registry.stop();
        assert!(registry.create(None, BTreeMap::new()).is_err());
        registry.start();
        assert!(registry.create(None, BTreeMap::new()).is_ok());
    }
}

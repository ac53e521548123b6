// ── AE service ──
//
// Condition and event queries are sources bound into two subscription
// managers as they appear in their catalogues. Event history is read
// through cursors owned by the session that opened them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::monitor::AknHandler;
use super::storage::{EventCursor, EventStorage};
use crate::browser::{BrowserCache, BrowserEntry};
use crate::catalogue::{ServiceCatalogue, ServiceEvent};
use crate::config::ServiceSettings;
use crate::error::CoreError;
use crate::filter::Filter;
use crate::model::Event;
use crate::session::{Disposable, ListenerKind, PushStream, Session, SessionRegistry};
use crate::subscription::{Source, SubscriptionManager};

/// Browser attribute naming the kind of an AE query.
pub const QUERY_TYPE_ATTRIBUTE: &str = "type";

struct OpenCursor {
    session: Uuid,
    cursor: Arc<Mutex<Box<dyn EventCursor>>>,
    timer: CancellationToken,
}

type Tracked = (Weak<ServiceCatalogue<dyn Source>>, u64);

/// An Alarms & Events service.
pub struct AeService {
    me: Weak<AeService>,
    sessions: Arc<SessionRegistry>,
    conditions: Arc<SubscriptionManager>,
    events: Arc<SubscriptionManager>,
    browser: BrowserCache,
    storage: Arc<dyn EventStorage>,
    akn_handlers: Arc<ServiceCatalogue<dyn AknHandler>>,
    cursors: DashMap<u64, OpenCursor>,
    next_query: AtomicU64,
    query_timeout: Duration,
    tracked: Mutex<Vec<Tracked>>,
}

impl AeService {
    pub fn new(
        settings: &ServiceSettings,
        storage: Arc<dyn EventStorage>,
        akn_handlers: Arc<ServiceCatalogue<dyn AknHandler>>,
    ) -> Arc<Self> {
        let sessions = Arc::new(SessionRegistry::new("ae", settings.max_sessions));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            browser: BrowserCache::new(Arc::clone(&sessions)),
            sessions,
            conditions: Arc::new(SubscriptionManager::new("ae-conditions")),
            events: Arc::new(SubscriptionManager::new("ae-events")),
            storage,
            akn_handlers,
            cursors: DashMap::new(),
            next_query: AtomicU64::new(1),
            query_timeout: settings.query_timeout,
            tracked: Mutex::new(Vec::new()),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn conditions(&self) -> &Arc<SubscriptionManager> {
        &self.conditions
    }

    pub fn events(&self) -> &Arc<SubscriptionManager> {
        &self.events
    }

    // ── Query sources ────────────────────────────────────────────────

    /// Bind every condition source of `catalogue` under its id.
    pub fn track_conditions(&self, catalogue: &Arc<ServiceCatalogue<dyn Source>>) {
        self.track(catalogue, ListenerKind::Condition);
    }

    /// Bind every event source of `catalogue` under its id.
    pub fn track_events(&self, catalogue: &Arc<ServiceCatalogue<dyn Source>>) {
        self.track(catalogue, ListenerKind::Event);
    }

    fn track(&self, catalogue: &Arc<ServiceCatalogue<dyn Source>>, kind: ListenerKind) {
        let me = self.me.clone();
        let listener = catalogue.add_listener(move |event| {
            let Some(service) = me.upgrade() else {
                return;
            };
            let manager = service.manager(kind);
            match event {
                ServiceEvent::Added(entry) => {
                    info!(query = %entry.id, %kind, "query added");
                    manager.set_source(&entry.id, Some(Arc::clone(&entry.service)));
                    let mut browser = BrowserEntry::new(&entry.id);
                    browser
                        .attributes
                        .insert(QUERY_TYPE_ATTRIBUTE, kind.to_string());
                    service.browser.add(browser);
                }
                ServiceEvent::Removed(entry) => {
                    info!(query = %entry.id, %kind, "query removed");
                    manager.set_source(&entry.id, None);
                    service.browser.remove(&entry.id);
                }
            }
        });
        self.tracked.lock().push((Arc::downgrade(catalogue), listener));
    }

    fn manager(&self, kind: ListenerKind) -> &Arc<SubscriptionManager> {
        if kind == ListenerKind::Event {
            &self.events
        } else {
            &self.conditions
        }
    }

    // ── Sessions ─────────────────────────────────────────────────────

    pub fn create_session(
        &self,
        user: Option<String>,
        properties: BTreeMap<String, String>,
    ) -> Result<(Arc<Session>, PushStream), CoreError> {
        let (session, stream) = self.sessions.create(user, properties)?;
        self.browser.attach(&session);
        Ok((session, stream))
    }

    /// Close a session: its subscriptions end and its cursors close.
    pub fn close_session(&self, session: Uuid) -> Result<(), CoreError> {
        self.sessions.close(session).map(|_| ())
    }

    pub fn browse(&self, session: Uuid) -> Result<Vec<BrowserEntry>, CoreError> {
        self.sessions.get(session)?;
        Ok(self.browser.entries())
    }

    // ── Subscriptions ────────────────────────────────────────────────

    pub fn subscribe_conditions(&self, session: Uuid, query: &str) -> Result<(), CoreError> {
        self.subscribe(session, query, ListenerKind::Condition)
    }

    pub fn unsubscribe_conditions(&self, session: Uuid, query: &str) -> Result<(), CoreError> {
        self.unsubscribe(session, query, ListenerKind::Condition)
    }

    pub fn subscribe_events(&self, session: Uuid, query: &str) -> Result<(), CoreError> {
        self.subscribe(session, query, ListenerKind::Event)
    }

    pub fn unsubscribe_events(&self, session: Uuid, query: &str) -> Result<(), CoreError> {
        self.unsubscribe(session, query, ListenerKind::Event)
    }

    fn subscribe(&self, session: Uuid, query: &str, kind: ListenerKind) -> Result<(), CoreError> {
        let session = self.sessions.get(session)?;
        let manager = self.manager(kind);
        let endpoint = session.bind(kind, manager);
        manager.subscribe(query, &endpoint).map_err(|e| {
            warn!(query, %kind, error = %e, "failed to subscribe");
            e.into_unknown_query(query)
        })
    }

    fn unsubscribe(&self, session: Uuid, query: &str, kind: ListenerKind) -> Result<(), CoreError> {
        let session = self.sessions.get(session)?;
        self.manager(kind).unsubscribe(query, &session.endpoint(kind));
        Ok(())
    }

    // ── Acknowledge ──────────────────────────────────────────────────

    /// Acknowledge `monitor` as the session's user. The first handler
    /// owning the monitor takes it.
    pub fn acknowledge(
        &self,
        session: Uuid,
        monitor: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let session = self.sessions.get(session)?;
        let user = session.user();
        let handled = self
            .akn_handlers
            .lookup(None)
            .iter()
            .any(|entry| entry.service.acknowledge(monitor, user, timestamp));
        if !handled {
            debug!(monitor, "no handler owns monitor");
        }
        Ok(())
    }

    // ── Event queries ────────────────────────────────────────────────

    /// Open a cursor over stored events. An empty filter matches all.
    pub fn create_query(&self, session: Uuid, filter: &str) -> Result<u64, CoreError> {
        let session = self.sessions.get(session)?;
        let parsed = if filter.trim().is_empty() {
            None
        } else {
            Some(Filter::parse(filter).map_err(|e| e.into_unknown_query(filter))?)
        };
        let cursor = self.storage.query(parsed.as_ref())?;

        let id = self.next_query.fetch_add(1, Ordering::Relaxed);
        let timer = CancellationToken::new();
        self.cursors.insert(
            id,
            OpenCursor {
                session: session.id(),
                cursor: Arc::new(Mutex::new(cursor)),
                timer: timer.clone(),
            },
        );
        let closer = Arc::new(CursorCloser {
            service: self.me.clone(),
            query: id,
        });
        if let Err(e) = session.track_query(id, closer) {
            self.drop_cursor(id);
            return Err(e);
        }
        self.schedule_close(id, timer);

        info!(session = %session.id(), query = id, filter, "event query opened");
        Ok(id)
    }

    /// Read up to `count` further events. The read runs on the blocking
    /// pool.
    pub async fn get_next(&self, session: Uuid, query: u64, count: usize) -> Result<Vec<Event>, CoreError> {
        let cursor = self.owned_cursor(session, query)?;
        tokio::task::spawn_blocking(move || cursor.lock().next_batch(count))
            .await
            .map_err(|e| CoreError::Internal(format!("event query read: {e}")))?
    }

    pub fn has_more(&self, session: Uuid, query: u64) -> Result<bool, CoreError> {
        let cursor = self.owned_cursor(session, query)?;
        let more = cursor.lock().has_more();
        Ok(more)
    }

    pub fn dispose_query(&self, session: Uuid, query: u64) -> Result<(), CoreError> {
        self.owned_cursor(session, query)?;
        if let Ok(session) = self.sessions.get(session) {
            session.untrack_query(query);
        }
        self.drop_cursor(query);
        Ok(())
    }

    pub fn query_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn start(&self) {
        self.sessions.start();
    }

    pub fn stop(&self) {
        self.sessions.stop();
    }

    fn owned_cursor(
        &self,
        session: Uuid,
        query: u64,
    ) -> Result<Arc<Mutex<Box<dyn EventCursor>>>, CoreError> {
        self.sessions.get(session)?;
        self.cursors
            .get(&query)
            .filter(|c| c.session == session)
            .map(|c| Arc::clone(&c.cursor))
            .ok_or(CoreError::ResultClosed)
    }

    fn schedule_close(&self, id: u64, timer: CancellationToken) {
        let me = self.me.clone();
        let timeout = self.query_timeout;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = timer.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    if let Some(service) = me.upgrade() {
                        service.expire(id);
                    }
                }
            }
        });
    }

    fn expire(&self, id: u64) {
        let Some(session) = self.cursors.get(&id).map(|c| c.session) else {
            return;
        };
        info!(query = id, "event query timed out");
        if let Ok(session) = self.sessions.get(session) {
            session.untrack_query(id);
        }
        self.drop_cursor(id);
    }

    fn drop_cursor(&self, id: u64) {
        if let Some((_, open)) = self.cursors.remove(&id) {
            open.timer.cancel();
            debug!(query = id, "event query closed");
        }
    }
}

impl Drop for AeService {
    fn drop(&mut self) {
        for (catalogue, listener) in self.tracked.get_mut().drain(..) {
            if let Some(catalogue) = catalogue.upgrade() {
                catalogue.remove_listener(listener);
            }
        }
    }
}

struct CursorCloser {
    service: Weak<AeService>,
    query: u64,
}

impl Disposable for CursorCloser {
    fn dispose(&self) {
        if let Some(service) = self.service.upgrade() {
            service.drop_cursor(self.query);
        }
    }
}

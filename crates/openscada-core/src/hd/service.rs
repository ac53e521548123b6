// ── HD service ──
//
// Serves historical items to sessions. Every query is owned by the
// session that opened it and carries a close timer; closing the session,
// closing the query or the timer firing all end up in `drop_query`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::{HistoricalItem, HistoricalQuery, QueryListener, QueryUpdate};
use crate::browser::{BrowserCache, BrowserEntry};
use crate::catalogue::{ServiceCatalogue, ServiceEvent};
use crate::config::ServiceSettings;
use crate::error::CoreError;
use crate::model::QueryParameters;
use crate::session::{Disposable, Push, PushStream, Session, SessionRegistry};

struct OpenQuery {
    session: Uuid,
    query: Arc<dyn HistoricalQuery>,
    timer: CancellationToken,
}

/// A Historical Data service.
pub struct HdService {
    me: Weak<HdService>,
    sessions: Arc<SessionRegistry>,
    items: DashMap<String, Arc<dyn HistoricalItem>>,
    browser: BrowserCache,
    queries: DashMap<u64, OpenQuery>,
    next_query: AtomicU64,
    query_timeout: Duration,
    tracked: Mutex<Option<(Weak<ServiceCatalogue<dyn HistoricalItem>>, u64)>>,
}

impl HdService {
    pub fn new(settings: &ServiceSettings) -> Arc<Self> {
        let sessions = Arc::new(SessionRegistry::new("hd", settings.max_sessions));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            browser: BrowserCache::new(Arc::clone(&sessions)),
            sessions,
            items: DashMap::new(),
            queries: DashMap::new(),
            next_query: AtomicU64::new(1),
            query_timeout: settings.query_timeout,
            tracked: Mutex::new(None),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    // ── Items ────────────────────────────────────────────────────────

    pub fn register_item(&self, item: Arc<dyn HistoricalItem>) {
        let id = item.id().to_owned();
        self.browser.add(item.information());
        self.items.insert(id.clone(), item);
        debug!(item = %id, "historical item registered");
    }

    /// Stop serving `id`. Open queries keep running until closed.
    pub fn unregister_item(&self, id: &str) -> Option<Arc<dyn HistoricalItem>> {
        let (_, item) = self.items.remove(id)?;
        self.browser.remove(id);
        debug!(item = %id, "historical item unregistered");
        Some(item)
    }

    /// Serve every item registered in `catalogue`, following later
    /// changes.
    pub fn track(&self, catalogue: &Arc<ServiceCatalogue<dyn HistoricalItem>>) {
        let me = self.me.clone();
        let listener = catalogue.add_listener(move |event| {
            let Some(service) = me.upgrade() else {
                return;
            };
            match event {
                ServiceEvent::Added(entry) => service.register_item(Arc::clone(&entry.service)),
                ServiceEvent::Removed(entry) => {
                    service.unregister_item(entry.service.id());
                }
            }
        });
        let previous = self
            .tracked
            .lock()
            .replace((Arc::downgrade(catalogue), listener));
        if let Some((catalogue, listener)) = previous {
            if let Some(catalogue) = catalogue.upgrade() {
                catalogue.remove_listener(listener);
            }
        }
    }

    pub fn item_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.items.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
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

    /// Close a session and every query it opened.
    pub fn close_session(&self, session: Uuid) -> Result<(), CoreError> {
        self.sessions.close(session).map(|_| ())
    }

    pub fn browse(&self, session: Uuid) -> Result<Vec<BrowserEntry>, CoreError> {
        self.sessions.get(session)?;
        Ok(self.browser.entries())
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Open a query on `item`. Its updates are pushed to the session as
    /// `Push::Query` under the returned id.
    pub fn create_query(
        &self,
        session: Uuid,
        item: &str,
        parameters: QueryParameters,
        update_data: bool,
    ) -> Result<u64, CoreError> {
        let session = self.sessions.get(session)?;
        let target = self
            .items
            .get(item)
            .map(|i| Arc::clone(i.value()))
            .ok_or_else(|| CoreError::unknown_query(item))?;
        parameters.validate()?;

        let id = self.next_query.fetch_add(1, Ordering::Relaxed);
        let listener = Arc::new(SessionQueryListener {
            session: Arc::downgrade(&session),
            query: id,
        });
        let query = target.create_query(parameters, listener, update_data)?;

        let timer = CancellationToken::new();
        self.queries.insert(
            id,
            OpenQuery {
                session: session.id(),
                query,
                timer: timer.clone(),
            },
        );
        session.track_query(
            id,
            Arc::new(QueryCloser {
                service: self.me.clone(),
                query: id,
            }),
        )?;
        self.schedule_close(id, timer);

        info!(session = %session.id(), item, query = id, "historical query opened");
        Ok(id)
    }

    pub fn change_parameters(
        &self,
        session: Uuid,
        query: u64,
        parameters: QueryParameters,
    ) -> Result<(), CoreError> {
        let target = self.owned_query(session, query)?;
        target.change_parameters(parameters)
    }

    pub fn close_query(&self, session: Uuid, query: u64) -> Result<(), CoreError> {
        self.owned_query(session, query)?;
        if let Ok(session) = self.sessions.get(session) {
            session.untrack_query(query);
        }
        self.drop_query(query);
        Ok(())
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn start(&self) {
        self.sessions.start();
    }

    pub fn stop(&self) {
        self.sessions.stop();
    }

    fn owned_query(&self, session: Uuid, query: u64) -> Result<Arc<dyn HistoricalQuery>, CoreError> {
        self.sessions.get(session)?;
        self.queries
            .get(&query)
            .filter(|q| q.session == session)
            .map(|q| Arc::clone(&q.query))
            .ok_or_else(|| CoreError::unknown_query(format!("query {query}")))
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
        let Some(session) = self.queries.get(&id).map(|q| q.session) else {
            return;
        };
        info!(query = id, "historical query timed out");
        if let Ok(session) = self.sessions.get(session) {
            session.untrack_query(id);
        }
        self.drop_query(id);
    }

    fn drop_query(&self, id: u64) {
        if let Some((_, open)) = self.queries.remove(&id) {
            open.timer.cancel();
            open.query.close();
            debug!(query = id, "historical query closed");
        }
    }
}

impl Drop for HdService {
    fn drop(&mut self) {
        if let Some((catalogue, listener)) = self.tracked.get_mut().take() {
            if let Some(catalogue) = catalogue.upgrade() {
                catalogue.remove_listener(listener);
            }
        }
    }
}

/// Session-owned handle closing a query when the session goes away.
struct QueryCloser {
    service: Weak<HdService>,
    query: u64,
}

impl Disposable for QueryCloser {
    fn dispose(&self) {
        if let Some(service) = self.service.upgrade() {
            service.drop_query(self.query);
        }
    }
}

struct SessionQueryListener {
    session: Weak<Session>,
    query: u64,
}

impl QueryListener for SessionQueryListener {
    fn update(&self, update: QueryUpdate) {
        if let Some(session) = self.session.upgrade() {
            session.push(Push::Query {
                query_id: self.query,
                update,
            });
        }
    }
}

// ── DA hive ──
//
// Serves a set of data items to client sessions. Items are bound into the
// hive's subscription manager under their id; sessions subscribe through
// their item endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::item::DataItem;
use crate::browser::{BrowserCache, BrowserEntry};
use crate::config::ServiceSettings;
use crate::error::CoreError;
use crate::model::Variant;
use crate::session::{ListenerKind, PushStream, Session, SessionRegistry};
use crate::subscription::{Source, SubscriptionManager};

/// A Data Access service.
pub struct DaHive {
    sessions: Arc<SessionRegistry>,
    manager: Arc<SubscriptionManager>,
    items: DashMap<String, Arc<dyn DataItem>>,
    browser: BrowserCache,
}

impl DaHive {
    pub fn new(settings: &ServiceSettings) -> Arc<Self> {
        let sessions = Arc::new(SessionRegistry::new("da", settings.max_sessions));
        Arc::new(Self {
            browser: BrowserCache::new(Arc::clone(&sessions)),
            sessions,
            manager: Arc::new(SubscriptionManager::new("da-items")),
            items: DashMap::new(),
        })
    }

    pub fn manager(&self) -> &Arc<SubscriptionManager> {
        &self.manager
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    // ── Items ────────────────────────────────────────────────────────

    /// Serve `item`, replacing an item with the same id.
    pub fn register_item(&self, item: Arc<dyn DataItem>) {
        let id = item.id().to_owned();
        let entry = item.information();
        self.items.insert(id.clone(), Arc::clone(&item));
        let source: Arc<dyn Source> = item;
        self.manager.set_source(&id, Some(source));
        self.browser.add(entry);
        debug!(item = %id, "item registered");
    }

    pub fn unregister_item(&self, id: &str) -> Option<Arc<dyn DataItem>> {
        let (_, item) = self.items.remove(id)?;
        self.manager.set_source(id, None);
        self.browser.remove(id);
        debug!(item = %id, "item unregistered");
        Some(item)
    }

    pub fn item(&self, id: &str) -> Option<Arc<dyn DataItem>> {
        self.items.get(id).map(|i| Arc::clone(i.value()))
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

    pub fn close_session(&self, session: Uuid) -> Result<(), CoreError> {
        self.sessions.close(session).map(|_| ())
    }

    pub fn subscribe_item(&self, session: Uuid, item: &str) -> Result<(), CoreError> {
        let session = self.sessions.get(session)?;
        let endpoint = session.bind(ListenerKind::Item, &self.manager);
        self.manager
            .subscribe(item, &endpoint)
            .map_err(|e| e.into_unknown_query(item))
    }

    pub fn unsubscribe_item(&self, session: Uuid, item: &str) -> Result<(), CoreError> {
        let session = self.sessions.get(session)?;
        self.manager
            .unsubscribe(item, &session.endpoint(ListenerKind::Item));
        Ok(())
    }

    pub fn read(&self, session: Uuid, item: &str) -> Result<Variant, CoreError> {
        self.sessions.get(session)?;
        self.item(item)
            .map(|i| i.read())
            .ok_or_else(|| CoreError::unknown_query(item))
    }

    /// Write on behalf of the session's user.
    pub async fn write(&self, session: Uuid, item: &str, value: Variant) -> Result<(), CoreError> {
        let session = self.sessions.get(session)?;
        self.write_item(item, value, session.user()).await
    }

    /// Write on behalf of `user`, for a session relaying another
    /// client's write.
    pub async fn write_as(
        &self,
        session: Uuid,
        item: &str,
        value: Variant,
        user: &str,
    ) -> Result<(), CoreError> {
        self.sessions.get(session)?;
        self.write_item(item, value, Some(user)).await
    }

    /// Write without a session, as proxies and local tools do.
    pub async fn write_item(
        &self,
        item: &str,
        value: Variant,
        user: Option<&str>,
    ) -> Result<(), CoreError> {
        let target = self.item(item).ok_or_else(|| CoreError::unknown_query(item))?;
        target.write(value, user).await
    }

    pub fn browse(&self, session: Uuid) -> Result<Vec<BrowserEntry>, CoreError> {
        self.sessions.get(session)?;
        Ok(self.browser.entries())
    }

    pub fn start(&self) {
        self.sessions.start();
        info!(items = self.items.len(), "DA hive started");
    }

    /// Close every session and refuse new ones.
    pub fn stop(&self) {
        self.sessions.stop();
        info!("DA hive stopped");
    }
}

// ── Remote connections ──
//
// What a proxy needs from an upstream server. Implementations are
// registered in a `ServiceCatalogue<dyn RemoteConnection>` and found by id.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use openscada_net::ConnectionState;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::da::{DaHive, WriteFuture};
use crate::error::CoreError;
use crate::executor::SerialExecutor;
use crate::model::Variant;
use crate::subscription::{Deferred, ListenerHandle};

/// An upstream server offering DA items.
pub trait RemoteConnection: Send + Sync {
    fn id(&self) -> &str;

    /// Subscribe `listener` to `item` on the remote side.
    fn subscribe(&self, item: &str, listener: &ListenerHandle) -> Result<(), CoreError>;

    fn unsubscribe(&self, item: &str, listener: &ListenerHandle);

    fn write(&self, item: &str, value: Variant, user: Option<String>) -> WriteFuture;

    fn state(&self) -> watch::Receiver<ConnectionState>;
}

// ── LocalConnection ──────────────────────────────────────────────────

/// Connection to a hive in the same process.
///
/// Deliveries are moved onto the connection's own executor so a proxy
/// never runs under the hive's source locks.
pub struct LocalConnection {
    id: String,
    hive: Arc<DaHive>,
    executor: SerialExecutor,
    wrapped: Mutex<HashMap<(String, u64), ListenerHandle>>,
    state: watch::Sender<ConnectionState>,
}

impl LocalConnection {
    pub fn new(id: impl Into<String>, hive: Arc<DaHive>) -> Arc<Self> {
        let id = id.into();
        let (state, _) = watch::channel(ConnectionState::Connected);
        Arc::new(Self {
            executor: SerialExecutor::spawn(format!("local-{id}")),
            id,
            hive,
            wrapped: Mutex::new(HashMap::new()),
            state,
        })
    }

    /// Wait for queued deliveries.
    pub async fn flush(&self) {
        self.executor.flush().await;
    }
}

impl RemoteConnection for LocalConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe(&self, item: &str, listener: &ListenerHandle) -> Result<(), CoreError> {
        let deferred = self
            .wrapped
            .lock()
            .entry((item.to_owned(), listener.id()))
            .or_insert_with(|| Deferred::handle(self.executor.clone(), listener.clone()))
            .clone();
        self.hive.manager().subscribe(item, &deferred)
    }

    fn unsubscribe(&self, item: &str, listener: &ListenerHandle) {
        let removed = self.wrapped.lock().remove(&(item.to_owned(), listener.id()));
        if let Some(deferred) = removed {
            self.hive.manager().unsubscribe(item, &deferred);
        }
    }

    fn write(&self, item: &str, value: Variant, user: Option<String>) -> WriteFuture {
        let hive = Arc::clone(&self.hive);
        let item = item.to_owned();
        async move { hive.write_item(&item, value, user.as_deref()).await }.boxed()
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.executor.dispose();
    }
}

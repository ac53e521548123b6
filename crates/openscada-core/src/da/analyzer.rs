// ── Connection analyzer ──
//
// Publishes the state of every registered remote connection as a DA item
// named `connection.<id>.state`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::hive::DaHive;
use super::item::{ConstantItem, DataItem};
use crate::catalogue::{ServiceCatalogue, ServiceEvent};
use crate::error::CoreError;
use crate::model::{Attributes, Variant};
use crate::proxy::RemoteConnection;

/// Item id reporting the state of connection `id`.
pub fn state_item_id(id: &str) -> String {
    format!("connection.{id}.state")
}

/// Keeps one state item per registered connection.
pub struct ConnectionAnalyzer {
    catalogue: Arc<ServiceCatalogue<dyn RemoteConnection>>,
    listener: u64,
    watchers: Arc<Mutex<HashMap<u64, Watcher>>>,
}

struct Watcher {
    item_id: String,
    cancel: CancellationToken,
}

impl ConnectionAnalyzer {
    /// Start following `catalogue`. Must be called inside a tokio runtime.
    pub fn start(
        hive: Arc<DaHive>,
        catalogue: &Arc<ServiceCatalogue<dyn RemoteConnection>>,
    ) -> Result<Self, CoreError> {
        let runtime = Handle::try_current()
            .map_err(|e| CoreError::Internal(format!("connection analyzer needs a runtime: {e}")))?;
        let watchers: Arc<Mutex<HashMap<u64, Watcher>>> = Arc::default();
        let tracked = Arc::clone(&watchers);

        let listener = catalogue.add_listener(move |event| match event {
            ServiceEvent::Added(entry) => {
                let item_id = state_item_id(&entry.id);
                let mut state = entry.service.state();
                let item = ConstantItem::new(
                    &item_id,
                    Variant::from(state.borrow_and_update().to_string()),
                    Attributes::new().with("connection.id", entry.id.as_str()),
                );
                hive.register_item(Arc::clone(&item) as Arc<dyn DataItem>);

                let cancel = CancellationToken::new();
                let token = cancel.clone();
                runtime.spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            () = token.cancelled() => break,
                            changed = state.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                                let current = *state.borrow_and_update();
                                item.set(current.to_string());
                            }
                        }
                    }
                });
                debug!(connection = %entry.id, item = %item_id, "analyzing connection");
                tracked.lock().insert(entry.registration, Watcher { item_id, cancel });
            }
            ServiceEvent::Removed(entry) => {
                if let Some(watcher) = tracked.lock().remove(&entry.registration) {
                    watcher.cancel.cancel();
                    hive.unregister_item(&watcher.item_id);
                }
            }
        });

        Ok(Self {
            catalogue: Arc::clone(catalogue),
            listener,
            watchers,
        })
    }

    /// Ids of the state items currently published.
    pub fn items(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.watchers.lock().values().map(|w| w.item_id.clone()).collect();
        ids.sort();
        ids
    }
}

impl Drop for ConnectionAnalyzer {
    fn drop(&mut self) {
        self.catalogue.remove_listener(self.listener);
        for (_, watcher) in self.watchers.lock().drain() {
            watcher.cancel.cancel();
        }
    }
}

// ── Event replication ──
//
// Moves events written by other nodes from the replication table into
// the event table. Each pass runs in one transaction: read a batch of
// replication rows, store the events not yet present, delete the rows,
// commit.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use openscada_net::codec::{decode_body, encode_body};
use parking_lot::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::storage::{EventStorage, MemoryEventStorage};
use crate::config::{DataFormat, ServiceSettings};
use crate::convert::{event_to_map, map_to_event};
use crate::error::CoreError;
use crate::model::Event;

// ── Rows and tables ──────────────────────────────────────────────────

/// Event payload of a replication row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationData {
    /// JSON text.
    Text(String),
    /// GMPP map encoding.
    Binary(Vec<u8>),
}

/// One row of the replication table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRow {
    pub id: String,
    pub entry_timestamp: DateTime<Utc>,
    pub node_id: String,
    pub data: ReplicationData,
}

impl ReplicationRow {
    /// Encode `event` the way a writer using `format` stores it.
    pub fn encode(event: &Event, format: DataFormat) -> Result<Self, CoreError> {
        let data = match format {
            DataFormat::Json => ReplicationData::Text(
                serde_json::to_string(event)
                    .map_err(|e| CoreError::validation(format!("event encoding: {e}")))?,
            ),
            DataFormat::Blob | DataFormat::Bytes => {
                let mut buf = BytesMut::new();
                encode_body(&event_to_map(event), &mut buf)?;
                ReplicationData::Binary(buf.to_vec())
            }
        };
        Ok(Self {
            id: event.id.to_string(),
            entry_timestamp: event.entry_timestamp,
            node_id: event.node_id.clone(),
            data,
        })
    }

    /// Decode the payload as written in `format`. The decoded event must
    /// carry the row's id.
    pub fn decode(&self, format: DataFormat) -> Result<Event, CoreError> {
        let event = match (format, &self.data) {
            (DataFormat::Json, ReplicationData::Text(text)) => serde_json::from_str(text)
                .map_err(|e| CoreError::validation(format!("event JSON: {e}")))?,
            (DataFormat::Blob | DataFormat::Bytes, ReplicationData::Binary(data)) => {
                let mut src = Bytes::copy_from_slice(data);
                map_to_event(&decode_body(&mut src)?)?
            }
            (format, _) => {
                return Err(CoreError::validation(format!(
                    "row {} does not hold {format} data",
                    self.id
                )));
            }
        };
        if event.id.to_string() != self.id {
            return Err(CoreError::validation(format!(
                "row {} holds event {}",
                self.id, event.id
            )));
        }
        Ok(event)
    }
}

/// Table names under a schema prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub replication: String,
    pub events: String,
}

impl TableNames {
    pub fn new(schema: &str) -> Self {
        Self {
            replication: format!("{schema}OPENSCADA_AE_REP"),
            events: format!("{schema}OPENSCADA_AE_EVENTS_JSON"),
        }
    }
}

// ── Store seam ───────────────────────────────────────────────────────

/// Transactional access to the replication and event tables.
pub trait ReplicationStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn ReplicationTx + '_>, CoreError>;
}

/// One transaction. Dropping it without `commit` discards its changes.
pub trait ReplicationTx {
    /// Up to `limit` replication rows.
    fn select(&mut self, limit: usize) -> Result<Vec<ReplicationRow>, CoreError>;

    fn event_exists(&mut self, id: &str) -> Result<bool, CoreError>;

    fn store_event(&mut self, event: Event) -> Result<(), CoreError>;

    fn delete_row(&mut self, id: &str) -> Result<(), CoreError>;

    fn commit(self: Box<Self>) -> Result<(), CoreError>;
}

// ── Injector ─────────────────────────────────────────────────────────

/// Outcome of one replication pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectStats {
    /// Rows read.
    pub processed: usize,
    /// Events stored.
    pub injected: usize,
    /// Rows whose event was already present.
    pub existing: usize,
    /// Rows that failed to decode or store.
    pub failed: usize,
}

pub struct EventInjector {
    store: Arc<dyn ReplicationStore>,
    format: DataFormat,
    limit: usize,
    delete_failed: bool,
    loop_delay: Duration,
}

impl EventInjector {
    pub fn new(store: Arc<dyn ReplicationStore>, settings: &ServiceSettings) -> Self {
        Self {
            store,
            format: settings.data_format,
            limit: settings.query_limit,
            delete_failed: settings.delete_failed,
            loop_delay: settings.loop_delay,
        }
    }

    /// Run one pass. Blocks on the store.
    pub fn process_once(&self) -> Result<InjectStats, CoreError> {
        let mut tx = self.store.begin()?;
        let mut stats = InjectStats::default();

        for row in tx.select(self.limit)? {
            stats.processed += 1;
            debug!(event = %row.id, "processing replicated event");

            if tx.event_exists(&row.id)? {
                debug!(event = %row.id, "event exists, deleting row only");
                tx.delete_row(&row.id)?;
                stats.existing += 1;
                continue;
            }

            let lag = Utc::now() - row.entry_timestamp;
            trace!(event = %row.id, node = %row.node_id, lag_ms = lag.num_milliseconds(), "injecting event");

            match row.decode(self.format).and_then(|event| tx.store_event(event)) {
                Ok(()) => {
                    tx.delete_row(&row.id)?;
                    stats.injected += 1;
                }
                Err(e) => {
                    warn!(event = %row.id, error = %e, "failed to decode and store event");
                    if self.delete_failed {
                        tx.delete_row(&row.id)?;
                    }
                    stats.failed += 1;
                }
            }
        }

        tx.commit()?;
        Ok(stats)
    }

    /// Run passes every `loop-delay` until cancelled. The first pass
    /// starts immediately.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(delay = ?self.loop_delay, limit = self.limit, format = %self.format, "starting event injector");
        loop {
            let injector = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || injector.process_once()).await {
                Ok(Ok(stats)) if stats.processed > 0 => {
                    info!(processed = stats.processed, injected = stats.injected, "processed entries");
                }
                Ok(Ok(_)) => debug!("processed 0 entries"),
                Ok(Err(e)) => warn!(error = %e, "failed to process"),
                Err(e) => warn!(error = %e, "replication pass aborted"),
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.loop_delay) => {}
            }
        }
        info!("event injector stopped");
    }
}

// ── In-memory store ──────────────────────────────────────────────────

/// Replication store over in-memory tables. Committed events land in a
/// [`MemoryEventStorage`].
pub struct MemoryReplicationStore {
    tables: TableNames,
    rows: Mutex<Vec<ReplicationRow>>,
    events: Arc<MemoryEventStorage>,
    transaction: Mutex<()>,
}

impl MemoryReplicationStore {
    pub fn new(schema: &str, events: Arc<MemoryEventStorage>) -> Self {
        Self {
            tables: TableNames::new(schema),
            rows: Mutex::new(Vec::new()),
            events,
            transaction: Mutex::new(()),
        }
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Append a row to the replication table.
    pub fn insert(&self, row: ReplicationRow) {
        self.rows.lock().push(row);
    }

    pub fn rows(&self) -> Vec<ReplicationRow> {
        self.rows.lock().clone()
    }

    pub fn events(&self) -> &Arc<MemoryEventStorage> {
        &self.events
    }
}

impl ReplicationStore for MemoryReplicationStore {
    fn begin(&self) -> Result<Box<dyn ReplicationTx + '_>, CoreError> {
        Ok(Box::new(MemoryTx {
            store: self,
            _serial: self.transaction.lock(),
            deleted: HashSet::new(),
            stored: Vec::new(),
        }))
    }
}

struct MemoryTx<'a> {
    store: &'a MemoryReplicationStore,
    _serial: MutexGuard<'a, ()>,
    deleted: HashSet<String>,
    stored: Vec<Event>,
}

impl ReplicationTx for MemoryTx<'_> {
    fn select(&mut self, limit: usize) -> Result<Vec<ReplicationRow>, CoreError> {
        Ok(self.store.rows.lock().iter().take(limit).cloned().collect())
    }

    fn event_exists(&mut self, id: &str) -> Result<bool, CoreError> {
        if self.stored.iter().any(|e| e.id.to_string() == id) {
            return Ok(true);
        }
        let Ok(id) = uuid::Uuid::parse_str(id) else {
            return Ok(false);
        };
        self.store.events.contains(id)
    }

    fn store_event(&mut self, event: Event) -> Result<(), CoreError> {
        self.stored.push(event);
        Ok(())
    }

    fn delete_row(&mut self, id: &str) -> Result<(), CoreError> {
        self.deleted.insert(id.to_owned());
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), CoreError> {
        let MemoryTx {
            store,
            deleted,
            stored,
            ..
        } = *self;
        for event in stored {
            store.events.store(event)?;
        }
        store.rows.lock().retain(|row| !deleted.contains(&row.id));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn injector(store: &Arc<MemoryReplicationStore>, format: DataFormat, delete_failed: bool) -> EventInjector {
        let settings = ServiceSettings {
            data_format: format,
            delete_failed,
            ..ServiceSettings::default()
        };
        EventInjector::new(Arc::clone(store) as Arc<dyn ReplicationStore>, &settings)
    }

    fn store() -> Arc<MemoryReplicationStore> {
        Arc::new(MemoryReplicationStore::new("", Arc::new(MemoryEventStorage::new())))
    }

    #[test]
    fn table_names_carry_the_schema() {
        let tables = TableNames::new("scada.");
        assert_eq!(tables.replication, "scada.OPENSCADA_AE_REP");
        assert_eq!(tables.events, "scada.OPENSCADA_AE_EVENTS_JSON");
    }

    #[test]
    fn injecting_a_row_twice_stores_one_event() {
        let store = store();
        let event = Event::new("node-b").with_attribute("message", "tank full");
        let row = ReplicationRow::encode(&event, DataFormat::Json).unwrap();
        store.insert(row.clone());
        store.insert(row.clone());

        let injector = injector(&store, DataFormat::Json, false);
        let stats = injector.process_once().unwrap();
        assert_eq!(
            stats,
            InjectStats {
                processed: 2,
                injected: 1,
                existing: 1,
                failed: 0,
            }
        );

        store.insert(row);
        let stats = injector.process_once().unwrap();
        assert_eq!(stats.existing, 1);

        assert_eq!(store.events().len(), 1);
        assert_eq!(store.events().get(event.id), Some(event));
        assert!(store.rows().is_empty());
    }

    #[test]
    fn binary_rows_decode_through_the_gmpp_map() {
        let store = store();
        let event = Event::new("node-b").with_attribute("value", 42);
        store.insert(ReplicationRow::encode(&event, DataFormat::Bytes).unwrap());

        let stats = injector(&store, DataFormat::Bytes, false).process_once().unwrap();
        assert_eq!(stats.injected, 1);
        assert_eq!(store.events().get(event.id).unwrap().attributes, event.attributes);
    }

    #[test]
    fn undecodable_rows_stay_unless_failures_are_deleted() {
        let store = store();
        store.insert(ReplicationRow {
            id: "broken".into(),
            entry_timestamp: Utc::now(),
            node_id: "node-b".into(),
            data: ReplicationData::Text("{not json".into()),
        });

        let stats = injector(&store, DataFormat::Json, false).process_once().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(store.rows().len(), 1);

        let stats = injector(&store, DataFormat::Json, true).process_once().unwrap();
        assert_eq!(stats.failed, 1);
        assert!(store.rows().is_empty());
        assert!(store.events().is_empty());
    }

    #[test]
    fn rows_holding_another_event_fail() {
        let store = store();
        let event = Event::new("node-b");
        let mut row = ReplicationRow::encode(&event, DataFormat::Json).unwrap();
        row.id = uuid::Uuid::new_v4().to_string();
        store.insert(row);

        let stats = injector(&store, DataFormat::Json, false).process_once().unwrap();
        assert_eq!(
            stats,
            InjectStats {
                processed: 1,
                injected: 0,
                existing: 0,
                failed: 1,
            }
        );
        assert!(store.events().is_empty());
        assert_eq!(store.rows().len(), 1);

        let stats = injector(&store, DataFormat::Json, true).process_once().unwrap();
        assert_eq!(stats.failed, 1);
        assert!(store.rows().is_empty());
        assert!(store.events().is_empty());
    }

    #[test]
    fn batches_respect_the_query_limit() {
        let store = store();
        for _ in 0..5 {
            let event = Event::new("node-b");
            store.insert(ReplicationRow::encode(&event, DataFormat::Json).unwrap());
        }
        let settings = ServiceSettings {
            query_limit: 2,
            ..ServiceSettings::default()
        };
        let injector = EventInjector::new(Arc::clone(&store) as Arc<dyn ReplicationStore>, &settings);
        assert_eq!(injector.process_once().unwrap().processed, 2);
        assert_eq!(store.rows().len(), 3);
    }

    #[tokio::test]
    async fn the_loop_runs_until_cancelled() {
        let store = store();
        let event = Event::new("node-b");
        store.insert(ReplicationRow::encode(&event, DataFormat::Json).unwrap());

        let cancel = CancellationToken::new();
        let handle = Arc::new(injector(&store, DataFormat::Json, false)).spawn(cancel.clone());
        for _ in 0..100 {
            if store.rows().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.rows().is_empty());
        cancel.cancel();
        handle.await.unwrap();
    }
}

// ── Alarms & Events ──
//
// Event pools, condition monitors, event storage with paged queries,
// cross-node replication, and the session-facing AE service.

mod monitor;
mod pool;
mod replication;
mod service;
mod storage;

pub use monitor::{AknHandler, MonitorRegistry};
pub use pool::EventPool;
pub use replication::{
    EventInjector, InjectStats, MemoryReplicationStore, ReplicationData, ReplicationRow,
    ReplicationStore, ReplicationTx, TableNames,
};
pub use service::{AeService, QUERY_TYPE_ATTRIBUTE};
pub use storage::{EventCursor, EventStorage, MemoryEventStorage};

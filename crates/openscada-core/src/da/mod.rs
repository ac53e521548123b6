// ── Data Access ──
//
// Items, the hive serving them, the factory building them from
// configuration, and the GMPP front end.

mod analyzer;
mod factory;
mod hive;
mod item;
mod server;

pub use analyzer::{ConnectionAnalyzer, state_item_id};
pub use factory::{FactoryContext, ItemFactoryRegistry};
pub use hive::DaHive;
pub use item::{ConstantItem, DataItem, MemoryItem, WriteFuture};
pub use server::{DaServer, serve_connection};

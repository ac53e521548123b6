// ── Proxy ──
//
// Federation of upstream services: remote connections and the merged
// items, condition queries and historical items built over them.

mod connection;
mod gmpp;
mod historical;
mod item;
mod monitor;

pub use connection::{LocalConnection, RemoteConnection};
pub use gmpp::GmppConnection;
pub use historical::ProxyHistoricalItem;
pub use item::{ProxyItem, QUALITY_ATTRIBUTE};
pub use monitor::ProxyMonitorQuery;

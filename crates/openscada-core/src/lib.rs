//! Subscription fabric for openSCADA.
//!
//! Sources publish state and data; listeners subscribe to them by key
//! through a [`SubscriptionManager`], which brokers the binding whether
//! the source is registered before or after the subscription. On top of
//! that fabric sit the three service families:
//!
//! - **Data Access** ([`da`]) - items with values and attributes, served
//!   to GMPP clients by the [`DaServer`](da::DaServer).
//!
//! - **Alarms & Events** ([`ae`]) - event pools, condition monitors with
//!   latched acknowledgement, paged event queries, and cross-node event
//!   replication.
//!
//! - **Historical Data** ([`hd`]) - bucketed AVG/MIN/MAX queries over
//!   archived samples, merged by quality.
//!
//! [`proxy`] federates several upstream connections into one item,
//! monitor query or historical item. [`Session`]s own listeners and
//! queries on behalf of a client and deliver everything through a
//! per-session serial executor.

pub mod ae;
pub mod browser;
pub mod catalogue;
pub mod config;
pub mod convert;
pub mod da;
pub mod error;
pub mod executor;
pub mod filter;
pub mod hd;
pub mod model;
pub mod proxy;
pub mod session;
pub mod subscription;

// ── Primary re-exports ──────────────────────────────────────────────
pub use browser::{BrowserCache, BrowserEntry};
pub use catalogue::{Registration, ServiceCatalogue, ServiceEntry, ServiceEvent, ServiceTracker};
pub use config::{DataFormat, ItemSpec, ServiceSettings, UpstreamSpec};
pub use error::CoreError;
pub use executor::SerialExecutor;
pub use filter::{Filter, FilterTarget};
pub use session::{Disposable, ListenerKind, Push, PushStream, Session, SessionRegistry};
pub use subscription::{Listener, ListenerHandle, Source, SourceBase, SubscriptionManager, Update};

pub use model::{
    Attributes, Event, MonitorStatus, MonitorStatusInformation, QueryParameters, QueryState,
    SubscriptionState, Variant, VariantType,
};

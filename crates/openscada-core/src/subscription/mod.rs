// ── Subscription fabric ──
//
// Sources, listeners, and the manager brokering between them.

mod listener;
mod manager;
mod source;

pub use listener::{Deferred, Listener, ListenerHandle, Update};
pub use manager::{RESERVED_PREFIX, SubscriptionManager, validate_key};
pub use source::{
    Activation, EventCache, ItemCache, MonitorCache, Passive, Source, SourceBase, SourceCache,
};

#[cfg(test)]
pub(crate) use listener::testing;

// ── Data items ──
//
// A data item is a source with a current value that clients may read and,
// depending on the kind, write.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use tracing::debug;

use crate::browser::BrowserEntry;
use crate::error::CoreError;
use crate::model::{AttributeMode, Attributes, SubscriptionState, Variant};
use crate::subscription::{Activation, ItemCache, ListenerHandle, Source, SourceBase};

/// Result of an asynchronous write.
pub type WriteFuture = BoxFuture<'static, Result<(), CoreError>>;

/// A named live value served by a hive.
pub trait DataItem: Source {
    fn id(&self) -> &str;

    /// Last known value.
    fn read(&self) -> Variant;

    fn attributes(&self) -> Attributes;

    /// Write a value on behalf of `user`.
    fn write(&self, value: Variant, user: Option<&str>) -> WriteFuture;

    fn information(&self) -> BrowserEntry {
        BrowserEntry::new(self.id())
    }
}

// ── MemoryItem ───────────────────────────────────────────────────────

/// Read/write item holding its value in memory. Granted for as long as it
/// exists.
pub struct MemoryItem {
    id: String,
    base: SourceBase<ItemCache>,
    writer: Mutex<Option<String>>,
}

impl MemoryItem {
    pub fn new(id: impl Into<String>, value: Variant, attributes: Attributes) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            base: SourceBase::new(SubscriptionState::Granted, ItemCache { value, attributes }),
            writer: Mutex::new(None),
        })
    }

    /// User of the last client write, if it named one.
    pub fn last_writer(&self) -> Option<String> {
        self.writer.lock().clone()
    }

    pub fn set(&self, value: impl Into<Variant>) {
        self.base.publish(Some(value.into()), None, AttributeMode::Update);
    }

    pub fn set_attributes(&self, attributes: &Attributes, mode: AttributeMode) {
        self.base.publish(None, Some(attributes), mode);
    }
}

impl Activation for MemoryItem {
    fn permits_deactivation(&self) -> bool {
        false
    }
}

impl Source for MemoryItem {
    fn attach(&self, key: &str, listener: &ListenerHandle, view: Option<SubscriptionState>) {
        self.base.attach(key, listener, view, self);
    }

    fn detach(&self, key: &str, listener: &ListenerHandle, teardown: bool) {
        self.base.detach(key, listener, teardown, self);
    }

    fn current_state(&self) -> SubscriptionState {
        self.base.state()
    }
}

impl DataItem for MemoryItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn read(&self) -> Variant {
        self.base.value()
    }

    fn attributes(&self) -> Attributes {
        self.base.attributes()
    }

    fn write(&self, value: Variant, user: Option<&str>) -> WriteFuture {
        debug!(item = %self.id, user = user.unwrap_or("-"), %value, "memory write");
        *self.writer.lock() = user.map(str::to_owned);
        self.set(value);
        future::ready(Ok(())).boxed()
    }
}

// ── ConstantItem ─────────────────────────────────────────────────────

/// Item clients can only read. The server side may still update it.
pub struct ConstantItem {
    id: String,
    base: SourceBase<ItemCache>,
}

impl ConstantItem {
    pub fn new(id: impl Into<String>, value: Variant, attributes: Attributes) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            base: SourceBase::new(SubscriptionState::Granted, ItemCache { value, attributes }),
        })
    }

    pub fn set(&self, value: impl Into<Variant>) {
        self.base.publish(Some(value.into()), None, AttributeMode::Update);
    }
}

impl Activation for ConstantItem {
    fn permits_deactivation(&self) -> bool {
        false
    }
}

impl Source for ConstantItem {
    fn attach(&self, key: &str, listener: &ListenerHandle, view: Option<SubscriptionState>) {
        self.base.attach(key, listener, view, self);
    }

    fn detach(&self, key: &str, listener: &ListenerHandle, teardown: bool) {
        self.base.detach(key, listener, teardown, self);
    }

    fn current_state(&self) -> SubscriptionState {
        self.base.state()
    }
}

impl DataItem for ConstantItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn read(&self) -> Variant {
        self.base.value()
    }

    fn attributes(&self) -> Attributes {
        self.base.attributes()
    }

    fn write(&self, _value: Variant, _user: Option<&str>) -> WriteFuture {
        let operation = format!("write to read-only item '{}'", self.id);
        future::ready(Err(CoreError::Unsupported { operation })).boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::subscription::{Update, testing::Recorder};

    #[tokio::test]
    async fn memory_items_accept_writes() {
        let item = MemoryItem::new("m", Variant::Int32(1), Attributes::new());
        let (recorder, listener) = Recorder::handle();
        item.attach("m", &listener, None);
        recorder.take();

        item.write(Variant::Int32(2), Some("operator")).await.unwrap();

        assert_eq!(item.read(), Variant::Int32(2));
        assert_eq!(recorder.take(), vec![Update::Value(Variant::Int32(2))]);
    }

    #[test]
    fn constant_items_refuse_writes_without_waiting() {
        let item = ConstantItem::new("c", Variant::from("fixed"), Attributes::new());
        let mut write = tokio_test::task::spawn(item.write(Variant::from("other"), None));
        let err = tokio_test::assert_ready_err!(write.poll());
        assert!(matches!(err, CoreError::Unsupported { .. }));
        assert_eq!(item.read(), Variant::from("fixed"));
    }

    #[test]
    fn memory_items_stay_granted_without_listeners() {
        let item = MemoryItem::new("m", Variant::Null, Attributes::new());
        let (_recorder, listener) = Recorder::handle();
        item.attach("m", &listener, None);
        item.detach("m", &listener, false);
        assert_eq!(item.current_state(), SubscriptionState::Granted);
    }
}

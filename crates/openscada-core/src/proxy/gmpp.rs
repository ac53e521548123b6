// ── GMPP upstream connection ──
//
// `RemoteConnection` to a DA server over GMPP. A background task keeps the
// TCP connection up with backoff, opens a session on every connect, and
// re-subscribes every item that still has listeners. Remote items are
// sources in a local subscription manager, so any number of local
// listeners share one remote subscription.

use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use openscada_net::message::command;
use openscada_net::protocol::da;
use openscada_net::{
    Connection, ConnectionState, Message, ReconnectConfig, TransportConfig, Value, calculate_backoff,
};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::RemoteConnection;
use crate::config::ServiceSettings;
use crate::convert::{map_to_attributes, value_to_variant};
use crate::da::WriteFuture;
use crate::error::CoreError;
use crate::model::{AttributeMode, Attributes, SubscriptionState, Variant};
use crate::subscription::{
    Activation, ItemCache, ListenerHandle, Source, SourceBase, SubscriptionManager,
};

enum Command {
    Subscribe(String),
    Unsubscribe(String),
}

// ── Remote items ─────────────────────────────────────────────────────

/// Local stand-in for one item on the server.
struct RemoteItem {
    key: String,
    base: SourceBase<ItemCache>,
    commands: mpsc::UnboundedSender<Command>,
}

impl RemoteItem {
    /// The connection went away: listeners see Disconnected and the cache
    /// is dropped.
    fn lost(&self) {
        self.base.notify(SubscriptionState::Disconnected);
        self.base
            .publish(Some(Variant::Null), Some(&Attributes::new()), AttributeMode::Set);
    }
}

impl Activation for RemoteItem {
    fn on_activate(&self) {
        let _ = self.commands.send(Command::Subscribe(self.key.clone()));
    }

    fn on_deactivate(&self) {
        let _ = self.commands.send(Command::Unsubscribe(self.key.clone()));
    }
}

impl Source for RemoteItem {
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

// ── Shared state ─────────────────────────────────────────────────────

struct Shared {
    id: String,
    manager: SubscriptionManager,
    items: DashMap<String, Arc<RemoteItem>>,
    /// Serialises item creation and pruning against subscribe.
    membership: Mutex<()>,
    current: Mutex<Option<Connection>>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn on_notify(&self, msg: &Message) {
        let item = msg
            .string(da::FIELD_ITEM_ID)
            .and_then(|id| self.items.get(id).map(|i| Arc::clone(i.value())));
        match msg.command_code {
            da::CC_NOTIFY_SUBSCRIPTION_STATE => {
                let state = msg
                    .string(da::FIELD_STATE)
                    .and_then(|s| SubscriptionState::from_str(s).ok());
                if let (Some(item), Some(state)) = (item, state) {
                    item.base.notify(state);
                }
            }
            da::CC_NOTIFY_VALUE => {
                let value = msg.value(da::FIELD_VALUE).and_then(value_to_variant);
                if let (Some(item), Some(value)) = (item, value) {
                    item.base.publish(Some(value), None, AttributeMode::Update);
                }
            }
            da::CC_NOTIFY_ATTRIBUTES => {
                let attributes = msg
                    .value(da::FIELD_ATTRIBUTES)
                    .and_then(Value::as_map)
                    .map(map_to_attributes);
                let full = msg
                    .value(da::FIELD_INITIAL)
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let mode = if full {
                    AttributeMode::Set
                } else {
                    AttributeMode::Update
                };
                if let (Some(item), Some(attributes)) = (item, attributes) {
                    item.base.publish(None, Some(&attributes), mode);
                }
            }
            command::FAILED => {
                warn!(
                    connection = %self.id,
                    reason = msg.error_info().unwrap_or("-"),
                    "upstream request failed"
                );
            }
            command::ACK => {}
            code => debug!(connection = %self.id, code, "unexpected upstream message"),
        }
    }

    fn lose_all(&self) {
        let items: Vec<Arc<RemoteItem>> = self.items.iter().map(|e| Arc::clone(e.value())).collect();
        for item in items {
            item.lost();
        }
    }

    /// Keys that currently have local listeners.
    fn active_keys(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|e| e.value().base.listener_count() > 0)
            .map(|e| e.key().clone())
            .collect()
    }
}

// ── GmppConnection ───────────────────────────────────────────────────

/// Upstream DA server reached over GMPP.
pub struct GmppConnection {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl GmppConnection {
    /// Start connecting to `address` (`host:port`). Must be called inside a
    /// tokio runtime; the connection runs until `cancel` fires or the
    /// handle is dropped.
    pub fn spawn(
        id: impl Into<String>,
        address: impl Into<String>,
        settings: &ServiceSettings,
        user: Option<String>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            id: id.into(),
            manager: SubscriptionManager::new("gmpp-upstream"),
            items: DashMap::new(),
            membership: Mutex::new(()),
            current: Mutex::new(None),
            state,
        });
        let (commands, rx) = mpsc::unbounded_channel();

        let task = Upstream {
            shared: Arc::clone(&shared),
            address: address.into(),
            transport: settings.transport(),
            reconnect: settings.reconnect(),
            user,
            commands: rx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        Arc::new(Self {
            shared,
            commands,
            cancel,
        })
    }

    /// Stop the connection for good.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn item(&self, key: &str) -> Arc<RemoteItem> {
        let mut created = None;
        let item = Arc::clone(
            self.shared
                .items
                .entry(key.to_owned())
                .or_insert_with(|| {
                    let item = Arc::new(RemoteItem {
                        key: key.to_owned(),
                        base: SourceBase::new(SubscriptionState::Disconnected, ItemCache::default()),
                        commands: self.commands.clone(),
                    });
                    created = Some(Arc::clone(&item));
                    item
                })
                .value(),
        );
        if let Some(item) = created {
            self.shared.manager.set_source(key, Some(item as Arc<dyn Source>));
        }
        item
    }

    /// Drop the remote item of `key` once nothing listens to it.
    fn prune(&self, key: &str) {
        let removed = self
            .shared
            .items
            .remove_if(key, |_, item| item.base.listener_count() == 0);
        if removed.is_some() {
            self.shared.manager.set_source(key, None);
            debug!(connection = %self.shared.id, item = key, "remote item released");
        }
    }
}

impl RemoteConnection for GmppConnection {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn subscribe(&self, item: &str, listener: &ListenerHandle) -> Result<(), CoreError> {
        crate::subscription::validate_key(item)?;
        let _membership = self.shared.membership.lock();
        self.item(item);
        self.shared.manager.subscribe(item, listener)
    }

    fn unsubscribe(&self, item: &str, listener: &ListenerHandle) {
        let _membership = self.shared.membership.lock();
        self.shared.manager.unsubscribe(item, listener);
        self.prune(item);
    }

    /// Forward a write. A named `user` travels with the request; without
    /// one the write runs as the upstream session's user.
    fn write(&self, item: &str, value: Variant, user: Option<String>) -> WriteFuture {
        let connection = self.shared.current.lock().clone();
        let mut request = Message::new(da::CC_WRITE)
            .with_value(da::FIELD_ITEM_ID, item)
            .with_value(da::FIELD_VALUE, value);
        if let Some(user) = user {
            request.set_value(da::FIELD_USER, user);
        }
        let id = self.shared.id.clone();
        async move {
            let connection = connection
                .ok_or_else(|| CoreError::resource(format!("connection '{id}' is not connected")))?;
            connection.request(request).await?;
            Ok(())
        }
        .boxed()
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }
}

impl Drop for GmppConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Background task ──────────────────────────────────────────────────

struct Upstream {
    shared: Arc<Shared>,
    address: String,
    transport: TransportConfig,
    reconnect: ReconnectConfig,
    user: Option<String>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
}

impl Upstream {
    /// connect → open session → pump; on loss, backoff → reconnect.
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            self.shared.state.send_replace(ConnectionState::Connecting);
            let connected = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok((connection, inbound)) => {
                    attempt = 0;
                    info!(connection = %self.shared.id, address = %self.address, "upstream connected");
                    *self.shared.current.lock() = Some(connection.clone());
                    self.shared.state.send_replace(ConnectionState::Connected);

                    self.pump(&connection, inbound).await;

                    connection.close();
                    *self.shared.current.lock() = None;
                    self.shared.state.send_replace(ConnectionState::Closed);
                    self.shared.lose_all();
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    warn!(connection = %self.shared.id, "upstream connection lost");
                }
                Err(e) => {
                    self.shared.state.send_replace(ConnectionState::Closed);
                    warn!(connection = %self.shared.id, error = %e, attempt, "upstream connect failed");
                    if self.reconnect.exhausted(attempt) {
                        warn!(connection = %self.shared.id, "reconnection limit reached, giving up");
                        break;
                    }
                }
            }

            let delay = calculate_backoff(attempt, &self.reconnect);
            debug!(connection = %self.shared.id, ?delay, "waiting before reconnect");
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            attempt = attempt.saturating_add(1);
        }

        *self.shared.current.lock() = None;
        self.shared.state.send_replace(ConnectionState::Closed);
        self.shared.lose_all();
        debug!(connection = %self.shared.id, "upstream task exiting");
    }

    async fn connect(&self) -> Result<(Connection, mpsc::Receiver<Message>), CoreError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| CoreError::resource(format!("cannot connect to {}: {e}", self.address)))?;
        let _ = stream.set_nodelay(true);
        let (connection, inbound) =
            Connection::spawn(stream, self.transport.clone(), self.cancel.child_token());

        let mut request = Message::new(da::CC_CREATE_SESSION);
        if let Some(user) = &self.user {
            request.set_value(da::FIELD_USER, user.as_str());
        }
        if let Err(e) = connection.request(request).await {
            connection.close();
            return Err(e.into());
        }
        Ok((connection, inbound))
    }

    async fn pump(&mut self, connection: &Connection, mut inbound: mpsc::Receiver<Message>) {
        // Queued commands predate this connection; the active set covers them.
        while self.commands.try_recv().is_ok() {}
        for key in self.shared.active_keys() {
            send_item_command(connection, da::CC_SUBSCRIBE_ITEM, &key).await;
        }

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = connection.closed() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Subscribe(key)) => {
                        send_item_command(connection, da::CC_SUBSCRIBE_ITEM, &key).await;
                    }
                    Some(Command::Unsubscribe(key)) => {
                        send_item_command(connection, da::CC_UNSUBSCRIBE_ITEM, &key).await;
                    }
                    None => break,
                },
                msg = inbound.recv() => match msg {
                    Some(msg) => self.shared.on_notify(&msg),
                    None => break,
                },
            }
        }
    }
}

async fn send_item_command(connection: &Connection, code: u32, key: &str) {
    let msg = Message::new(code).with_value(da::FIELD_ITEM_ID, key);
    if let Err(e) = connection.send(msg).await {
        debug!(item = key, command = da::command_name(code), error = %e, "item command dropped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::subscription::testing::Recorder;

    fn unreachable_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        address
    }

    #[tokio::test]
    async fn remote_items_are_released_with_their_last_listener() {
        let connection = GmppConnection::spawn(
            "plant",
            unreachable_address(),
            &ServiceSettings::default(),
            None,
            CancellationToken::new(),
        );
        let (_first, first) = Recorder::handle();
        let (_second, second) = Recorder::handle();

        connection.subscribe("tank.level", &first).unwrap();
        connection.subscribe("tank.level", &second).unwrap();
        connection.subscribe("tank.flow", &first).unwrap();
        assert_eq!(connection.shared.items.len(), 2);

        connection.unsubscribe("tank.level", &first);
        assert!(connection.shared.items.contains_key("tank.level"));

        connection.unsubscribe("tank.level", &second);
        connection.unsubscribe("tank.flow", &first);
        assert!(connection.shared.items.is_empty());
        assert!(connection.shared.manager.is_empty());
        assert!(connection.shared.active_keys().is_empty());
        connection.close();
    }
}

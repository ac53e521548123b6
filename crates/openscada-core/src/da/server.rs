// ── GMPP DA server ──
//
// Accept loop serving a hive over GMPP. Each TCP connection carries at most
// one DA session; session pushes become notify messages, and the session
// is closed when the connection goes away.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use openscada_net::protocol::da;
use openscada_net::{Connection, Message, TransportConfig, Value, ValueMap};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hive::DaHive;
use crate::browser::BrowserEntry;
use crate::convert::{attributes_to_map, value_to_variant};
use crate::error::CoreError;
use crate::session::{ListenerKind, Push, PushStream};
use crate::subscription::Update;

/// Serves one hive to GMPP clients.
pub struct DaServer {
    hive: Arc<DaHive>,
    transport: TransportConfig,
}

impl DaServer {
    pub fn new(hive: Arc<DaHive>, transport: TransportConfig) -> Self {
        Self { hive, transport }
    }

    /// Bind a listener on `addr`.
    pub async fn bind(addr: &str) -> Result<TcpListener, CoreError> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| CoreError::resource(format!("cannot listen on {addr}: {e}")))
    }

    /// Accept connections until `cancel` fires. Open connections are
    /// closed with it.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<(), CoreError> {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        info!(addr = ?local, "DA server listening");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "client connected");
                        // Nagle only adds latency to small notify messages.
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(serve_connection(
                            Arc::clone(&self.hive),
                            stream,
                            self.transport.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
        info!("DA server stopped");
        Ok(())
    }
}

/// Serve a single client over `io` until either side closes.
pub async fn serve_connection<T>(
    hive: Arc<DaHive>,
    io: T,
    transport: TransportConfig,
    cancel: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (conn, mut inbound) = Connection::spawn(io, transport, cancel.child_token());
    let mut client = Client {
        hive,
        conn: conn.clone(),
        session: None,
        pushes: None,
    };

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            msg = inbound.recv() => {
                let Some(msg) = msg else { break };
                client.handle(msg).await;
            }
            Some(push) = next_push(&mut client.pushes) => {
                if let Some(msg) = push_message(push) {
                    if conn.send(msg).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    client.close_session();
    conn.close();
    debug!("client disconnected");
}

async fn next_push(pushes: &mut Option<PushStream>) -> Option<Push> {
    match pushes {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

// ── Request handling ─────────────────────────────────────────────────

struct Client {
    hive: Arc<DaHive>,
    conn: Connection,
    session: Option<Uuid>,
    pushes: Option<PushStream>,
}

impl Client {
    async fn handle(&mut self, msg: Message) {
        debug!(command = da::command_name(msg.command_code), seq = msg.sequence, "request");
        let reply = match msg.command_code {
            da::CC_CREATE_SESSION => self.create_session(&msg),
            da::CC_CLOSE_SESSION => {
                if self.close_session() {
                    Message::ack(&msg)
                } else {
                    Message::failed(&msg, CoreError::InvalidSession.to_string())
                }
            }
            da::CC_SUBSCRIBE_ITEM => self.with_item(&msg, |hive, session, item| hive.subscribe_item(session, item)),
            da::CC_UNSUBSCRIBE_ITEM => {
                self.with_item(&msg, |hive, session, item| hive.unsubscribe_item(session, item))
            }
            da::CC_READ => match self.read(&msg) {
                Ok(reply) => reply,
                Err(e) => Message::failed(&msg, e.to_string()),
            },
            da::CC_WRITE => {
                self.spawn_write(msg);
                return;
            }
            da::CC_BROWSE => match self.browse(&msg) {
                Ok(reply) => reply,
                Err(e) => Message::failed(&msg, e.to_string()),
            },
            _ => Message::unknown_command(&msg),
        };
        if let Err(e) = self.conn.send(reply).await {
            debug!(error = %e, "reply dropped");
        }
    }

    fn create_session(&mut self, msg: &Message) -> Message {
        if self.session.is_some() {
            return Message::failed(msg, "connection already has a session");
        }
        let user = msg.string(da::FIELD_USER).map(str::to_owned);
        let properties: BTreeMap<String, String> = msg
            .value(da::FIELD_PROPERTIES)
            .and_then(Value::as_map)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_owned())))
                    .collect()
            })
            .unwrap_or_default();

        match self.hive.create_session(user, properties) {
            Ok((session, pushes)) => {
                self.session = Some(session.id());
                self.pushes = Some(pushes);
                Message::reply(da::CC_CREATE_SESSION, msg.sequence)
                    .with_value(da::FIELD_SESSION_ID, session.id().to_string())
            }
            Err(e) => Message::failed(msg, e.to_string()),
        }
    }

    /// Close the connection's session. Returns `false` if there was none.
    fn close_session(&mut self) -> bool {
        self.pushes = None;
        match self.session.take() {
            Some(id) => {
                let _ = self.hive.close_session(id);
                true
            }
            None => false,
        }
    }

    fn session(&self) -> Result<Uuid, CoreError> {
        self.session.ok_or(CoreError::InvalidSession)
    }

    fn with_item(
        &self,
        msg: &Message,
        op: impl FnOnce(&DaHive, Uuid, &str) -> Result<(), CoreError>,
    ) -> Message {
        let result = self
            .session()
            .and_then(|session| op(self.hive.as_ref(), session, item_id(msg)?));
        match result {
            Ok(()) => Message::ack(msg),
            Err(e) => Message::failed(msg, e.to_string()),
        }
    }

    fn read(&self, msg: &Message) -> Result<Message, CoreError> {
        let value = self.hive.read(self.session()?, item_id(msg)?)?;
        Ok(Message::reply(da::CC_READ, msg.sequence).with_value(da::FIELD_VALUE, value))
    }

    fn browse(&self, msg: &Message) -> Result<Message, CoreError> {
        let entries = self.hive.browse(self.session()?)?;
        let list: Vec<Value> = entries.iter().map(|e| Value::Map(entry_to_map(e))).collect();
        Ok(Message::reply(da::CC_BROWSE, msg.sequence).with_value(da::FIELD_ENTRIES, list))
    }

    fn spawn_write(&self, msg: Message) {
        let hive = Arc::clone(&self.hive);
        let conn = self.conn.clone();
        let session = self.session;
        tokio::spawn(async move {
            let result = async {
                let session = session.ok_or(CoreError::InvalidSession)?;
                let item = item_id(&msg)?;
                let value = msg
                    .value(da::FIELD_VALUE)
                    .and_then(value_to_variant)
                    .ok_or_else(|| CoreError::validation("write carries no scalar value"))?;
                match msg.string(da::FIELD_USER) {
                    Some(user) => hive.write_as(session, item, value, user).await,
                    None => hive.write(session, item, value).await,
                }
            }
            .await;
            let reply = match result {
                Ok(()) => Message::ack(&msg),
                Err(e) => Message::failed(&msg, e.to_string()),
            };
            let _ = conn.send(reply).await;
        });
    }
}

fn item_id(msg: &Message) -> Result<&str, CoreError> {
    msg.string(da::FIELD_ITEM_ID)
        .ok_or_else(|| CoreError::validation("request carries no item id"))
}

// ── Push encoding ────────────────────────────────────────────────────

/// Notify message for a push, if the DA protocol carries it.
fn push_message(push: Push) -> Option<Message> {
    let Push::Subscription {
        kind: ListenerKind::Item,
        key,
        update,
    } = push
    else {
        return None;
    };
    let msg = match update {
        Update::State(state) => Message::new(da::CC_NOTIFY_SUBSCRIPTION_STATE)
            .with_value(da::FIELD_STATE, state.to_string()),
        Update::Value(value) => Message::new(da::CC_NOTIFY_VALUE).with_value(da::FIELD_VALUE, value),
        Update::Attributes { attributes, full } => Message::new(da::CC_NOTIFY_ATTRIBUTES)
            .with_value(da::FIELD_ATTRIBUTES, attributes_to_map(&attributes))
            .with_value(da::FIELD_INITIAL, full),
        Update::Monitors { .. } | Update::Events(_) => return None,
    };
    Some(msg.with_value(da::FIELD_ITEM_ID, key))
}

fn entry_to_map(entry: &BrowserEntry) -> ValueMap {
    let mut map = ValueMap::new();
    map.insert("id".into(), Value::String(entry.id.clone()));
    if let Some(description) = &entry.description {
        map.insert("description".into(), Value::String(description.clone()));
    }
    map.insert(
        da::FIELD_ATTRIBUTES.into(),
        Value::Map(attributes_to_map(&entry.attributes)),
    );
    map
}

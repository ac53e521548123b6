//! GMPP client commands: `read`, `write`, `watch`.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use openscada_core::convert::value_to_variant;
use openscada_core::proxy::{GmppConnection, RemoteConnection};
use openscada_core::{Listener, ListenerHandle, ServiceSettings, SubscriptionState, Update, Variant, VariantType};
use openscada_net::protocol::da;
use openscada_net::{Connection, ConnectionState, Message, TransportConfig};

use crate::cli::{GlobalOpts, ReadArgs, WatchArgs, WriteArgs};
use crate::error::CliError;
use crate::output::{self, ValueRecord};

// ── Request/reply session ────────────────────────────────────────────

/// A DA session over a single connection.
struct Client {
    connection: Connection,
    _inbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
}

impl Client {
    async fn connect(global: &GlobalOpts) -> Result<Self, CliError> {
        let timeout = Duration::from_secs(global.timeout);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&global.uri))
            .await
            .map_err(|_| CliError::Timeout {
                seconds: global.timeout,
            })?
            .map_err(|e| CliError::ConnectionFailed {
                uri: global.uri.clone(),
                reason: e.to_string(),
            })?;

        let cancel = CancellationToken::new();
        let transport = TransportConfig {
            request_timeout: timeout,
            ..TransportConfig::default()
        };
        let (connection, inbound) = Connection::spawn(stream, transport, cancel.clone());

        let mut request = Message::new(da::CC_CREATE_SESSION);
        if let Some(user) = &global.user {
            request.set_value(da::FIELD_USER, user.as_str());
        }
        if let Err(e) = connection.request(request).await {
            cancel.cancel();
            return Err(e.into());
        }
        debug!(uri = %global.uri, "session created");

        Ok(Self {
            connection,
            _inbound: inbound,
            cancel,
        })
    }

    async fn request(&self, msg: Message) -> Result<Message, openscada_net::Error> {
        self.connection.request(msg).await
    }

    async fn close(self) {
        let _ = self.connection.request(Message::new(da::CC_CLOSE_SESSION)).await;
        self.cancel.cancel();
    }
}

/// Unknown items come back as a failed request naming an unknown query.
fn item_error(err: openscada_net::Error, item: &str, global: &GlobalOpts) -> CliError {
    match err {
        openscada_net::Error::Failed { message } if message.contains("Unknown query") => {
            CliError::ItemNotFound {
                item: item.to_owned(),
                uri: global.uri.clone(),
            }
        }
        other => other.into(),
    }
}

// ── read ─────────────────────────────────────────────────────────────

pub async fn read(args: &ReadArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let client = Client::connect(global).await?;
    let reply = client
        .request(Message::new(da::CC_READ).with_value(da::FIELD_ITEM_ID, args.item.as_str()))
        .await;
    client.close().await;

    let reply = reply.map_err(|e| item_error(e, &args.item, global))?;
    let value = reply
        .value(da::FIELD_VALUE)
        .and_then(value_to_variant)
        .unwrap_or_default();
    let record = ValueRecord {
        item: &args.item,
        value: &value,
        timestamp: None,
    };
    output::print_output(&output::render_value(global.output, &record)?);
    Ok(())
}

// ── write ────────────────────────────────────────────────────────────

pub async fn write(args: &WriteArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let ty = VariantType::from_str(&args.value_type).map_err(|_| CliError::Validation {
        field: "type".into(),
        reason: format!("unknown value type '{}'", args.value_type),
    })?;
    let value = Variant::parse(ty, &args.value)?;

    let client = Client::connect(global).await?;
    let reply = client
        .request(
            Message::new(da::CC_WRITE)
                .with_value(da::FIELD_ITEM_ID, args.item.as_str())
                .with_value(da::FIELD_VALUE, &value),
        )
        .await;
    client.close().await;

    reply.map_err(|e| item_error(e, &args.item, global))?;
    info!(item = %args.item, %value, "written");
    Ok(())
}

// ── watch ────────────────────────────────────────────────────────────

struct Forward(mpsc::UnboundedSender<Update>);

impl Listener for Forward {
    fn deliver(&self, _key: &str, update: Update) {
        let _ = self.0.send(update);
    }
}

pub async fn watch(args: &WatchArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let settings = ServiceSettings {
        reconnect_delay: Duration::from_secs(1),
        ..ServiceSettings::default()
    };
    let cancel = CancellationToken::new();
    let connection = GmppConnection::spawn(
        "watch",
        global.uri.as_str(),
        &settings,
        global.user.clone(),
        cancel.clone(),
    );

    let mut state = connection.state();
    let connected = matches!(
        tokio::time::timeout(
            Duration::from_secs(global.timeout),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await,
        Ok(Ok(_))
    );
    if !connected {
        cancel.cancel();
        return Err(CliError::ConnectionFailed {
            uri: global.uri.clone(),
            reason: format!("not connected within {}s", global.timeout),
        });
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = ListenerHandle::new(Arc::new(Forward(tx)));
    connection.subscribe(&args.item, &listener)?;

    let result = follow(args, global, &mut rx).await;
    connection.unsubscribe(&args.item, &listener);
    cancel.cancel();
    result
}

async fn follow(
    args: &WatchArgs,
    global: &GlobalOpts,
    rx: &mut mpsc::UnboundedReceiver<Update>,
) -> Result<(), CliError> {
    let mut seen = 0usize;
    loop {
        if args.count.is_some_and(|count| seen >= count) {
            return Ok(());
        }
        tokio::select! {
            update = rx.recv() => match update {
                Some(Update::Value(value)) => {
                    let record = ValueRecord {
                        item: &args.item,
                        value: &value,
                        timestamp: Some(Utc::now()),
                    };
                    output::print_output(&output::render_value(global.output, &record)?);
                    seen += 1;
                }
                Some(Update::State(state)) if state != SubscriptionState::Granted => {
                    info!(item = %args.item, %state, "subscription state");
                }
                Some(_) => {}
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

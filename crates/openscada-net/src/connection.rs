//! Keepalive-aware GMPP connection.
//!
//! [`Connection::spawn`] takes ownership of any `AsyncRead + AsyncWrite`
//! transport (a `TcpStream`, or an in-memory duplex in tests) and runs a
//! single IO task that:
//!
//! - assigns sequence numbers to outbound messages,
//! - answers `Ping` with `Pong` without involving the application,
//! - sends `Ping` after `idle_ping` without outbound traffic,
//! - closes the connection when nothing arrived for `ping_timeout`,
//! - routes replies to the [`Connection::request`] call awaiting them,
//! - forwards everything else to the inbound receiver.
//!
//! A decoding failure closes this connection only; the caller decides
//! whether to reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::codec::GmppCodec;
use crate::error::Error;
use crate::message::{Message, command};
use crate::transport::TransportConfig;

// ── ConnectionState ──────────────────────────────────────────────────

/// Lifecycle of a GMPP connection as seen by its owner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
}

type PendingReplies = DashMap<i64, oneshot::Sender<Message>>;

// ── Connection ───────────────────────────────────────────────────────

/// Handle to a running GMPP connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    outbound: mpsc::Sender<Message>,
    pending: Arc<PendingReplies>,
    next_sequence: Arc<AtomicI64>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    config: TransportConfig,
}

impl Connection {
    /// Take over `io` and spawn the connection task.
    ///
    /// Returns the handle plus the receiver for inbound messages that are
    /// neither keepalive traffic nor replies to pending requests. The
    /// connection closes when `cancel` fires, the peer hangs up, the
    /// keepalive window passes, or a frame fails to decode.
    pub fn spawn<T>(
        io: T,
        config: TransportConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Message>)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let pending: Arc<PendingReplies> = Arc::new(DashMap::new());
        let next_sequence = Arc::new(AtomicI64::new(1));

        let framed = Framed::new(io, GmppCodec::new(config.max_frame_len));
        let task = IoTask {
            framed,
            outbound: outbound_rx,
            inbound: inbound_tx,
            pending: Arc::clone(&pending),
            next_sequence: Arc::clone(&next_sequence),
            state: state_tx,
            config: config.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        let handle = Self {
            outbound: outbound_tx,
            pending,
            next_sequence,
            state: state_rx,
            cancel,
            config,
        };
        (handle, inbound_rx)
    }

    /// Queue a message, assigning it a fresh sequence. Returns the sequence.
    pub async fn send(&self, mut msg: Message) -> Result<i64, Error> {
        let sequence = self.allocate_sequence();
        msg.sequence = sequence;
        self.outbound
            .send(msg)
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(sequence)
    }

    /// Send a request and wait for the message replying to it.
    ///
    /// `Failed` and `UnknownCommand` replies are turned into errors.
    pub async fn request(&self, mut msg: Message) -> Result<Message, Error> {
        let sequence = self.allocate_sequence();
        msg.sequence = sequence;
        let code = msg.command_code;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(sequence, tx);

        if self.outbound.send(msg).await.is_err() {
            self.pending.remove(&sequence);
            return Err(Error::ConnectionClosed);
        }

        let waited = tokio::time::timeout(self.config.request_timeout, async {
            tokio::select! {
                biased;
                reply = rx => reply.ok(),
                () = self.cancel.cancelled() => None,
            }
        })
        .await;

        let reply = match waited {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                self.pending.remove(&sequence);
                return Err(Error::ConnectionClosed);
            }
            Err(_) => {
                self.pending.remove(&sequence);
                return Err(Error::Timeout {
                    timeout_ms: self.config.request_timeout_ms(),
                });
            }
        };

        match reply.command_code {
            command::FAILED => Err(Error::Failed {
                message: reply.error_info().unwrap_or("unspecified failure").to_owned(),
            }),
            command::UNKNOWN_COMMAND => Err(Error::UnknownCommand { code }),
            _ => Ok(reply),
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || *self.state.borrow() == ConnectionState::Closed
    }

    /// Resolves once the connection task has stopped.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // An Err means the task dropped the sender, which also means closed.
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Watch the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn allocate_sequence(&self) -> i64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &*self.state.borrow())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

// ── IO task ──────────────────────────────────────────────────────────

struct IoTask<T> {
    framed: Framed<T, GmppCodec>,
    outbound: mpsc::Receiver<Message>,
    inbound: mpsc::Sender<Message>,
    pending: Arc<PendingReplies>,
    next_sequence: Arc<AtomicI64>,
    state: watch::Sender<ConnectionState>,
    config: TransportConfig,
    cancel: CancellationToken,
}

impl<T> IoTask<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn run(mut self) {
        let result = self.pump().await;

        match &result {
            Ok(()) => tracing::debug!("GMPP connection closed"),
            Err(e) if e.is_protocol() => {
                tracing::warn!(error = %e, "GMPP protocol violation, closing connection");
            }
            Err(e) => tracing::info!(error = %e, "GMPP connection lost"),
        }

        self.cancel.cancel();
        // Dropping the senders wakes every waiting request with ConnectionClosed.
        self.pending.clear();
        self.state.send_replace(ConnectionState::Closed);
    }

    async fn pump(&mut self) -> Result<(), Error> {
        let tick = self.config.idle_ping.min(self.config.ping_timeout);
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_rx = Instant::now();
        let mut last_tx = Instant::now();

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(()),
                frame = self.framed.next() => {
                    match frame {
                        Some(Ok(msg)) => {
                            last_rx = Instant::now();
                            if self.handle_inbound(msg).await? {
                                last_tx = Instant::now();
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    }
                }
                out = self.outbound.recv() => {
                    match out {
                        Some(msg) => {
                            self.framed.send(msg).await?;
                            last_tx = Instant::now();
                        }
                        None => return Ok(()),
                    }
                }
                _ = ticker.tick() => {
                    if last_rx.elapsed() >= self.config.ping_timeout {
                        return Err(Error::Timeout {
                            timeout_ms: self.config.ping_timeout_ms(),
                        });
                    }
                    if last_tx.elapsed() >= self.config.idle_ping {
                        let mut ping = Message::new(command::PING);
                        ping.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(sequence = ping.sequence, "sending keepalive ping");
                        self.framed.send(ping).await?;
                        last_tx = Instant::now();
                    }
                }
            }
        }
    }

    /// Dispatch one inbound message. Returns `true` if something was written.
    async fn handle_inbound(&mut self, msg: Message) -> Result<bool, Error> {
        if msg.command_code == command::PING {
            let mut pong = Message::reply(command::PONG, msg.sequence);
            pong.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            self.framed.send(pong).await?;
            return Ok(true);
        }

        if msg.is_reply() {
            if let Some((_, waiter)) = self.pending.remove(&msg.reply_sequence) {
                // The requester may have timed out in the meantime.
                let _ = waiter.send(msg);
                return Ok(false);
            }
        }

        if msg.command_code == command::PONG {
            tracing::trace!(reply_to = msg.reply_sequence, "keepalive pong");
            return Ok(false);
        }

        self.forward(msg).await
    }

    /// Hand `msg` to the inbound receiver. Queued outbound messages keep
    /// going out while the receiver is full, so a consumer blocked on
    /// sending its reply still makes progress.
    async fn forward(&mut self, msg: Message) -> Result<bool, Error> {
        let mut wrote = false;
        let mut outbound_open = true;
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(wrote),
                permit = self.inbound.reserve() => {
                    match permit {
                        Ok(permit) => permit.send(msg),
                        Err(_) => tracing::debug!("inbound receiver dropped, discarding message"),
                    }
                    return Ok(wrote);
                }
                out = self.outbound.recv(), if outbound_open => {
                    match out {
                        Some(out) => {
                            self.framed.send(out).await?;
                            wrote = true;
                        }
                        None => outbound_open = false,
                    }
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;

    const ECHO: u32 = 0x0001_0100;

    /// Server side that acks `ECHO` with the `payload` field and fails
    /// everything else.
    fn spawn_echo_server(io: tokio::io::DuplexStream) -> Connection {
        let (conn, mut inbound) =
            Connection::spawn(io, TransportConfig::default(), CancellationToken::new());
        let server = conn.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                let reply = if msg.command_code == ECHO {
                    let mut ack = Message::ack(&msg);
                    if let Some(payload) = msg.value("payload") {
                        ack.set_value("payload", payload.clone());
                    }
                    ack
                } else {
                    Message::failed(&msg, "unsupported")
                };
                server.send(reply).await.unwrap();
            }
        });
        conn
    }

    #[tokio::test]
    async fn request_receives_matching_reply() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let _server = spawn_echo_server(server_io);
        let (client, _inbound) =
            Connection::spawn(client_io, TransportConfig::default(), CancellationToken::new());

        let reply = client
            .request(Message::new(ECHO).with_value("payload", "hello"))
            .await
            .unwrap();

        assert_eq!(reply.command_code, command::ACK);
        assert_eq!(reply.string("payload"), Some("hello"));
    }

    #[tokio::test]
    async fn failed_reply_becomes_error() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let _server = spawn_echo_server(server_io);
        let (client, _inbound) =
            Connection::spawn(client_io, TransportConfig::default(), CancellationToken::new());

        let err = client.request(Message::new(0x0001_0999)).await.unwrap_err();
        assert!(matches!(err, Error::Failed { ref message } if message == "unsupported"));
    }

    #[tokio::test]
    async fn ping_is_answered_by_the_peer_task() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let _server = spawn_echo_server(server_io);
        let (client, _inbound) =
            Connection::spawn(client_io, TransportConfig::default(), CancellationToken::new());

        let pong = client.request(Message::new(command::PING)).await.unwrap();
        assert_eq!(pong.command_code, command::PONG);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_dropped_after_ping_timeout() {
        let (client_io, _silent_peer) = tokio::io::duplex(64 * 1024);
        let (client, _inbound) =
            Connection::spawn(client_io, TransportConfig::default(), CancellationToken::new());

        tokio::time::timeout(Duration::from_secs(60), client.closed())
            .await
            .expect("connection should close once the keepalive window passes");
        assert!(client.is_closed());
        assert_eq!(*client.state().borrow(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_peers_keep_each_other_alive() {
        let (a_io, b_io) = tokio::io::duplex(64 * 1024);
        let (a, _a_inbound) =
            Connection::spawn(a_io, TransportConfig::default(), CancellationToken::new());
        let (b, _b_inbound) =
            Connection::spawn(b_io, TransportConfig::default(), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(95)).await;

        assert!(!a.is_closed());
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn garbage_closes_only_the_connection() {
        let (client_io, mut raw_peer) = tokio::io::duplex(4096);
        let (client, _inbound) =
            Connection::spawn(client_io, TransportConfig::default(), CancellationToken::new());

        // Valid header, but the body ends before its first value.
        let mut frame = Vec::new();
        frame.extend_from_slice(&command::ACK.to_be_bytes());
        frame.extend_from_slice(&1_i64.to_be_bytes());
        frame.extend_from_slice(&0_i64.to_be_bytes());
        frame.extend_from_slice(&0_i64.to_be_bytes());
        frame.extend_from_slice(&8_u32.to_be_bytes());
        frame.extend_from_slice(&1_u32.to_be_bytes());
        frame.extend_from_slice(&0_u32.to_be_bytes());
        raw_peer.write_all(&frame).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn pipelined_requests_do_not_stall_a_busy_peer() {
        let config = TransportConfig {
            queue_capacity: 4,
            ..TransportConfig::default()
        };
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let (server, mut requests) =
            Connection::spawn(server_io, config.clone(), CancellationToken::new());
        tokio::spawn(async move {
            while let Some(msg) = requests.recv().await {
                if server.send(Message::ack(&msg)).await.is_err() {
                    break;
                }
            }
        });

        let (client, mut unsolicited) =
            Connection::spawn(client_io, config, CancellationToken::new());
        tokio::spawn(async move { while unsolicited.recv().await.is_some() {} });

        for _ in 0..200 {
            client.send(Message::new(ECHO)).await.unwrap();
        }
        let reply = tokio::time::timeout(Duration::from_secs(5), client.request(Message::new(ECHO)))
            .await
            .expect("connection stalled under pipelined traffic")
            .unwrap();
        assert_eq!(reply.command_code, command::ACK);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn pending_request_fails_when_connection_closes() {
        let (client_io, _silent_peer) = tokio::io::duplex(4096);
        let (client, _inbound) =
            Connection::spawn(client_io, TransportConfig::default(), CancellationToken::new());

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.request(Message::new(ECHO)).await })
        };
        tokio::task::yield_now().await;
        client.close();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed), "got {err:?}");
    }
}

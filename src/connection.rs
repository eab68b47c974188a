//! One WebSocket connection of one device.
//!
//! A [`Connection`] is shared between the hub registry and the two pumps that
//! serve its socket. The outbound queue sender lives behind the same lock as
//! the lifecycle state, so an enqueue racing a close is dropped instead of
//! failing.

use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use crate::hub::HubHandle;
use crate::protocol::{self, DeviceInfo, Inbound, MessageType};

pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub send_queue_capacity: usize,
    /// Deadline for a single socket write.
    pub write_wait: Duration,
    /// Read deadline; any inbound frame pushes it forward.
    pub pong_wait: Duration,
    /// Keepalive interval, kept below `pong_wait`.
    pub ping_period: Duration,
    pub max_message_bytes: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::new(
            DEFAULT_SEND_QUEUE_CAPACITY,
            DEFAULT_WRITE_WAIT,
            DEFAULT_PONG_WAIT,
            DEFAULT_MAX_MESSAGE_BYTES,
        )
    }
}

impl ConnectionSettings {
    pub fn new(
        send_queue_capacity: usize,
        write_wait: Duration,
        pong_wait: Duration,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            send_queue_capacity: send_queue_capacity.max(1),
            write_wait,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            max_message_bytes,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Registered,
    Active,
    Closing,
    Closed,
}

/// Outcome of a non-blocking enqueue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Enqueue {
    Queued,
    Full,
    Closed,
}

struct Outbox {
    state: ConnectionState,
    tx: Option<mpsc::Sender<String>>,
}

pub struct Connection {
    conn_id: Uuid,
    user_id: Uuid,
    device_id: Uuid,
    device: DeviceInfo,
    outbox: Mutex<Outbox>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Creates a connection in `Connecting` state together with the receiving
    /// end of its outbound queue, which the outbound pump drains.
    pub fn new(
        user_id: Uuid,
        device_id: Uuid,
        device: DeviceInfo,
        send_queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(send_queue_capacity.max(1));
        let conn = Arc::new(Self {
            conn_id: Uuid::new_v4(),
            user_id,
            device_id,
            device,
            outbox: Mutex::new(Outbox {
                state: ConnectionState::Connecting,
                tx: Some(tx),
            }),
        });
        (conn, rx)
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn state(&self) -> ConnectionState {
        self.outbox().state
    }

    pub fn is_closing(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueues without blocking. A full queue drops the new message; a
    /// closed queue drops it silently.
    pub fn send(&self, msg: String) -> Enqueue {
        let outbox = self.outbox();
        let Some(tx) = outbox.tx.as_ref() else {
            return Enqueue::Closed;
        };
        match tx.try_send(msg) {
            Ok(()) => Enqueue::Queued,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    device_id = %self.device_id,
                    "client send buffer full, dropping message"
                );
                Enqueue::Full
            }
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    pub(crate) fn mark_registered(&self) -> bool {
        let mut outbox = self.outbox();
        if outbox.state != ConnectionState::Connecting {
            return false;
        }
        outbox.state = ConnectionState::Registered;
        true
    }

    fn mark_active(&self) {
        let mut outbox = self.outbox();
        if outbox.state == ConnectionState::Registered {
            outbox.state = ConnectionState::Active;
        }
    }

    /// Closes the outbound queue. Messages already queued are still written,
    /// after which the outbound pump sends a close frame and exits. Returns
    /// false if the queue was already closed.
    pub fn close(&self) -> bool {
        let mut outbox = self.outbox();
        if outbox.tx.is_none() {
            return false;
        }
        outbox.tx = None;
        if outbox.state != ConnectionState::Closed {
            outbox.state = ConnectionState::Closing;
        }
        true
    }

    fn mark_closed(&self) {
        let mut outbox = self.outbox();
        outbox.tx = None;
        outbox.state = ConnectionState::Closed;
    }

    fn send_pong(&self) {
        match protocol::encode_empty(MessageType::Pong) {
            Ok(msg) => {
                self.send(msg);
            }
            Err(err) => tracing::error!(error = %err, "failed to encode pong"),
        }
    }

    fn send_error(&self, code: &str, message: &str) {
        match protocol::encode_error(code, message) {
            Ok(msg) => {
                self.send(msg);
            }
            Err(err) => tracing::error!(error = %err, "failed to encode error message"),
        }
    }

    /// Dispatches one inbound text frame. Bad frames are answered with an
    /// `error` envelope and never close the connection.
    pub fn handle_text(&self, hub: &HubHandle, raw: &str) {
        self.mark_active();
        match protocol::decode_inbound(raw) {
            Ok(Inbound::Ping) => self.send_pong(),
            Ok(Inbound::Offer(mut offer)) => {
                offer.from_device_id = self.device_id;
                hub.forward(self.user_id, offer.to_device_id, MessageType::Offer, &offer);
            }
            Ok(Inbound::Answer(mut answer)) => {
                answer.from_device_id = self.device_id;
                hub.forward(self.user_id, answer.to_device_id, MessageType::Answer, &answer);
            }
            Ok(Inbound::Candidate(mut candidate)) => {
                candidate.from_device_id = self.device_id;
                hub.forward(
                    self.user_id,
                    candidate.to_device_id,
                    MessageType::Candidate,
                    &candidate,
                );
            }
            Err(err) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    device_id = %self.device_id,
                    error = %err,
                    "rejected client message"
                );
                self.send_error(err.code(), &err.client_message());
            }
        }
    }
}

/// Serves a registered connection until its transport fails or its queue is
/// closed, then unregisters it. Returns once both pumps have exited.
pub async fn run<S, E>(
    conn: Arc<Connection>,
    rx: mpsc::Receiver<String>,
    socket: S,
    hub: HubHandle,
    settings: ConnectionSettings,
) where
    S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
    <S as Sink<Message>>::Error: Display + Send,
    E: Display,
{
    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_pump(conn.clone(), rx, sink, settings.clone()));

    let mut writer_done = false;
    tokio::select! {
        _ = read_pump(&conn, stream, &hub, &settings) => {}
        _ = &mut writer => { writer_done = true; }
    }

    hub.unregister(conn.clone()).await;
    // The hub loop may already be gone; closing here guarantees the writer ends.
    conn.close();
    if !writer_done {
        if let Err(err) = writer.await {
            tracing::error!(error = %err, "outbound pump task failed");
        }
    }
    conn.mark_closed();
    tracing::debug!(
        user_id = %conn.user_id(),
        device_id = %conn.device_id(),
        conn_id = %conn.conn_id(),
        "connection closed"
    );
}

/// Reads frames until the peer closes, a read fails, or the read deadline
/// passes without any frame arriving.
pub async fn read_pump<St, E>(
    conn: &Connection,
    mut stream: St,
    hub: &HubHandle,
    settings: &ConnectionSettings,
) where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let next = match timeout(settings.pong_wait, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                tracing::info!(
                    user_id = %conn.user_id(),
                    device_id = %conn.device_id(),
                    "websocket read deadline exceeded"
                );
                return;
            }
        };
        match next {
            Some(Ok(Message::Text(text))) => conn.handle_text(hub, &text),
            Some(Ok(Message::Binary(bin))) => {
                if bin.len() > settings.max_message_bytes {
                    tracing::warn!(
                        user_id = %conn.user_id(),
                        len = bin.len(),
                        "oversized frame, closing connection"
                    );
                    return;
                }
                match std::str::from_utf8(&bin) {
                    Ok(text) => conn.handle_text(hub, text),
                    Err(_) => conn.send_error(
                        protocol::ERR_INVALID_MESSAGE,
                        "failed to parse message",
                    ),
                }
            }
            // Keepalive acks only refresh the deadline.
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return,
            Some(Err(err)) => {
                tracing::warn!(
                    user_id = %conn.user_id(),
                    device_id = %conn.device_id(),
                    error = %err,
                    "websocket read error"
                );
                return;
            }
        }
    }
}

/// Writes queued messages in FIFO order and probes the peer every
/// `ping_period`. A closed queue ends the pump with a close frame.
pub async fn write_pump<Si>(
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<String>,
    mut sink: Si,
    settings: ConnectionSettings,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut ticker =
        tokio::time::interval_at(Instant::now() + settings.ping_period, settings.ping_period);
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(text) = msg else {
                    let _ = timeout(settings.write_wait, sink.send(Message::Close(None))).await;
                    break;
                };
                if let Err(err) = write_with_deadline(&mut sink, Message::Text(text), settings.write_wait).await {
                    tracing::warn!(
                        user_id = %conn.user_id(),
                        device_id = %conn.device_id(),
                        error = %err,
                        "websocket write error"
                    );
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = write_with_deadline(&mut sink, Message::Ping(Vec::new()), settings.write_wait).await {
                    tracing::debug!(user_id = %conn.user_id(), error = %err, "keepalive ping failed");
                    break;
                }
            }
        }
    }
    // Anything enqueued after this point is dropped.
    conn.close();
    let _ = sink.close().await;
}

async fn write_with_deadline<Si>(sink: &mut Si, msg: Message, wait: Duration) -> Result<(), String>
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    match timeout(wait, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err(format!("write timed out after {}ms", wait.as_millis())),
    }
}

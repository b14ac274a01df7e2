//! The courier client.
//!
//! `CourierClient` manages the connection lifecycle: WebSocket connect,
//! handshake, authentication, the dispatch loop, and keepalive. Requests
//! that expect a reply (send, list, history, lookup) are matched to it by
//! message type; everything the server pushes unprompted surfaces as a
//! [`ChatEvent`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use courier_core::messages::*;
use courier_core::{frame_decode, frame_encode, CourierError, CourierResult, PROTOCOL_VERSION};

use crate::transport::{self, WsStream};

/// How long to wait for the reply to a request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A reply slot shared between the expected-type and error registrations,
/// so whichever arrives first consumes the waiter and the other entry goes
/// stale harmlessly.
type Waiter = Arc<Mutex<Option<oneshot::Sender<Envelope>>>>;
type Waiters = Arc<Mutex<HashMap<u8, Vec<Waiter>>>>;

/// Configuration for connecting to a courier server.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Identity (phone number) to authenticate as.
    pub identity: String,
    /// Bearer token for that identity.
    pub token: Vec<u8>,
    /// Ping interval in seconds (0 = disabled).
    pub ping_interval_secs: u64,
    /// Connection timeout in seconds.
    pub timeout_secs: u64,
}

impl ConnectConfig {
    pub fn new(identity: impl Into<String>, token: Vec<u8>) -> Self {
        Self {
            identity: identity.into(),
            token,
            ping_interval_secs: 30,
            timeout_secs: 10,
        }
    }
}

/// Everything the server pushes without being asked.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A message addressed to us arrived.
    Message {
        conversation_id: String,
        message: WireMessage,
    },
    /// Someone sent us a message (badge signal, carried next to the
    /// message itself).
    Notification {
        conversation_id: String,
        sender: String,
    },
    /// The other side started typing.
    Typing {
        conversation_id: String,
        sender: String,
    },
    /// The other side stopped typing.
    StopTyping {
        conversation_id: String,
        sender: String,
    },
    /// Someone read our messages.
    MessagesRead {
        conversation_id: String,
        reader: String,
    },
    /// An error the server did not tie to a pending request.
    Error { code: u32, message: String },
    /// The server is closing this connection.
    Shutdown { reason: String },
    /// The connection is gone.
    Disconnected,
}

/// The courier client.
#[derive(Debug)]
pub struct CourierClient {
    /// Authenticated identity.
    identity: String,
    /// Server-assigned connection id.
    connection_id: String,
    /// Sender for outgoing envelopes (consumed by the dispatch loop).
    outgoing_tx: mpsc::Sender<Envelope>,
    /// Push events from the server.
    event_rx: Mutex<mpsc::Receiver<ChatEvent>>,
    /// Pending request waiters, keyed by expected message type.
    waiters: Waiters,
    /// Whether the client is connected.
    connected: Arc<Mutex<bool>>,
    /// Asks the dispatch loop to close the WebSocket.
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Handle for the dispatch task.
    dispatch_handle: Option<tokio::task::JoinHandle<()>>,
    /// Handle for the keepalive task.
    keepalive_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CourierClient {
    /// Connect to a courier server, perform the handshake, and authenticate.
    pub async fn connect(url: &str, config: ConnectConfig) -> CourierResult<Self> {
        let mut ws = transport::connect(url).await?;

        let timeout = Duration::from_secs(config.timeout_secs);
        let auth_ok = match time::timeout(timeout, handshake(&mut ws, &config)).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(CourierError::Timeout),
        };

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Envelope>(256);
        let (event_tx, event_rx) = mpsc::channel::<ChatEvent>(256);
        let (close_tx, close_rx) = oneshot::channel::<()>();
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(Mutex::new(true));

        let dispatch_handle = {
            let waiters = waiters.clone();
            let connected = connected.clone();
            let outgoing_tx = outgoing_tx.clone();
            tokio::spawn(async move {
                dispatch_loop(ws, outgoing_rx, close_rx, waiters, event_tx, connected, outgoing_tx)
                    .await;
            })
        };

        // Keepalive pings, if configured.
        let keepalive_handle = if config.ping_interval_secs > 0 {
            let interval = Duration::from_secs(config.ping_interval_secs);
            let outgoing = outgoing_tx.clone();
            let connected = connected.clone();

            Some(tokio::spawn(async move {
                let mut ping_id: u64 = 0;
                let mut ticker = time::interval(interval);
                ticker.tick().await; // skip first immediate tick

                loop {
                    ticker.tick().await;
                    if !*connected.lock().await {
                        break;
                    }
                    ping_id += 1;
                    let envelope = Envelope {
                        msg_type: MsgType::Ping,
                        payload: Payload::PingPong(PingPongPayload { id: ping_id }),
                    };
                    if outgoing.send(envelope).await.is_err() {
                        break;
                    }
                }
                tracing::debug!("keepalive loop ended");
            }))
        } else {
            None
        };

        Ok(Self {
            identity: auth_ok.identity,
            connection_id: auth_ok.connection_id,
            outgoing_tx,
            event_rx: Mutex::new(event_rx),
            waiters,
            connected,
            close_tx: Mutex::new(Some(close_tx)),
            dispatch_handle: Some(dispatch_handle),
            keepalive_handle,
        })
    }

    /// The authenticated identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The server-assigned connection id.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Whether the client is currently connected.
    pub async fn is_connected(&self) -> bool {
        *self.connected.lock().await
    }

    /// Send a message and wait for the server's acknowledgement carrying
    /// the stored record (id, timestamp, conversation).
    pub async fn send_message(
        &self,
        receiver: &str,
        text: &str,
        conversation_id: Option<&str>,
    ) -> CourierResult<DeliveryPayload> {
        let envelope = Envelope {
            msg_type: MsgType::SendMessage,
            payload: Payload::SendMessage(SendMessagePayload {
                receiver: receiver.to_string(),
                text: text.to_string(),
                conversation_id: conversation_id.map(str::to_string),
            }),
        };
        let reply = self.send_and_wait(envelope, MsgType::MessageSent).await?;
        match reply.payload {
            Payload::Delivery(d) => Ok(d),
            _ => Err(CourierError::Validation(
                "unexpected reply to send_message".into(),
            )),
        }
    }

    /// Tell the receiver we started typing. Fire-and-forget.
    pub async fn typing(&self, conversation_id: &str, receiver: &str) -> CourierResult<()> {
        self.send_typing(MsgType::Typing, conversation_id, receiver)
            .await
    }

    /// Tell the receiver we stopped typing. Fire-and-forget.
    pub async fn stop_typing(&self, conversation_id: &str, receiver: &str) -> CourierResult<()> {
        self.send_typing(MsgType::StopTyping, conversation_id, receiver)
            .await
    }

    async fn send_typing(
        &self,
        msg_type: MsgType,
        conversation_id: &str,
        receiver: &str,
    ) -> CourierResult<()> {
        self.send_fire_and_forget(Envelope {
            msg_type,
            payload: Payload::Typing(TypingPayload {
                conversation_id: conversation_id.to_string(),
                receiver: receiver.to_string(),
            }),
        })
        .await
    }

    /// Mark every message from `sender` in the conversation as read.
    /// Fire-and-forget; the sender gets a read receipt if online.
    pub async fn mark_read(&self, conversation_id: &str, sender: &str) -> CourierResult<()> {
        self.send_fire_and_forget(Envelope {
            msg_type: MsgType::MarkRead,
            payload: Payload::Signal(SignalPayload {
                conversation_id: conversation_id.to_string(),
                sender: sender.to_string(),
            }),
        })
        .await
    }

    /// List our conversations, most recently updated first.
    pub async fn list_conversations(&self) -> CourierResult<Vec<ConversationSummary>> {
        let envelope = Envelope {
            msg_type: MsgType::ListConversations,
            payload: Payload::Empty(EmptyPayload {}),
        };
        let reply = self.send_and_wait(envelope, MsgType::Conversations).await?;
        match reply.payload {
            Payload::Conversations(c) => Ok(c.conversations),
            _ => Err(CourierError::Validation(
                "unexpected reply to list_conversations".into(),
            )),
        }
    }

    /// Fetch the most recent messages of a conversation, oldest first.
    pub async fn fetch_history(
        &self,
        conversation_id: &str,
        limit: Option<u32>,
    ) -> CourierResult<Vec<WireMessage>> {
        let envelope = Envelope {
            msg_type: MsgType::FetchHistory,
            payload: Payload::FetchHistory(FetchHistoryPayload {
                conversation_id: conversation_id.to_string(),
                limit,
            }),
        };
        let reply = self.send_and_wait(envelope, MsgType::History).await?;
        match reply.payload {
            Payload::History(h) => Ok(h.messages),
            _ => Err(CourierError::Validation(
                "unexpected reply to fetch_history".into(),
            )),
        }
    }

    /// Look up a user's presence and last-seen time.
    pub async fn lookup_user(&self, identity: &str) -> CourierResult<UserInfoPayload> {
        let envelope = Envelope {
            msg_type: MsgType::LookupUser,
            payload: Payload::LookupUser(LookupUserPayload {
                identity: identity.to_string(),
            }),
        };
        let reply = self.send_and_wait(envelope, MsgType::UserInfo).await?;
        match reply.payload {
            Payload::UserInfo(u) => Ok(u),
            _ => Err(CourierError::Validation(
                "unexpected reply to lookup_user".into(),
            )),
        }
    }

    /// The next push event from the server. `None` after disconnect once
    /// the buffered events are drained.
    pub async fn next_event(&self) -> Option<ChatEvent> {
        self.event_rx.lock().await.recv().await
    }

    /// Disconnect from the server.
    pub async fn disconnect(&self) {
        {
            let mut connected = self.connected.lock().await;
            *connected = false;
        }
        if let Some(tx) = self.close_tx.lock().await.take() {
            let _ = tx.send(());
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn send_fire_and_forget(&self, envelope: Envelope) -> CourierResult<()> {
        self.outgoing_tx
            .send(envelope)
            .await
            .map_err(|_| CourierError::Transport("outgoing channel closed".into()))
    }

    /// Send a request and wait for the expected reply type or an error
    /// reply, whichever comes first.
    async fn send_and_wait(&self, envelope: Envelope, expected: MsgType) -> CourierResult<Envelope> {
        let rx = register_waiter(&self.waiters, expected).await;
        self.send_fire_and_forget(envelope).await?;

        match time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => {
                if reply.msg_type == MsgType::Error {
                    if let Payload::Error(e) = &reply.payload {
                        return Err(CourierError::from_wire(e.code, &e.message));
                    }
                    return Err(CourierError::Other("malformed error reply".into()));
                }
                Ok(reply)
            }
            Ok(Err(_)) => Err(CourierError::Transport("response channel dropped".into())),
            Err(_) => Err(CourierError::Timeout),
        }
    }
}

impl Drop for CourierClient {
    fn drop(&mut self) {
        if let Some(h) = self.dispatch_handle.take() {
            h.abort();
        }
        if let Some(h) = self.keepalive_handle.take() {
            h.abort();
        }
    }
}

/// Register a reply slot under the expected type and under `Error`.
async fn register_waiter(waiters: &Waiters, expected: MsgType) -> oneshot::Receiver<Envelope> {
    let (tx, rx) = oneshot::channel();
    let waiter: Waiter = Arc::new(Mutex::new(Some(tx)));
    let mut map = waiters.lock().await;
    map.entry(expected.into()).or_default().push(waiter.clone());
    map.entry(MsgType::Error.into()).or_default().push(waiter);
    rx
}

/// Hand `envelope` to a pending waiter of its type. Returns the envelope
/// back if nobody is waiting for it.
async fn route_to_waiter(waiters: &Waiters, envelope: Envelope) -> Option<Envelope> {
    let key: u8 = envelope.msg_type.into();
    let mut map = waiters.lock().await;

    let mut taken = None;
    let mut now_empty = false;
    if let Some(queue) = map.get_mut(&key) {
        // Skip slots already consumed via their other registration.
        while let Some(waiter) = queue.pop() {
            if let Some(tx) = waiter.lock().await.take() {
                taken = Some(tx);
                break;
            }
        }
        now_empty = queue.is_empty();
    }
    if now_empty {
        map.remove(&key);
    }

    match taken {
        Some(tx) => {
            let _ = tx.send(envelope);
            None
        }
        None => Some(envelope),
    }
}

/// The handshake: `Hello` -> `ServerHello` -> `Auth` -> `AuthOk`/`AuthFail`.
async fn handshake(ws: &mut WsStream, config: &ConnectConfig) -> CourierResult<AuthOkPayload> {
    let hello = Envelope {
        msg_type: MsgType::Hello,
        payload: Payload::Hello(HelloPayload {
            version: PROTOCOL_VERSION.to_string(),
            identity: config.identity.clone(),
        }),
    };
    transport::send_binary(ws, &frame_encode(&hello)?).await?;

    let data = transport::recv_binary(ws)
        .await?
        .ok_or_else(|| CourierError::Transport("connection closed during handshake".into()))?;
    let server_hello: Envelope = frame_decode(&data)?;
    match &server_hello.payload {
        Payload::ServerHello(sh) => {
            if sh.version != PROTOCOL_VERSION {
                return Err(CourierError::Auth(format!(
                    "protocol version mismatch: server {}, client {}",
                    sh.version, PROTOCOL_VERSION
                )));
            }
        }
        _ => {
            return Err(CourierError::Validation("expected server hello".into()));
        }
    }

    let auth = Envelope {
        msg_type: MsgType::Auth,
        payload: Payload::Auth(AuthPayload {
            identity: config.identity.clone(),
            token: config.token.clone(),
        }),
    };
    transport::send_binary(ws, &frame_encode(&auth)?).await?;

    let data = transport::recv_binary(ws)
        .await?
        .ok_or_else(|| CourierError::Transport("connection closed during handshake".into()))?;
    let reply: Envelope = frame_decode(&data)?;
    match (reply.msg_type, reply.payload) {
        (MsgType::AuthOk, Payload::AuthOk(ok)) => {
            tracing::info!(
                identity = %ok.identity,
                connection_id = %ok.connection_id,
                "authenticated"
            );
            Ok(ok)
        }
        (MsgType::AuthFail, Payload::Reason(fail)) => Err(CourierError::Auth(fail.reason)),
        _ => Err(CourierError::Validation("expected auth reply".into())),
    }
}

/// Owns the WebSocket after the handshake: sends queued envelopes, routes
/// replies to waiters, surfaces pushes as events.
async fn dispatch_loop(
    ws: WsStream,
    mut outgoing_rx: mpsc::Receiver<Envelope>,
    mut close_rx: oneshot::Receiver<()>,
    waiters: Waiters,
    event_tx: mpsc::Sender<ChatEvent>,
    connected: Arc<Mutex<bool>>,
    outgoing_tx: mpsc::Sender<Envelope>,
) {
    let (mut sink, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = &mut close_rx => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            maybe_envelope = outgoing_rx.recv() => {
                let Some(envelope) = maybe_envelope else { break };
                match frame_encode(&envelope) {
                    Ok(frame) => {
                        if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                            tracing::error!(error = %e, "failed to send message");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode message");
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        match frame_decode::<Envelope>(&data) {
                            Ok(envelope) => {
                                handle_incoming(envelope, &waiters, &event_tx, &outgoing_tx).await;
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "undecodable frame from server");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("server closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "read error");
                        break;
                    }
                }
            }
        }
    }

    {
        let mut c = connected.lock().await;
        *c = false;
    }
    let _ = event_tx.send(ChatEvent::Disconnected).await;
    tracing::debug!("dispatch loop ended");
}

/// Handle one incoming envelope: answer pings, satisfy waiters, or surface
/// a push event.
async fn handle_incoming(
    envelope: Envelope,
    waiters: &Waiters,
    event_tx: &mpsc::Sender<ChatEvent>,
    outgoing_tx: &mpsc::Sender<Envelope>,
) {
    match envelope.msg_type {
        MsgType::Ping => {
            if let Payload::PingPong(pp) = &envelope.payload {
                let pong = Envelope {
                    msg_type: MsgType::Pong,
                    payload: Payload::PingPong(PingPongPayload { id: pp.id }),
                };
                let _ = outgoing_tx.send(pong).await;
            }
        }
        MsgType::Pong => {
            tracing::trace!("received pong");
        }
        _ => {
            let Some(envelope) = route_to_waiter(waiters, envelope).await else {
                return;
            };
            match map_event(envelope) {
                Some(event) => {
                    let _ = event_tx.send(event).await;
                }
                None => {
                    tracing::debug!("unhandled server message");
                }
            }
        }
    }
}

/// Map a server push to its [`ChatEvent`]. Reply types return `None`; they
/// are handled by waiters.
fn map_event(envelope: Envelope) -> Option<ChatEvent> {
    match (envelope.msg_type, envelope.payload) {
        (MsgType::ReceiveMessage, Payload::Delivery(d)) => Some(ChatEvent::Message {
            conversation_id: d.conversation_id,
            message: d.message,
        }),
        (MsgType::NewMessageNotification, Payload::Signal(s)) => Some(ChatEvent::Notification {
            conversation_id: s.conversation_id,
            sender: s.sender,
        }),
        (MsgType::UserTyping, Payload::Signal(s)) => Some(ChatEvent::Typing {
            conversation_id: s.conversation_id,
            sender: s.sender,
        }),
        (MsgType::UserStopTyping, Payload::Signal(s)) => Some(ChatEvent::StopTyping {
            conversation_id: s.conversation_id,
            sender: s.sender,
        }),
        (MsgType::MessagesRead, Payload::MessagesRead(r)) => Some(ChatEvent::MessagesRead {
            conversation_id: r.conversation_id,
            reader: r.reader,
        }),
        (MsgType::Error, Payload::Error(e)) => Some(ChatEvent::Error {
            code: e.code,
            message: e.message,
        }),
        (MsgType::Shutdown, Payload::Reason(r)) => Some(ChatEvent::Shutdown { reason: r.reason }),
        _ => None,
    }
}

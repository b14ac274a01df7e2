//! Core server: accepts connections, runs the auth handshake, and
//! dispatches chat events.
//!
//! Owns the signing secret, the message store, the presence registry, and
//! the per-conversation locks. Each connection gets one session task; pushes
//! to other connections go through their presence entry's channel.

use crate::config::ServerConfig;
use crate::handshake;
use crate::locks::ConversationLocks;
use crate::presence::{PresenceEntry, PresenceRegistry};
use crate::rate_limit::RateLimiter;
use crate::store::{self, Store};
use crate::transport::{self, WebSocketConnection};
use courier_core::messages::*;
use courier_core::{frame_decode, frame_encode, CourierError, CourierResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// History page size when the client does not ask for one.
const DEFAULT_HISTORY_LIMIT: u32 = 50;
/// Hard ceiling on one history page.
const MAX_HISTORY_LIMIT: u32 = 500;

/// Per-connection context threaded through the session loop.
struct ConnectionContext {
    /// Authenticated identity (phone number).
    identity: String,
    /// Connection id assigned during the handshake.
    connection_id: String,
}

/// The courier server instance.
pub struct CourierServer {
    /// Server configuration.
    config: ServerConfig,
    /// HMAC secret for bearer tokens.
    secret: Vec<u8>,
    /// Message store.
    store: Store,
    /// Who is online, and how to reach them.
    presence: PresenceRegistry,
    /// Per-conversation send serialization.
    conv_locks: ConversationLocks,
    /// Per-IP auth attempt limiter.
    rate_limits: Arc<tokio::sync::Mutex<RateLimiter>>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl CourierServer {
    /// Create a new server instance. Loads (or creates) the signing secret
    /// and opens the message database.
    pub fn new(config: ServerConfig) -> CourierResult<Self> {
        let secret = courier_core::load_or_create_secret(&config.secret_file)?;
        info!(path = %config.secret_file.display(), "signing secret ready");

        let store = Store::open(&config.db_path)?;
        info!(path = %config.db_path.display(), "message database open");

        Ok(Self::assemble(config, secret, store))
    }

    fn assemble(config: ServerConfig, secret: Vec<u8>, store: Store) -> Self {
        let rate_limits = Arc::new(tokio::sync::Mutex::new(RateLimiter::new(
            config.max_auth_attempts,
            config.auth_window_secs,
        )));
        let (shutdown_tx, _) = broadcast::channel(8);
        Self {
            config,
            secret,
            store,
            presence: PresenceRegistry::new(),
            conv_locks: ConversationLocks::new(),
            rate_limits,
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until the listener closes.
    pub async fn run(self) -> CourierResult<()> {
        let bind: SocketAddr = format!("{}:{}", self.config.bind_addr, self.config.port)
            .parse()
            .map_err(|e| CourierError::Other(format!("invalid bind address: {e}")))?;

        let (addr, ws_rx) = transport::start_listener(bind).await?;
        info!(addr = %addr, "courier-server ready");

        self.serve(ws_rx).await
    }

    /// Accept loop. Split from [`run`] so callers can bind port 0 and learn
    /// the address first.
    pub async fn serve(self, mut ws_rx: mpsc::Receiver<WebSocketConnection>) -> CourierResult<()> {
        let server = Arc::new(self);

        // Periodic GC of rate limiter windows and idle conversation locks.
        let gc_rate_limits = server.rate_limits.clone();
        let gc_locks = server.conv_locks.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                gc_rate_limits.lock().await.gc();
                gc_locks.gc().await;
            }
        });

        while let Some(conn) = ws_rx.recv().await {
            let srv = server.clone();
            tokio::spawn(async move {
                if let Err(e) = srv.handle_connection(conn).await {
                    debug!(error = %e, "connection error");
                }
            });
        }

        // Broadcast shutdown to all connected clients.
        info!("listener closed, broadcasting shutdown to connected clients");
        let _ = server.shutdown_tx.send(());

        Ok(())
    }

    /// Run one connection: handshake, presence registration, session loop.
    async fn handle_connection(&self, mut conn: WebSocketConnection) -> CourierResult<()> {
        let remote = conn.remote_addr;
        debug!(remote = %remote, "handling connection");

        let identity =
            match tokio::time::timeout(handshake::HANDSHAKE_TIMEOUT, self.authenticate(&mut conn))
                .await
            {
                Ok(Ok(identity)) => identity,
                Ok(Err(e)) => {
                    warn!(remote = %remote, error = %e, "auth failed");
                    let fail = handshake::build_auth_fail(&e.to_string());
                    let frame = frame_encode(&fail)?;
                    let _ = conn.send_frame(&frame).await;
                    return Err(e);
                }
                Err(_) => {
                    warn!(remote = %remote, "handshake timed out");
                    return Err(CourierError::Timeout);
                }
            };

        let connection_id = handshake::generate_connection_id();
        let ok = handshake::build_auth_ok(&identity, &connection_id);
        let frame = frame_encode(&ok)?;
        conn.send_frame(&frame).await?;

        info!(remote = %remote, identity = %identity, connection_id = %connection_id, "auth OK");

        let (peer_tx, peer_rx) = mpsc::channel::<Envelope>(64);
        let ctx = ConnectionContext {
            identity: identity.clone(),
            connection_id: connection_id.clone(),
        };

        // Register presence; a displaced connection is told why it is
        // going away and its session loop closes on that notice.
        let entry = PresenceEntry {
            connection_id,
            sender: peer_tx,
        };
        if let Some(displaced) = self.presence.register(&identity, entry).await {
            info!(identity = %identity, "displacing previous connection");
            let notice = Envelope {
                msg_type: MsgType::Shutdown,
                payload: Payload::Reason(ReasonPayload {
                    reason: "signed in from another connection".into(),
                }),
            };
            let _ = displaced.sender.try_send(notice);
        }

        let result = self.session_loop(&mut conn, &ctx, peer_rx).await;

        // Cleanup. The unregister is guarded by connection id so a displaced
        // connection unwinding late cannot remove its successor.
        self.presence
            .unregister(&ctx.identity, &ctx.connection_id)
            .await;
        if let Err(e) = self.store.touch_last_seen(&identity, store::now_ms()).await {
            warn!(identity = %identity, error = %e, "failed to update last seen");
        }
        info!(identity = %identity, "connection closed");

        result
    }

    /// Read `Hello`, answer `ServerHello`, read `Auth`, verify the token.
    /// Returns the authenticated identity.
    async fn authenticate(&self, conn: &mut WebSocketConnection) -> CourierResult<String> {
        let hello_bytes = conn
            .recv_frame()
            .await?
            .ok_or_else(|| CourierError::Transport("connection closed before hello".into()))?;
        let envelope: Envelope = frame_decode(&hello_bytes)?;
        let hello = match (&envelope.msg_type, &envelope.payload) {
            (MsgType::Hello, Payload::Hello(h)) => h.clone(),
            _ => {
                return Err(CourierError::Validation(
                    "expected hello as first message".into(),
                ));
            }
        };
        handshake::check_version(&hello)?;

        let server_hello = handshake::build_server_hello();
        let frame = frame_encode(&server_hello)?;
        conn.send_frame(&frame).await?;

        let auth_bytes = conn
            .recv_frame()
            .await?
            .ok_or_else(|| CourierError::Transport("connection closed before auth".into()))?;
        let envelope: Envelope = frame_decode(&auth_bytes)?;
        let auth = match (&envelope.msg_type, &envelope.payload) {
            (MsgType::Auth, Payload::Auth(a)) => a.clone(),
            _ => return Err(CourierError::Auth("expected auth message".into())),
        };

        // Rate limit before any token work.
        {
            let ip = conn.remote_addr.ip();
            let mut limits = self.rate_limits.lock().await;
            if !limits.check(ip) {
                return Err(CourierError::Auth(
                    "rate limited: too many auth attempts".into(),
                ));
            }
        }

        if auth.identity != hello.identity {
            return Err(CourierError::Auth(
                "auth identity does not match hello".into(),
            ));
        }
        handshake::verify_auth(&self.secret, &auth)?;

        // Provision the user row; tokens can be minted before first sign-in.
        self.store
            .upsert_user(&auth.identity, store::now_ms())
            .await?;

        Ok(auth.identity)
    }

    /// Post-auth message loop for one connection.
    async fn session_loop(
        &self,
        conn: &mut WebSocketConnection,
        ctx: &ConnectionContext,
        mut peer_rx: mpsc::Receiver<Envelope>,
    ) -> CourierResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(identity = %ctx.identity, "shutdown signal received, notifying client");
                    let notice = Envelope {
                        msg_type: MsgType::Shutdown,
                        payload: Payload::Reason(ReasonPayload {
                            reason: "server shutdown".into(),
                        }),
                    };
                    let frame = frame_encode(&notice)?;
                    let _ = conn.send_frame(&frame).await;
                    break;
                }

                // Pushes from other connections (deliveries, signals) or a
                // displacement notice from a newer sign-in.
                Some(envelope) = peer_rx.recv() => {
                    let closing = envelope.msg_type == MsgType::Shutdown;
                    let frame = frame_encode(&envelope)?;
                    conn.send_frame(&frame).await?;
                    if closing {
                        debug!(identity = %ctx.identity, "connection displaced");
                        break;
                    }
                }

                ws_result = conn.recv_frame() => {
                    match ws_result {
                        Ok(Some(data)) => {
                            // A bad frame or a failed operation answers the
                            // initiating connection; the session stays up.
                            let reply = match frame_decode::<Envelope>(&data) {
                                Ok(envelope) => match self.dispatch_event(envelope, ctx).await {
                                    Ok(reply) => reply,
                                    Err(e) => {
                                        debug!(identity = %ctx.identity, error = %e, "event failed");
                                        Some(error_envelope(&e))
                                    }
                                },
                                Err(e) => {
                                    debug!(identity = %ctx.identity, error = %e, "undecodable frame");
                                    Some(error_envelope(&e))
                                }
                            };
                            if let Some(reply) = reply {
                                let frame = frame_encode(&reply)?;
                                conn.send_frame(&frame).await?;
                            }
                        }
                        Ok(None) => {
                            debug!(identity = %ctx.identity, "session ended (peer closed)");
                            break;
                        }
                        Err(e) => {
                            debug!(identity = %ctx.identity, error = %e, "session ended");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Dispatch a single decoded event to the appropriate handler.
    async fn dispatch_event(
        &self,
        envelope: Envelope,
        ctx: &ConnectionContext,
    ) -> CourierResult<Option<Envelope>> {
        match (&envelope.msg_type, &envelope.payload) {
            (MsgType::SendMessage, Payload::SendMessage(p)) => {
                self.handle_send_message(ctx, p).await.map(Some)
            }

            (MsgType::Typing, Payload::Typing(p)) => {
                self.relay_typing(ctx, p, MsgType::UserTyping).await;
                Ok(None)
            }
            (MsgType::StopTyping, Payload::Typing(p)) => {
                self.relay_typing(ctx, p, MsgType::UserStopTyping).await;
                Ok(None)
            }

            (MsgType::MarkRead, Payload::Signal(p)) => {
                self.handle_mark_read(ctx, p).await?;
                Ok(None)
            }

            (MsgType::ListConversations, Payload::Empty(_)) => {
                let conversations = self.store.list_conversations(&ctx.identity).await?;
                Ok(Some(Envelope {
                    msg_type: MsgType::Conversations,
                    payload: Payload::Conversations(ConversationsPayload { conversations }),
                }))
            }

            (MsgType::FetchHistory, Payload::FetchHistory(p)) => {
                self.handle_fetch_history(ctx, p).await.map(Some)
            }

            (MsgType::LookupUser, Payload::LookupUser(p)) => {
                self.handle_lookup_user(p).await.map(Some)
            }

            (MsgType::Ping, Payload::PingPong(p)) => Ok(Some(Envelope {
                msg_type: MsgType::Pong,
                payload: Payload::PingPong(PingPongPayload { id: p.id }),
            })),

            (msg_type, _) => Err(CourierError::Validation(format!(
                "unexpected message {msg_type:?} in session"
            ))),
        }
    }

    /// Persist a message and fan it out.
    ///
    /// Order of effects: resolve conversation, insert message, update the
    /// conversation's last message, push to the receiver (if online), ack to
    /// the sender. A failure after the insert leaves the message stored and
    /// reports a persistence error; the sender retrying is the at-least-once
    /// path.
    async fn handle_send_message(
        &self,
        ctx: &ConnectionContext,
        p: &SendMessagePayload,
    ) -> CourierResult<Envelope> {
        if p.text.trim().is_empty() {
            return Err(CourierError::Validation("message text is empty".into()));
        }
        if p.text.len() > self.config.max_text_bytes {
            return Err(CourierError::Validation(format!(
                "message text too long: {} bytes (max {})",
                p.text.len(),
                self.config.max_text_bytes
            )));
        }

        let conversation = match &p.conversation_id {
            Some(id) => {
                let conversation = self
                    .store
                    .get_conversation(id)
                    .await?
                    .ok_or_else(|| CourierError::NotFound(format!("conversation {id} not found")))?;
                // Outsiders learn nothing about conversations they are not in.
                if !conversation.involves(&ctx.identity) {
                    return Err(CourierError::NotFound(format!(
                        "conversation {id} not found"
                    )));
                }
                if conversation.peer_of(&ctx.identity) != p.receiver {
                    return Err(CourierError::Validation(
                        "receiver is not the other participant of this conversation".into(),
                    ));
                }
                conversation
            }
            None => {
                if p.receiver == ctx.identity {
                    return Err(CourierError::Validation("cannot message yourself".into()));
                }
                if self.store.find_user(&p.receiver).await?.is_none() {
                    return Err(CourierError::Validation(format!(
                        "receiver {} not found",
                        p.receiver
                    )));
                }
                self.store
                    .find_or_create_conversation(&ctx.identity, &p.receiver, store::now_ms())
                    .await?
            }
        };

        // Serialize sends within this conversation so storage order matches
        // timestamp order.
        let _guard = self.conv_locks.acquire(&conversation.id).await;

        let now = store::now_ms();
        let message = WireMessage {
            id: store::new_id(),
            conversation_id: conversation.id.clone(),
            sender: ctx.identity.clone(),
            receiver: p.receiver.clone(),
            text: p.text.clone(),
            timestamp_ms: now,
            read: false,
        };

        self.store.insert_message(message.clone()).await?;
        self.store
            .set_last_message(&conversation.id, &message.id, now)
            .await?;

        if let Some(entry) = self.presence.lookup(&p.receiver).await {
            let delivery = Envelope {
                msg_type: MsgType::ReceiveMessage,
                payload: Payload::Delivery(DeliveryPayload {
                    message: message.clone(),
                    conversation_id: conversation.id.clone(),
                }),
            };
            if entry.sender.try_send(delivery).is_err() {
                warn!(receiver = %p.receiver, "receiver push channel full, dropping delivery");
            }
            let notification = Envelope {
                msg_type: MsgType::NewMessageNotification,
                payload: Payload::Signal(SignalPayload {
                    conversation_id: conversation.id.clone(),
                    sender: ctx.identity.clone(),
                }),
            };
            let _ = entry.sender.try_send(notification);
        }

        debug!(
            conversation_id = %conversation.id,
            sender = %ctx.identity,
            receiver = %p.receiver,
            "message stored"
        );

        Ok(Envelope {
            msg_type: MsgType::MessageSent,
            payload: Payload::Delivery(DeliveryPayload {
                message,
                conversation_id: conversation.id,
            }),
        })
    }

    /// Relay a typing indicator. Ephemeral: nothing is stored, offline
    /// receivers simply miss it.
    async fn relay_typing(&self, ctx: &ConnectionContext, p: &TypingPayload, msg_type: MsgType) {
        if let Some(entry) = self.presence.lookup(&p.receiver).await {
            let signal = Envelope {
                msg_type,
                payload: Payload::Signal(SignalPayload {
                    conversation_id: p.conversation_id.clone(),
                    sender: ctx.identity.clone(),
                }),
            };
            let _ = entry.sender.try_send(signal);
        }
    }

    /// Mark messages from `p.sender` to the caller as read, then tell the
    /// sender if anything changed and they are online.
    async fn handle_mark_read(&self, ctx: &ConnectionContext, p: &SignalPayload) -> CourierResult<()> {
        let marked = self
            .store
            .mark_read(&p.conversation_id, &p.sender, &ctx.identity)
            .await?;
        if marked == 0 {
            return Ok(());
        }
        debug!(
            conversation_id = %p.conversation_id,
            reader = %ctx.identity,
            marked,
            "messages marked read"
        );
        if let Some(entry) = self.presence.lookup(&p.sender).await {
            let receipt = Envelope {
                msg_type: MsgType::MessagesRead,
                payload: Payload::MessagesRead(MessagesReadPayload {
                    conversation_id: p.conversation_id.clone(),
                    reader: ctx.identity.clone(),
                }),
            };
            let _ = entry.sender.try_send(receipt);
        }
        Ok(())
    }

    async fn handle_fetch_history(
        &self,
        ctx: &ConnectionContext,
        p: &FetchHistoryPayload,
    ) -> CourierResult<Envelope> {
        let conversation = self
            .store
            .get_conversation(&p.conversation_id)
            .await?
            .ok_or_else(|| {
                CourierError::NotFound(format!("conversation {} not found", p.conversation_id))
            })?;
        if !conversation.involves(&ctx.identity) {
            return Err(CourierError::NotFound(format!(
                "conversation {} not found",
                p.conversation_id
            )));
        }

        let limit = p.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
        let messages = self.store.list_messages(&conversation.id, limit).await?;
        Ok(Envelope {
            msg_type: MsgType::History,
            payload: Payload::History(HistoryPayload {
                conversation_id: conversation.id,
                messages,
            }),
        })
    }

    async fn handle_lookup_user(&self, p: &LookupUserPayload) -> CourierResult<Envelope> {
        let user = self
            .store
            .find_user(&p.identity)
            .await?
            .ok_or_else(|| CourierError::NotFound(format!("user {} not found", p.identity)))?;
        let online = self.presence.is_online(&user.identity).await;
        Ok(Envelope {
            msg_type: MsgType::UserInfo,
            payload: Payload::UserInfo(UserInfoPayload {
                identity: user.identity,
                online,
                last_seen_ms: user.last_seen_ms,
            }),
        })
    }
}

/// Wrap a failed operation for the initiating connection.
fn error_envelope(err: &CourierError) -> Envelope {
    Envelope {
        msg_type: MsgType::Error,
        payload: Payload::Error(ErrorPayload {
            code: err.wire_code(),
            message: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::error::{CODE_NOT_FOUND, CODE_VALIDATION};

    const ALICE: &str = "+15550001111";
    const BOB: &str = "+15550002222";
    const CARA: &str = "+15550003333";

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1".into(),
            port: 0,
            secret_file: std::path::PathBuf::from("/nonexistent"),
            max_auth_attempts: 100,
            auth_window_secs: 60,
            db_path: std::path::PathBuf::from(":memory:"),
            max_text_bytes: 64,
        }
    }

    async fn test_server() -> CourierServer {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(ALICE, 1_000).await.unwrap();
        store.upsert_user(BOB, 1_000).await.unwrap();
        store.upsert_user(CARA, 1_000).await.unwrap();
        CourierServer::assemble(test_config(), courier_core::generate_secret(), store)
    }

    /// Register `identity` in presence and return its push receiver.
    async fn go_online(
        server: &CourierServer,
        identity: &str,
        connection_id: &str,
    ) -> (ConnectionContext, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(16);
        server
            .presence
            .register(
                identity,
                PresenceEntry {
                    connection_id: connection_id.to_string(),
                    sender: tx,
                },
            )
            .await;
        (
            ConnectionContext {
                identity: identity.to_string(),
                connection_id: connection_id.to_string(),
            },
            rx,
        )
    }

    fn send_message(receiver: &str, text: &str, conversation_id: Option<&str>) -> Envelope {
        Envelope {
            msg_type: MsgType::SendMessage,
            payload: Payload::SendMessage(SendMessagePayload {
                receiver: receiver.to_string(),
                text: text.to_string(),
                conversation_id: conversation_id.map(str::to_string),
            }),
        }
    }

    #[tokio::test]
    async fn send_message_delivers_and_acks() {
        let server = test_server().await;
        let (alice, _alice_rx) = go_online(&server, ALICE, "c-alice").await;
        let (_bob, mut bob_rx) = go_online(&server, BOB, "c-bob").await;

        let reply = server
            .dispatch_event(send_message(BOB, "hello bob", None), &alice)
            .await
            .unwrap()
            .unwrap();

        // Sender gets the ack with the server-assigned record.
        assert_eq!(reply.msg_type, MsgType::MessageSent);
        let ack = match reply.payload {
            Payload::Delivery(d) => d,
            other => panic!("expected delivery payload, got {other:?}"),
        };
        assert_eq!(ack.message.sender, ALICE);
        assert_eq!(ack.message.text, "hello bob");
        assert!(ack.message.timestamp_ms > 0);
        assert!(!ack.message.read);

        // Receiver gets the message, then the notification.
        let delivery = bob_rx.recv().await.unwrap();
        assert_eq!(delivery.msg_type, MsgType::ReceiveMessage);
        match delivery.payload {
            Payload::Delivery(d) => {
                assert_eq!(d.message, ack.message);
                assert_eq!(d.conversation_id, ack.conversation_id);
            }
            other => panic!("expected delivery payload, got {other:?}"),
        }

        let notification = bob_rx.recv().await.unwrap();
        assert_eq!(notification.msg_type, MsgType::NewMessageNotification);
        match notification.payload {
            Payload::Signal(s) => {
                assert_eq!(s.sender, ALICE);
                assert_eq!(s.conversation_id, ack.conversation_id);
            }
            other => panic!("expected signal payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_message_offline_receiver_is_stored_only() {
        let server = test_server().await;
        let (alice, _alice_rx) = go_online(&server, ALICE, "c-alice").await;

        let reply = server
            .dispatch_event(send_message(BOB, "you there?", None), &alice)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.msg_type, MsgType::MessageSent);

        // Bob sees it later: one conversation, one unread.
        let conversations = server.store.list_conversations(BOB).await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].unread, 1);
        assert_eq!(conversations[0].peer, ALICE);
    }

    #[tokio::test]
    async fn second_message_reuses_the_conversation() {
        let server = test_server().await;
        let (alice, _alice_rx) = go_online(&server, ALICE, "c-alice").await;
        let (bob, _bob_rx) = go_online(&server, BOB, "c-bob").await;

        server
            .dispatch_event(send_message(BOB, "first", None), &alice)
            .await
            .unwrap();
        // Bob replies without naming the conversation.
        server
            .dispatch_event(send_message(ALICE, "second", None), &bob)
            .await
            .unwrap();

        let conversations = server.store.list_conversations(ALICE).await.unwrap();
        assert_eq!(conversations.len(), 1);
        let messages = server
            .store
            .list_messages(&conversations[0].conversation_id, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn send_with_explicit_conversation_id_updates_last_message() {
        let server = test_server().await;
        let (alice, _alice_rx) = go_online(&server, ALICE, "c-alice").await;

        let first = server
            .dispatch_event(send_message(BOB, "first", None), &alice)
            .await
            .unwrap()
            .unwrap();
        let (conversation_id, first_id) = match first.payload {
            Payload::Delivery(d) => (d.conversation_id, d.message.id),
            other => panic!("expected delivery payload, got {other:?}"),
        };

        let second = server
            .dispatch_event(send_message(BOB, "second", Some(&conversation_id)), &alice)
            .await
            .unwrap()
            .unwrap();
        let ack = match second.payload {
            Payload::Delivery(d) => d,
            other => panic!("expected delivery payload, got {other:?}"),
        };
        assert_eq!(ack.conversation_id, conversation_id);
        assert_ne!(ack.message.id, first_id);

        let conversations = server.store.list_conversations(ALICE).await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(
            conversations[0].last_message.as_ref().unwrap().id,
            ack.message.id
        );
    }

    #[tokio::test]
    async fn send_message_validation_failures() {
        let server = test_server().await;
        let (alice, _rx) = go_online(&server, ALICE, "c-alice").await;

        let unknown = server
            .dispatch_event(send_message("+15559998888", "hi", None), &alice)
            .await
            .unwrap_err();
        assert_eq!(unknown.wire_code(), CODE_VALIDATION);

        let to_self = server
            .dispatch_event(send_message(ALICE, "hi me", None), &alice)
            .await
            .unwrap_err();
        assert_eq!(to_self.wire_code(), CODE_VALIDATION);

        let empty = server
            .dispatch_event(send_message(BOB, "   ", None), &alice)
            .await
            .unwrap_err();
        assert_eq!(empty.wire_code(), CODE_VALIDATION);

        let long = "x".repeat(65);
        let oversize = server
            .dispatch_event(send_message(BOB, &long, None), &alice)
            .await
            .unwrap_err();
        assert_eq!(oversize.wire_code(), CODE_VALIDATION);
    }

    #[tokio::test]
    async fn explicit_conversation_id_is_checked() {
        let server = test_server().await;
        let (alice, _alice_rx) = go_online(&server, ALICE, "c-alice").await;
        let (cara, _cara_rx) = go_online(&server, CARA, "c-cara").await;

        let missing = server
            .dispatch_event(send_message(BOB, "hi", Some("no-such-conv")), &alice)
            .await
            .unwrap_err();
        assert_eq!(missing.wire_code(), CODE_NOT_FOUND);

        // Alice and Bob share a conversation; Cara cannot send into it and
        // cannot learn that it exists.
        let conv = server
            .store
            .find_or_create_conversation(ALICE, BOB, 1_000)
            .await
            .unwrap();
        let outsider = server
            .dispatch_event(send_message(BOB, "hi", Some(&conv.id)), &cara)
            .await
            .unwrap_err();
        assert_eq!(outsider.wire_code(), CODE_NOT_FOUND);

        // Naming the conversation with the wrong receiver is rejected.
        let wrong_receiver = server
            .dispatch_event(send_message(CARA, "hi", Some(&conv.id)), &alice)
            .await
            .unwrap_err();
        assert_eq!(wrong_receiver.wire_code(), CODE_VALIDATION);
    }

    #[tokio::test]
    async fn typing_signals_relay_to_online_receiver() {
        let server = test_server().await;
        let (alice, _alice_rx) = go_online(&server, ALICE, "c-alice").await;
        let (_bob, mut bob_rx) = go_online(&server, BOB, "c-bob").await;

        let typing = Envelope {
            msg_type: MsgType::Typing,
            payload: Payload::Typing(TypingPayload {
                conversation_id: "conv-1".into(),
                receiver: BOB.into(),
            }),
        };
        let reply = server.dispatch_event(typing, &alice).await.unwrap();
        assert!(reply.is_none());

        let signal = bob_rx.recv().await.unwrap();
        assert_eq!(signal.msg_type, MsgType::UserTyping);
        match signal.payload {
            Payload::Signal(s) => assert_eq!(s.sender, ALICE),
            other => panic!("expected signal payload, got {other:?}"),
        }

        let stop = Envelope {
            msg_type: MsgType::StopTyping,
            payload: Payload::Typing(TypingPayload {
                conversation_id: "conv-1".into(),
                receiver: BOB.into(),
            }),
        };
        server.dispatch_event(stop, &alice).await.unwrap();
        let signal = bob_rx.recv().await.unwrap();
        assert_eq!(signal.msg_type, MsgType::UserStopTyping);
    }

    #[tokio::test]
    async fn typing_to_offline_receiver_is_silently_dropped() {
        let server = test_server().await;
        let (alice, _rx) = go_online(&server, ALICE, "c-alice").await;

        let typing = Envelope {
            msg_type: MsgType::Typing,
            payload: Payload::Typing(TypingPayload {
                conversation_id: "conv-1".into(),
                receiver: BOB.into(),
            }),
        };
        let reply = server.dispatch_event(typing, &alice).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn mark_read_notifies_the_sender_once() {
        let server = test_server().await;
        let (alice, mut alice_rx) = go_online(&server, ALICE, "c-alice").await;
        let (bob, mut bob_rx) = go_online(&server, BOB, "c-bob").await;

        let reply = server
            .dispatch_event(send_message(BOB, "read me", None), &alice)
            .await
            .unwrap()
            .unwrap();
        let conversation_id = match reply.payload {
            Payload::Delivery(d) => d.conversation_id,
            other => panic!("expected delivery payload, got {other:?}"),
        };
        bob_rx.recv().await.unwrap();
        bob_rx.recv().await.unwrap();

        let mark_read = Envelope {
            msg_type: MsgType::MarkRead,
            payload: Payload::Signal(SignalPayload {
                conversation_id: conversation_id.clone(),
                sender: ALICE.into(),
            }),
        };
        server.dispatch_event(mark_read.clone(), &bob).await.unwrap();

        let receipt = alice_rx.recv().await.unwrap();
        assert_eq!(receipt.msg_type, MsgType::MessagesRead);
        match receipt.payload {
            Payload::MessagesRead(r) => {
                assert_eq!(r.reader, BOB);
                assert_eq!(r.conversation_id, conversation_id);
            }
            other => panic!("expected messages-read payload, got {other:?}"),
        }

        // A repeat mark has nothing to mark and sends no second receipt.
        server.dispatch_event(mark_read, &bob).await.unwrap();
        assert!(alice_rx.try_recv().is_err());

        // The store agrees.
        let messages = server.store.list_messages(&conversation_id, 10).await.unwrap();
        assert!(messages[0].read);
    }

    #[tokio::test]
    async fn mark_read_by_outsider_is_a_noop() {
        let server = test_server().await;
        let (alice, mut alice_rx) = go_online(&server, ALICE, "c-alice").await;
        let (cara, _cara_rx) = go_online(&server, CARA, "c-cara").await;

        let reply = server
            .dispatch_event(send_message(BOB, "private", None), &alice)
            .await
            .unwrap()
            .unwrap();
        let conversation_id = match reply.payload {
            Payload::Delivery(d) => d.conversation_id,
            other => panic!("expected delivery payload, got {other:?}"),
        };

        let mark_read = Envelope {
            msg_type: MsgType::MarkRead,
            payload: Payload::Signal(SignalPayload {
                conversation_id: conversation_id.clone(),
                sender: ALICE.into(),
            }),
        };
        server.dispatch_event(mark_read, &cara).await.unwrap();

        assert!(alice_rx.try_recv().is_err());
        let messages = server.store.list_messages(&conversation_id, 10).await.unwrap();
        assert!(!messages[0].read);
    }

    #[tokio::test]
    async fn fetch_history_requires_participation() {
        let server = test_server().await;
        let (alice, _alice_rx) = go_online(&server, ALICE, "c-alice").await;
        let (cara, _cara_rx) = go_online(&server, CARA, "c-cara").await;

        server
            .dispatch_event(send_message(BOB, "one", None), &alice)
            .await
            .unwrap();
        server
            .dispatch_event(send_message(BOB, "two", None), &alice)
            .await
            .unwrap();
        let conv = server.store.list_conversations(ALICE).await.unwrap()[0]
            .conversation_id
            .clone();

        let fetch = Envelope {
            msg_type: MsgType::FetchHistory,
            payload: Payload::FetchHistory(FetchHistoryPayload {
                conversation_id: conv.clone(),
                limit: None,
            }),
        };
        let reply = server
            .dispatch_event(fetch.clone(), &alice)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.msg_type, MsgType::History);
        match reply.payload {
            Payload::History(h) => {
                assert_eq!(h.messages.len(), 2);
                assert_eq!(h.messages[0].text, "one");
                assert_eq!(h.messages[1].text, "two");
            }
            other => panic!("expected history payload, got {other:?}"),
        }

        let outsider = server.dispatch_event(fetch, &cara).await.unwrap_err();
        assert_eq!(outsider.wire_code(), CODE_NOT_FOUND);
    }

    #[tokio::test]
    async fn lookup_user_reports_presence() {
        let server = test_server().await;
        let (alice, _rx) = go_online(&server, ALICE, "c-alice").await;

        let lookup = |identity: &str| Envelope {
            msg_type: MsgType::LookupUser,
            payload: Payload::LookupUser(LookupUserPayload {
                identity: identity.to_string(),
            }),
        };

        // Bob exists but is offline.
        let reply = server
            .dispatch_event(lookup(BOB), &alice)
            .await
            .unwrap()
            .unwrap();
        match reply.payload {
            Payload::UserInfo(u) => {
                assert_eq!(u.identity, BOB);
                assert!(!u.online);
                assert_eq!(u.last_seen_ms, Some(1_000));
            }
            other => panic!("expected user info payload, got {other:?}"),
        }

        let (_bob, _bob_rx) = go_online(&server, BOB, "c-bob").await;
        let reply = server
            .dispatch_event(lookup(BOB), &alice)
            .await
            .unwrap()
            .unwrap();
        match reply.payload {
            Payload::UserInfo(u) => assert!(u.online),
            other => panic!("expected user info payload, got {other:?}"),
        }

        let missing = server
            .dispatch_event(lookup("+15550009999"), &alice)
            .await
            .unwrap_err();
        assert_eq!(missing.wire_code(), CODE_NOT_FOUND);
    }

    #[tokio::test]
    async fn ping_answers_pong_with_same_id() {
        let server = test_server().await;
        let (alice, _rx) = go_online(&server, ALICE, "c-alice").await;

        let ping = Envelope {
            msg_type: MsgType::Ping,
            payload: Payload::PingPong(PingPongPayload { id: 7 }),
        };
        let reply = server.dispatch_event(ping, &alice).await.unwrap().unwrap();
        assert_eq!(reply.msg_type, MsgType::Pong);
        match reply.payload {
            Payload::PingPong(p) => assert_eq!(p.id, 7),
            other => panic!("expected ping payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unexpected_message_is_a_validation_error() {
        let server = test_server().await;
        let (alice, _rx) = go_online(&server, ALICE, "c-alice").await;

        // A client must not send server-to-client messages.
        let bogus = Envelope {
            msg_type: MsgType::MessagesRead,
            payload: Payload::MessagesRead(MessagesReadPayload {
                conversation_id: "conv-1".into(),
                reader: ALICE.into(),
            }),
        };
        let err = server.dispatch_event(bogus, &alice).await.unwrap_err();
        assert_eq!(err.wire_code(), CODE_VALIDATION);
    }

    #[tokio::test]
    async fn list_conversations_for_fresh_user_is_empty() {
        let server = test_server().await;
        let (alice, _rx) = go_online(&server, ALICE, "c-alice").await;

        let list = Envelope {
            msg_type: MsgType::ListConversations,
            payload: Payload::Empty(EmptyPayload {}),
        };
        let reply = server.dispatch_event(list, &alice).await.unwrap().unwrap();
        assert_eq!(reply.msg_type, MsgType::Conversations);
        match reply.payload {
            Payload::Conversations(c) => assert!(c.conversations.is_empty()),
            other => panic!("expected conversations payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnected_receiver_gets_no_push() {
        let server = test_server().await;
        let (alice, _alice_rx) = go_online(&server, ALICE, "c-alice").await;
        let (_bob, mut bob_rx) = go_online(&server, BOB, "c-bob").await;

        server.presence.unregister(BOB, "c-bob").await;
        assert!(!server.presence.is_online(BOB).await);

        server
            .dispatch_event(send_message(BOB, "anyone home?", None), &alice)
            .await
            .unwrap();
        assert!(bob_rx.try_recv().is_err());
    }

    // ── Full-stack tests over a real WebSocket ───────────────────────

    use courier_client::{ChatEvent, ConnectConfig, CourierClient};
    use std::time::Duration;

    const EVENT_WAIT: Duration = Duration::from_secs(5);

    /// Start a server on an ephemeral port and return its URL and secret.
    async fn spawn_server(users: &[&str]) -> (String, Vec<u8>) {
        let secret = courier_core::generate_secret();
        let store = Store::open_in_memory().unwrap();
        for user in users {
            store.upsert_user(user, 1_000).await.unwrap();
        }
        let server = CourierServer::assemble(test_config(), secret.clone(), store);

        let (addr, ws_rx) = transport::start_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        tokio::spawn(server.serve(ws_rx));
        (format!("ws://{addr}"), secret)
    }

    async fn connect(url: &str, secret: &[u8], identity: &str) -> CourierClient {
        let token = courier_core::create_token(secret, identity, 60);
        CourierClient::connect(url, ConnectConfig::new(identity, token))
            .await
            .unwrap()
    }

    async fn next_event(client: &CourierClient) -> ChatEvent {
        tokio::time::timeout(EVENT_WAIT, client.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("client disconnected")
    }

    #[tokio::test]
    async fn clients_exchange_messages_over_websocket() {
        let (url, secret) = spawn_server(&[ALICE, BOB]).await;
        let alice = connect(&url, &secret, ALICE).await;
        let bob = connect(&url, &secret, BOB).await;
        assert_eq!(alice.identity(), ALICE);
        assert!(!alice.connection_id().is_empty());

        let ack = alice
            .send_message(BOB, "hello over the wire", None)
            .await
            .unwrap();
        assert_eq!(ack.message.sender, ALICE);
        assert!(ack.message.timestamp_ms > 0);

        // Bob sees the message, then the badge signal.
        match next_event(&bob).await {
            ChatEvent::Message {
                conversation_id,
                message,
            } => {
                assert_eq!(conversation_id, ack.conversation_id);
                assert_eq!(message.text, "hello over the wire");
            }
            other => panic!("expected message event, got {other:?}"),
        }
        assert!(matches!(
            next_event(&bob).await,
            ChatEvent::Notification { .. }
        ));

        // Bob marks the conversation read; Alice gets the receipt.
        bob.mark_read(&ack.conversation_id, ALICE).await.unwrap();
        match next_event(&alice).await {
            ChatEvent::MessagesRead { reader, .. } => assert_eq!(reader, BOB),
            other => panic!("expected read receipt, got {other:?}"),
        }

        let history = bob.fetch_history(&ack.conversation_id, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].read);

        let conversations = bob.list_conversations().await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].peer, ALICE);
        assert_eq!(conversations[0].unread, 0);

        let who = alice.lookup_user(BOB).await.unwrap();
        assert!(who.online);

        bob.disconnect().await;
        alice.disconnect().await;
    }

    #[tokio::test]
    async fn server_errors_reach_the_requesting_client() {
        let (url, secret) = spawn_server(&[ALICE]).await;
        let alice = connect(&url, &secret, ALICE).await;

        let err = alice
            .send_message("+15559990000", "anyone there?", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Validation(_)));

        // The connection survives the error.
        assert!(alice.is_connected().await);
        let who = alice.lookup_user(ALICE).await.unwrap();
        assert!(who.online);
    }

    #[tokio::test]
    async fn bad_token_is_rejected_over_websocket() {
        let (url, _secret) = spawn_server(&[ALICE]).await;

        let other_secret = courier_core::generate_secret();
        let token = courier_core::create_token(&other_secret, ALICE, 60);
        let err = CourierClient::connect(&url, ConnectConfig::new(ALICE, token))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Auth(_)));
    }

    #[tokio::test]
    async fn second_login_displaces_the_first() {
        let (url, secret) = spawn_server(&[ALICE]).await;

        let first = connect(&url, &secret, ALICE).await;
        let second = connect(&url, &secret, ALICE).await;
        assert_ne!(first.connection_id(), second.connection_id());

        match next_event(&first).await {
            ChatEvent::Shutdown { reason } => assert!(reason.contains("another connection")),
            other => panic!("expected shutdown event, got {other:?}"),
        }
        assert!(matches!(next_event(&first).await, ChatEvent::Disconnected));

        // The second connection is the live one.
        let who = second.lookup_user(ALICE).await.unwrap();
        assert!(who.online);
    }
}

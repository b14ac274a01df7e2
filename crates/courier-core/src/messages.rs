//! courier protocol control message types.
//!
//! Every control message is an [`Envelope`]: a numeric `type` tag plus a
//! payload flattened beside it. Payloads are CBOR maps; the payload enum is
//! untagged, so variant order below is load-bearing: variants with more
//! required fields come first, single-required-field variants near the end,
//! and the empty payload last.

use serde::{Deserialize, Serialize};

/// Numeric message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MsgType {
    Hello = 0x01,
    ServerHello = 0x02,
    Auth = 0x03,
    AuthOk = 0x04,
    AuthFail = 0x05,

    SendMessage = 0x10,
    MessageSent = 0x11,
    ReceiveMessage = 0x12,
    NewMessageNotification = 0x13,
    Typing = 0x14,
    StopTyping = 0x15,
    UserTyping = 0x16,
    UserStopTyping = 0x17,
    MarkRead = 0x18,
    MessagesRead = 0x19,

    Error = 0x20,
    Ping = 0x21,
    Pong = 0x22,
    Shutdown = 0x23,

    ListConversations = 0x30,
    Conversations = 0x31,
    FetchHistory = 0x32,
    History = 0x33,
    LookupUser = 0x34,
    UserInfo = 0x35,
}

impl From<MsgType> for u8 {
    fn from(m: MsgType) -> u8 {
        m as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::ServerHello),
            0x03 => Ok(Self::Auth),
            0x04 => Ok(Self::AuthOk),
            0x05 => Ok(Self::AuthFail),
            0x10 => Ok(Self::SendMessage),
            0x11 => Ok(Self::MessageSent),
            0x12 => Ok(Self::ReceiveMessage),
            0x13 => Ok(Self::NewMessageNotification),
            0x14 => Ok(Self::Typing),
            0x15 => Ok(Self::StopTyping),
            0x16 => Ok(Self::UserTyping),
            0x17 => Ok(Self::UserStopTyping),
            0x18 => Ok(Self::MarkRead),
            0x19 => Ok(Self::MessagesRead),
            0x20 => Ok(Self::Error),
            0x21 => Ok(Self::Ping),
            0x22 => Ok(Self::Pong),
            0x23 => Ok(Self::Shutdown),
            0x30 => Ok(Self::ListConversations),
            0x31 => Ok(Self::Conversations),
            0x32 => Ok(Self::FetchHistory),
            0x33 => Ok(Self::History),
            0x34 => Ok(Self::LookupUser),
            0x35 => Ok(Self::UserInfo),
            _ => Err(format!("unknown message type: 0x{v:02x}")),
        }
    }
}

/// Protocol version string.
pub const PROTOCOL_VERSION: &str = "courier-v1";

// ── Message payloads ──────────────────────────────────────────────────

/// Envelope: every control message has a `type` plus a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MsgType,

    #[serde(flatten)]
    pub payload: Payload,
}

/// All possible message payloads (untagged for CBOR compatibility).
///
/// Some payloads serve several message types: `Delivery` backs both
/// `MessageSent` and `ReceiveMessage`, `Signal` backs
/// `NewMessageNotification`/`UserTyping`/`UserStopTyping`/`MarkRead`,
/// `Typing` backs `Typing`/`StopTyping`, `Reason` backs
/// `AuthFail`/`Shutdown`, and `PingPong` backs `Ping`/`Pong`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Delivery(DeliveryPayload),
    SendMessage(SendMessagePayload),
    Auth(AuthPayload),
    AuthOk(AuthOkPayload),
    Hello(HelloPayload),
    UserInfo(UserInfoPayload),
    Error(ErrorPayload),
    History(HistoryPayload),
    Conversations(ConversationsPayload),
    Typing(TypingPayload),
    Signal(SignalPayload),
    MessagesRead(MessagesReadPayload),
    PingPong(PingPongPayload),
    Reason(ReasonPayload),
    ServerHello(ServerHelloPayload),
    FetchHistory(FetchHistoryPayload),
    LookupUser(LookupUserPayload),
    Empty(EmptyPayload),
}

// ── Shared wire records ───────────────────────────────────────────────

/// A persisted message as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender: String,
    pub receiver: String,
    pub text: String,
    /// Server-assigned, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub read: bool,
}

/// One row of a conversation listing: counterpart, last message, unread count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    /// The other participant's identity.
    pub peer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<WireMessage>,
    /// Messages addressed to the caller that are still unread.
    pub unread: u64,
    pub updated_at_ms: u64,
}

// ── Individual payload structs ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmptyPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPongPayload {
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub version: String,
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHelloPayload {
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub identity: String,
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOkPayload {
    pub identity: String,
    pub connection_id: String,
}

/// Carried by `AuthFail` and `Shutdown`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub receiver: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Carried by `MessageSent` (ack to the sender) and `ReceiveMessage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub message: WireMessage,
    pub conversation_id: String,
}

/// Carried by `Typing` and `StopTyping` (client → server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingPayload {
    pub conversation_id: String,
    pub receiver: String,
}

/// Carried by `NewMessageNotification`, `UserTyping`, `UserStopTyping`
/// (server → client, `sender` = originating identity) and `MarkRead`
/// (client → server, `sender` = whose messages the caller has read).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPayload {
    pub conversation_id: String,
    pub sender: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesReadPayload {
    pub conversation_id: String,
    pub reader: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationsPayload {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchHistoryPayload {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPayload {
    pub conversation_id: String,
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupUserPayload {
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfoPayload {
    pub identity: String,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_ms: Option<u64>,
}

// ── Helper for bytes serde ────────────────────────────────────────────

mod serde_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buf: ByteBuf = Deserialize::deserialize(deserializer)?;
        Ok(buf.into_vec())
    }

    #[derive(Debug)]
    pub struct ByteBuf(Vec<u8>);

    impl ByteBuf {
        pub fn into_vec(self) -> Vec<u8> {
            self.0
        }
    }

    impl<'de> Deserialize<'de> for ByteBuf {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct ByteBufVisitor;

            impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
                type Value = ByteBuf;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("bytes")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v.to_vec()))
                }

                fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v))
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let mut bytes = Vec::new();
                    while let Some(b) = seq.next_element::<u8>()? {
                        bytes.push(b);
                    }
                    Ok(ByteBuf(bytes))
                }
            }

            deserializer.deserialize_bytes(ByteBufVisitor)
        }
    }
}

//! Wire-level message sets and DTOs.
//!
//! Both directions are closed sets of tagged variants serialized as
//! named-field MessagePack. Inbound messages are tagged by `type`, outbound
//! events by `event` with the payload under `data`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ephemeral id of a live socket, minted on connect.
pub type ConnId = Uuid;

/// Opaque user identity, owned by the external identity system.
pub type UserId = String;

/// A named broadcast group. Conversation rooms are keyed by chat id,
/// personal rooms by user identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn chat(chat_id: &str) -> Self {
        Self(format!("chat:{chat_id}"))
    }

    pub fn user(user_id: &str) -> Self {
        Self(format!("user:{user_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Inbound (client → server)
// ---------------------------------------------------------------------------

/// Everything a client may send over the socket.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Attach an identity to this connection.
    Setup { token: String },
    /// Join a conversation room.
    JoinRoom { room_id: String },
    Typing { room_id: String },
    StopTyping { room_id: String },
    CallInitiate {
        target: UserId,
        signal: serde_json::Value,
        caller_name: String,
        call_type: String,
    },
    CallAccept {
        target: UserId,
        signal: serde_json::Value,
    },
    Signal {
        target: UserId,
        signal: serde_json::Value,
    },
    CallEnd { target: UserId },
}

// ---------------------------------------------------------------------------
// Outbound (server → client)
// ---------------------------------------------------------------------------

/// Everything the server may emit to a client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Ack of a successful setup.
    Connected { user_id: UserId },
    OnlineIdentities { users: Vec<UserId> },
    NewConversation { chat: ChatDto },
    AddedToGroup { chat: ChatDto },
    GroupUpdated { chat: ChatDto },
    RemovedFromGroup {
        chat_id: String,
        name: Option<String>,
    },
    UserLeftGroup { chat: ChatDto },
    GroupDeleted {
        chat_id: String,
        name: Option<String>,
    },
    MessageReceived { message: MessageDto },
    LatestMessageUpdated { message: MessageDto },
    Typing { room_id: String },
    StopTyping { room_id: String },
    CallIncoming {
        signal: serde_json::Value,
        from: UserId,
        name: String,
        call_type: String,
    },
    CallAccepted {
        signal: serde_json::Value,
        from: UserId,
    },
    Signal {
        signal: serde_json::Value,
        from: UserId,
    },
    CallEnded { from: UserId },
    Error { message: String },
}

impl ServerEvent {
    /// Serialize once; broadcasts reuse the same bytes for every recipient.
    pub fn encode(&self) -> Vec<u8> {
        rmp_serde::to_vec_named(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MemberDto {
    pub id: UserId,
    /// Display name from the identity directory; None when enrichment was
    /// unavailable.
    pub name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatDto {
    pub id: String,
    pub is_group: bool,
    pub name: Option<String>,
    pub admin: Option<UserId>,
    pub about: Option<String>,
    pub picture: Option<String>,
    pub members: Vec<MemberDto>,
    pub latest_message: Option<MessageDto>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MessageDto {
    pub id: String,
    pub chat_id: String,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: i64,
}

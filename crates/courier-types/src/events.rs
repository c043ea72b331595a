use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageKind, ReadReceipt};

/// A message as it travels to clients, over the gateway and from the
/// history endpoints. Exactly one of `recipient` / `group` is set.
///
/// Once `deleted` is true the content has already been masked; the raw
/// text never leaves the store again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: Uuid,
    pub sender: Uuid,
    pub sender_username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Uuid>,
    pub content: String,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_snippet: Option<String>,
    pub reactions: HashMap<String, Vec<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub read_by: Vec<ReadReceipt>,
    pub edited: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Events sent from the server to clients over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// Terminal response to a command that carried a `seq`
    Ack {
        seq: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<AckError>,
    },

    /// Full snapshot of currently online identities, sent to everyone
    /// on every presence transition
    UsersUpdated { online: Vec<Uuid> },

    NewMessage { message: MessagePayload },

    MessageEdited { message_id: Uuid, content: String },

    MessageDeleted { message_id: Uuid },

    /// An ephemeral message passed its expiry and was purged
    MessageExpired { message_id: Uuid },

    /// Reaction state after a toggle — the complete map, not a delta
    ReactionUpdated {
        message_id: Uuid,
        reactions: HashMap<String, Vec<Uuid>>,
    },

    Typing {
        from: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        group: Option<Uuid>,
    },

    StopTyping {
        from: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        group: Option<Uuid>,
    },

    CallOffer { from: Uuid, payload: serde_json::Value },

    CallAnswer { from: Uuid, payload: serde_json::Value },

    CallIceCandidate { from: Uuid, payload: serde_json::Value },

    CallEnd {
        from: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Structured failure carried inside an ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckError {
    pub code: String,
    pub message: String,
}

/// Commands sent from clients to the server over the WebSocket gateway.
///
/// Commands carrying a `seq` always receive a terminal `Ack`; the rest
/// are fire-and-forget and get nothing back, not even on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    SendMessage {
        seq: u64,
        recipient: Uuid,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        file_url: Option<String>,
        #[serde(default)]
        reply_to: Option<Uuid>,
        #[serde(default)]
        ttl_secs: Option<i64>,
    },

    SendGroupMessage {
        seq: u64,
        group: Uuid,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        file_url: Option<String>,
        #[serde(default)]
        reply_to: Option<Uuid>,
        #[serde(default)]
        ttl_secs: Option<i64>,
    },

    EditMessage {
        seq: u64,
        message_id: Uuid,
        content: String,
    },

    DeleteMessage { seq: u64, message_id: Uuid },

    AddReaction {
        seq: u64,
        message_id: Uuid,
        emoji: String,
    },

    /// Bulk-mark every unread direct message from `partner` as read
    MarkRead { seq: u64, partner: Uuid },

    /// Append the caller to the reader set of every group message they
    /// have not read yet
    MarkGroupRead { seq: u64, group: Uuid },

    Typing {
        #[serde(default)]
        recipient: Option<Uuid>,
        #[serde(default)]
        group: Option<Uuid>,
    },

    StopTyping {
        #[serde(default)]
        recipient: Option<Uuid>,
        #[serde(default)]
        group: Option<Uuid>,
    },

    CallOffer { callee: Uuid, payload: serde_json::Value },

    CallAnswer { caller: Uuid, payload: serde_json::Value },

    CallIceCandidate { to: Uuid, payload: serde_json::Value },

    CallEnd { to: Uuid },
}

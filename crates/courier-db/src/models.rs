//! Database row types — these map directly to SQLite rows.
//! Distinct from the courier-types wire models so the DB layer stays
//! independent of serialization concerns.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub name: String,
    pub avatar: Option<String>,
    pub created_at: String,
}

pub struct GroupRow {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub recipient_id: Option<String>,
    pub group_id: Option<String>,
    pub content: String,
    pub kind: String,
    pub file_url: Option<String>,
    pub reply_to: Option<String>,
    pub reply_snippet: Option<String>,
    pub expires_at: Option<String>,
    pub read: bool,
    pub read_at: Option<String>,
    pub edited: bool,
    pub deleted: bool,
    pub created_at: String,
}

pub struct NewMessage<'a> {
    pub id: &'a str,
    pub sender_id: &'a str,
    pub recipient_id: Option<&'a str>,
    pub group_id: Option<&'a str>,
    pub content: &'a str,
    pub kind: &'a str,
    pub file_url: Option<&'a str>,
    pub reply_to: Option<&'a str>,
    pub reply_snippet: Option<&'a str>,
    pub expires_at: Option<&'a str>,
    pub created_at: &'a str,
}

pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
}

pub struct ReceiptRow {
    pub message_id: String,
    pub user_id: String,
    pub read_at: String,
}

pub struct ContactRow {
    pub id: String,
    pub username: String,
    pub name: String,
    pub avatar: Option<String>,
    pub last_message: Option<String>,
    pub unread_count: u64,
}

/// What the expiry sweep needs to route deletion notices.
pub struct ExpiredRow {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub group_id: Option<String>,
}

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use tracing::warn;
use uuid::Uuid;

use courier_db::Database;
use courier_db::models::{MessageRow, NewMessage};
use courier_types::error::DispatchError;
use courier_types::events::{MessagePayload, ServerEvent};
use courier_types::models::{MAX_CONTENT_LEN, MessageKind, REPLY_SNIPPET_LEN, ReadReceipt};

use crate::registry::Registry;

/// Validated input for a single send, shared by the direct and group
/// paths.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub content: String,
    pub kind: MessageKind,
    pub file_url: Option<String>,
    pub reply_to: Option<Uuid>,
    pub ttl_secs: Option<i64>,
}

/// Validates, persists, and fans out messages and their mutations.
///
/// Persistence always completes before any live delivery is attempted,
/// so a crash between the two can cost a client a live update but never
/// a message. The registry lock is never held across store I/O; store
/// work runs on the blocking pool and pushes happen afterwards.
#[derive(Clone)]
pub struct Engine {
    db: Arc<Database>,
    registry: Registry,
}

impl Engine {
    pub fn new(db: Arc<Database>, registry: Registry) -> Self {
        Self { db, registry }
    }

    /// Send a direct message. The recipient must exist; whether they are
    /// online only decides delivery, never success.
    pub async fn send_direct(
        &self,
        sender: Uuid,
        sender_username: &str,
        recipient: Uuid,
        outgoing: Outgoing,
    ) -> Result<MessagePayload, DispatchError> {
        let content = validate_content(&outgoing.content)?;
        let expires_at = expiry_from_ttl(outgoing.ttl_secs)?;

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let sender_username = sender_username.to_string();

        let payload = self
            .blocking(move |db| {
                if db.get_user_by_id(&recipient.to_string())?.is_none() {
                    return Err(DispatchError::NotFound("recipient"));
                }
                let reply_snippet = reply_snippet(db, outgoing.reply_to)?;

                db.insert_message(&NewMessage {
                    id: &id.to_string(),
                    sender_id: &sender.to_string(),
                    recipient_id: Some(&recipient.to_string()),
                    group_id: None,
                    content: &content,
                    kind: outgoing.kind.as_str(),
                    file_url: outgoing.file_url.as_deref(),
                    reply_to: outgoing.reply_to.map(|r| r.to_string()).as_deref(),
                    reply_snippet: reply_snippet.as_deref(),
                    expires_at: expires_at.map(courier_db::timestamp).as_deref(),
                    created_at: &courier_db::timestamp(created_at),
                })?;

                Ok(MessagePayload {
                    id,
                    sender,
                    sender_username,
                    recipient: Some(recipient),
                    group: None,
                    content,
                    kind: outgoing.kind,
                    file_url: outgoing.file_url,
                    reply_to: outgoing.reply_to,
                    reply_snippet,
                    reactions: HashMap::new(),
                    expires_at,
                    read: false,
                    read_at: None,
                    read_by: vec![],
                    edited: false,
                    deleted: false,
                    created_at,
                })
            })
            .await?;

        // Push to the recipient if online, and echo to the sender's own
        // connection so other tabs see the send without a refetch.
        let event = ServerEvent::NewMessage {
            message: payload.clone(),
        };
        self.registry.push_many(&[recipient, sender], event).await;

        Ok(payload)
    }

    /// Send to a group. Every current member gets the push, the sender
    /// included — members are treated symmetrically.
    pub async fn send_group(
        &self,
        sender: Uuid,
        sender_username: &str,
        group: Uuid,
        outgoing: Outgoing,
    ) -> Result<MessagePayload, DispatchError> {
        let content = validate_content(&outgoing.content)?;
        let expires_at = expiry_from_ttl(outgoing.ttl_secs)?;

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let sender_username = sender_username.to_string();

        let (payload, members) = self
            .blocking(move |db| {
                let gid = group.to_string();
                if db.get_group(&gid)?.is_none() {
                    return Err(DispatchError::NotFound("group"));
                }
                if !db.is_member(&gid, &sender.to_string())? {
                    return Err(DispatchError::Forbidden("sender is not a group member"));
                }
                let members = db.get_group_members(&gid)?;
                let reply_snippet = reply_snippet(db, outgoing.reply_to)?;

                db.insert_message(&NewMessage {
                    id: &id.to_string(),
                    sender_id: &sender.to_string(),
                    recipient_id: None,
                    group_id: Some(&gid),
                    content: &content,
                    kind: outgoing.kind.as_str(),
                    file_url: outgoing.file_url.as_deref(),
                    reply_to: outgoing.reply_to.map(|r| r.to_string()).as_deref(),
                    reply_snippet: reply_snippet.as_deref(),
                    expires_at: expires_at.map(courier_db::timestamp).as_deref(),
                    created_at: &courier_db::timestamp(created_at),
                })?;

                let payload = MessagePayload {
                    id,
                    sender,
                    sender_username,
                    recipient: None,
                    group: Some(group),
                    content,
                    kind: outgoing.kind,
                    file_url: outgoing.file_url,
                    reply_to: outgoing.reply_to,
                    reply_snippet,
                    reactions: HashMap::new(),
                    expires_at,
                    read: false,
                    read_at: None,
                    read_by: vec![],
                    edited: false,
                    deleted: false,
                    created_at,
                };
                Ok((payload, parse_ids(&members)))
            })
            .await?;

        let event = ServerEvent::NewMessage {
            message: payload.clone(),
        };
        self.registry.push_many(&members, event).await;

        Ok(payload)
    }

    /// Overwrite a message's content. Sender-only; the prior content is
    /// kept in the edit history and the edited flag never reverts.
    pub async fn edit(
        &self,
        actor: Uuid,
        message_id: Uuid,
        content: String,
    ) -> Result<(), DispatchError> {
        let content = validate_content(&content)?;
        let pushed_content = content.clone();

        let audience = self
            .blocking(move |db| {
                let row = require_message(db, message_id)?;
                if row.sender_id != actor.to_string() {
                    return Err(DispatchError::Forbidden("only the sender can edit a message"));
                }
                db.edit_message(&row.id, &content, &courier_db::now())?;
                audience_of(db, &row)
            })
            .await?;

        self.registry
            .push_many(
                &audience,
                ServerEvent::MessageEdited {
                    message_id,
                    content: pushed_content,
                },
            )
            .await;
        Ok(())
    }

    /// Soft-delete. Sender-only. Content stays in the store for the
    /// edit-history audit trail but is masked on every read path.
    pub async fn delete(&self, actor: Uuid, message_id: Uuid) -> Result<(), DispatchError> {
        let audience = self
            .blocking(move |db| {
                let row = require_message(db, message_id)?;
                if row.sender_id != actor.to_string() {
                    return Err(DispatchError::Forbidden(
                        "only the sender can delete a message",
                    ));
                }
                db.mark_deleted(&row.id)?;
                audience_of(db, &row)
            })
            .await?;

        self.registry
            .push_many(&audience, ServerEvent::MessageDeleted { message_id })
            .await;
        Ok(())
    }

    /// Toggle the actor's membership in one emoji's reaction set.
    /// Applying the same emoji twice restores the prior state.
    pub async fn toggle_reaction(
        &self,
        actor: Uuid,
        message_id: Uuid,
        emoji: String,
    ) -> Result<(), DispatchError> {
        let emoji = emoji.trim().to_string();
        if emoji.is_empty() {
            return Err(DispatchError::Validation("emoji is required".into()));
        }

        let (audience, reactions) = self
            .blocking(move |db| {
                let row = require_message(db, message_id)?;
                authorize_participant(db, &row, actor)?;

                db.toggle_reaction(
                    &Uuid::new_v4().to_string(),
                    &row.id,
                    &actor.to_string(),
                    &emoji,
                    &courier_db::now(),
                )?;

                let reactions = reaction_map(db, &row.id)?;
                Ok((audience_of(db, &row)?, reactions))
            })
            .await?;

        self.registry
            .push_many(
                &audience,
                ServerEvent::ReactionUpdated {
                    message_id,
                    reactions,
                },
            )
            .await;
        Ok(())
    }

    /// Bulk-mark every unread direct message from `partner` as read.
    /// Idempotent; read state is pulled on demand, never pushed.
    pub async fn mark_read(&self, actor: Uuid, partner: Uuid) -> Result<(), DispatchError> {
        self.blocking(move |db| {
            db.mark_direct_read(&partner.to_string(), &actor.to_string(), &courier_db::now())?;
            Ok(())
        })
        .await
    }

    /// Append the actor to the reader set of each group message they
    /// have not read. Idempotent; not broadcast.
    pub async fn mark_group_read(&self, actor: Uuid, group: Uuid) -> Result<(), DispatchError> {
        self.blocking(move |db| {
            let gid = group.to_string();
            if db.get_group(&gid)?.is_none() {
                return Err(DispatchError::NotFound("group"));
            }
            if !db.is_member(&gid, &actor.to_string())? {
                return Err(DispatchError::Forbidden("not a group member"));
            }
            db.mark_group_read(&gid, &actor.to_string(), &courier_db::now())?;
            Ok(())
        })
        .await
    }

    /// Relay a typing indicator. Fire-and-forget: membership failures
    /// and offline targets drop the event silently.
    pub async fn relay_typing(
        &self,
        from: Uuid,
        recipient: Option<Uuid>,
        group: Option<Uuid>,
        stop: bool,
    ) {
        match (recipient, group) {
            (Some(recipient), None) => {
                let event = typing_event(from, None, stop);
                self.registry.push(recipient, event).await;
            }
            (None, Some(group)) => {
                let members = self
                    .blocking(move |db| {
                        let gid = group.to_string();
                        if !db.is_member(&gid, &from.to_string())? {
                            return Ok(None);
                        }
                        Ok(Some(parse_ids(&db.get_group_members(&gid)?)))
                    })
                    .await;

                if let Ok(Some(members)) = members {
                    let targets: Vec<Uuid> =
                        members.into_iter().filter(|m| *m != from).collect();
                    let event = typing_event(from, Some(group), stop);
                    self.registry.push_many(&targets, event).await;
                }
            }
            _ => {} // malformed target, drop
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, DispatchError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| DispatchError::Storage(anyhow!("store task failed: {e}")))?
    }
}

fn typing_event(from: Uuid, group: Option<Uuid>, stop: bool) -> ServerEvent {
    if stop {
        ServerEvent::StopTyping { from, group }
    } else {
        ServerEvent::Typing { from, group }
    }
}

fn validate_content(content: &str) -> Result<String, DispatchError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(DispatchError::Validation("content is required".into()));
    }
    if trimmed.chars().count() > MAX_CONTENT_LEN {
        return Err(DispatchError::Validation(format!(
            "content exceeds {} characters",
            MAX_CONTENT_LEN
        )));
    }
    Ok(trimmed.to_string())
}

fn expiry_from_ttl(ttl_secs: Option<i64>) -> Result<Option<DateTime<Utc>>, DispatchError> {
    match ttl_secs {
        None => Ok(None),
        Some(secs) if secs <= 0 => {
            Err(DispatchError::Validation("ttl must be positive".into()))
        }
        Some(secs) => Ok(Some(Utc::now() + Duration::seconds(secs))),
    }
}

/// Point-in-time snippet of the replied-to message. Missing or deleted
/// originals yield no snippet; the reference itself is still kept.
fn reply_snippet(db: &Database, reply_to: Option<Uuid>) -> Result<Option<String>, DispatchError> {
    let Some(reply_to) = reply_to else {
        return Ok(None);
    };
    let Some(original) = db.get_message(&reply_to.to_string())? else {
        return Ok(None);
    };
    if original.deleted {
        return Ok(None);
    }
    Ok(Some(
        original.content.chars().take(REPLY_SNIPPET_LEN).collect(),
    ))
}

fn require_message(db: &Database, message_id: Uuid) -> Result<MessageRow, DispatchError> {
    db.get_message(&message_id.to_string())?
        .ok_or(DispatchError::NotFound("message"))
}

/// Everyone who can see `row`: both direct parties, or the group's
/// current members.
fn audience_of(db: &Database, row: &MessageRow) -> Result<Vec<Uuid>, DispatchError> {
    if let Some(group_id) = &row.group_id {
        return Ok(parse_ids(&db.get_group_members(group_id)?));
    }
    let mut audience = vec![parse_id(&row.sender_id)];
    if let Some(recipient) = &row.recipient_id {
        audience.push(parse_id(recipient));
    }
    Ok(audience)
}

fn authorize_participant(
    db: &Database,
    row: &MessageRow,
    actor: Uuid,
) -> Result<(), DispatchError> {
    if let Some(group_id) = &row.group_id {
        if !db.is_member(group_id, &actor.to_string())? {
            return Err(DispatchError::Forbidden("not a group member"));
        }
        return Ok(());
    }
    let actor = actor.to_string();
    if row.sender_id != actor && row.recipient_id.as_deref() != Some(actor.as_str()) {
        return Err(DispatchError::Forbidden(
            "not a participant in this conversation",
        ));
    }
    Ok(())
}

fn reaction_map(db: &Database, message_id: &str) -> Result<HashMap<String, Vec<Uuid>>, DispatchError> {
    let mut map: HashMap<String, Vec<Uuid>> = HashMap::new();
    for row in db.reactions_for_message(message_id)? {
        map.entry(row.emoji).or_default().push(parse_id(&row.user_id));
    }
    Ok(map)
}

fn parse_ids(ids: &[String]) -> Vec<Uuid> {
    ids.iter().map(|id| parse_id(id)).collect()
}

fn parse_id(id: &str) -> Uuid {
    id.parse().unwrap_or_else(|e| {
        warn!("corrupt id '{}' in store: {}", id, e);
        Uuid::default()
    })
}

/// Build the client-facing form of a stored message. This is the single
/// place where soft-deleted content gets masked — once the deleted flag
/// is set, the raw text never reaches a client again.
pub fn payload_from_row(
    row: MessageRow,
    reactions: HashMap<String, Vec<Uuid>>,
    read_by: Vec<ReadReceipt>,
) -> MessagePayload {
    let content = if row.deleted {
        String::new()
    } else {
        row.content
    };

    MessagePayload {
        id: parse_id(&row.id),
        sender: parse_id(&row.sender_id),
        sender_username: row.sender_username,
        recipient: row.recipient_id.as_deref().map(parse_id),
        group: row.group_id.as_deref().map(parse_id),
        content,
        kind: MessageKind::parse(&row.kind),
        file_url: row.file_url,
        reply_to: row.reply_to.as_deref().map(parse_id),
        reply_snippet: row.reply_snippet,
        reactions,
        expires_at: row
            .expires_at
            .as_deref()
            .map(courier_db::parse_timestamp),
        read: row.read,
        read_at: row.read_at.as_deref().map(courier_db::parse_timestamp),
        read_by,
        edited: row.edited,
        deleted: row.deleted,
        created_at: courier_db::parse_timestamp(&row.created_at),
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    struct Fixture {
        db: Arc<Database>,
        registry: Registry,
        engine: Engine,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = Registry::new();
        let engine = Engine::new(db.clone(), registry.clone());
        Fixture {
            db,
            registry,
            engine,
        }
    }

    fn add_user(db: &Database, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), username, "hash", username, &courier_db::now())
            .unwrap();
        id
    }

    fn add_group(db: &Database, name: &str, creator: Uuid, members: &[Uuid]) -> Uuid {
        let id = Uuid::new_v4();
        let member_ids: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        db.create_group(
            &id.to_string(),
            name,
            None,
            &creator.to_string(),
            &member_ids,
            &courier_db::now(),
        )
        .unwrap();
        id
    }

    async fn connect(
        registry: &Registry,
        user: Uuid,
    ) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(user, tx).await;
        rx
    }

    /// Presence snapshots arrive on every registration; skip past them.
    fn drain_presence(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) {
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, ServerEvent::UsersUpdated { .. }));
        }
    }

    fn text(content: &str) -> Outgoing {
        Outgoing {
            content: content.into(),
            kind: MessageKind::Text,
            file_url: None,
            reply_to: None,
            ttl_secs: None,
        }
    }

    #[tokio::test]
    async fn offline_recipient_still_succeeds() {
        let f = fixture();
        let alice = add_user(&f.db, "alice");
        let bob = add_user(&f.db, "bob");

        let payload = f
            .engine
            .send_direct(alice, "alice", bob, text("hi"))
            .await
            .unwrap();

        assert_eq!(payload.recipient, Some(bob));
        assert!(!payload.read);

        // retrievable via history even though nothing was pushed
        let history = f
            .db
            .direct_history(&alice.to_string(), &bob.to_string(), 50, 0, &courier_db::now())
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn validation_precedes_target_lookup() {
        let f = fixture();
        let alice = add_user(&f.db, "alice");
        let nobody = Uuid::new_v4();

        // empty content against a missing target reports the content problem
        let err = f
            .engine
            .send_direct(alice, "alice", nobody, text("   "))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");

        let err = f
            .engine
            .send_direct(alice, "alice", nobody, text("hello"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not-found");
    }

    #[tokio::test]
    async fn oversized_content_is_rejected() {
        let f = fixture();
        let alice = add_user(&f.db, "alice");
        let bob = add_user(&f.db, "bob");

        let long = "x".repeat(MAX_CONTENT_LEN + 1);
        let err = f
            .engine
            .send_direct(alice, "alice", bob, text(&long))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn direct_send_echoes_to_sender_and_recipient() {
        let f = fixture();
        let alice = add_user(&f.db, "alice");
        let bob = add_user(&f.db, "bob");

        let mut alice_rx = connect(&f.registry, alice).await;
        let mut bob_rx = connect(&f.registry, bob).await;
        drain_presence(&mut alice_rx);
        drain_presence(&mut bob_rx);

        f.engine
            .send_direct(alice, "alice", bob, text("hello"))
            .await
            .unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            match rx.recv().await.unwrap() {
                ServerEvent::NewMessage { message } => assert_eq!(message.content, "hello"),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn group_send_reaches_every_member_including_sender() {
        let f = fixture();
        let x = add_user(&f.db, "x");
        let y = add_user(&f.db, "y");
        let z = add_user(&f.db, "z");
        let group = add_group(&f.db, "trio", x, &[x, y, z]);

        let mut rxs = Vec::new();
        for user in [x, y, z] {
            rxs.push(connect(&f.registry, user).await);
        }
        for rx in &mut rxs {
            drain_presence(rx);
        }

        let payload = f
            .engine
            .send_group(x, "x", group, text("hi all"))
            .await
            .unwrap();

        for rx in &mut rxs {
            match rx.recv().await.unwrap() {
                ServerEvent::NewMessage { message } => assert_eq!(message.id, payload.id),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        // a non-sender cannot delete it
        let err = f.engine.delete(y, payload.id).await.unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[tokio::test]
    async fn non_member_cannot_send_to_group() {
        let f = fixture();
        let x = add_user(&f.db, "x");
        let y = add_user(&f.db, "y");
        let outsider = add_user(&f.db, "outsider");
        let group = add_group(&f.db, "pair", x, &[x, y]);

        let err = f
            .engine
            .send_group(outsider, "outsider", group, text("let me in"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[tokio::test]
    async fn reply_snippet_is_point_in_time() {
        let f = fixture();
        let alice = add_user(&f.db, "alice");
        let bob = add_user(&f.db, "bob");

        let original = f
            .engine
            .send_direct(alice, "alice", bob, text("the original wording"))
            .await
            .unwrap();

        let mut reply = text("agreed");
        reply.reply_to = Some(original.id);
        let reply = f
            .engine
            .send_direct(bob, "bob", alice, reply)
            .await
            .unwrap();
        assert_eq!(reply.reply_snippet.as_deref(), Some("the original wording"));

        // editing the original afterwards does not rewrite the snippet
        f.engine
            .edit(alice, original.id, "revised".into())
            .await
            .unwrap();
        let row = f.db.get_message(&reply.id.to_string()).unwrap().unwrap();
        assert_eq!(row.reply_snippet.as_deref(), Some("the original wording"));
    }

    #[tokio::test]
    async fn edit_keeps_history_and_flag() {
        let f = fixture();
        let alice = add_user(&f.db, "alice");
        let bob = add_user(&f.db, "bob");

        let msg = f
            .engine
            .send_direct(alice, "alice", bob, text("draft"))
            .await
            .unwrap();

        let err = f
            .engine
            .edit(bob, msg.id, "hijacked".into())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");

        f.engine.edit(alice, msg.id, "final".into()).await.unwrap();
        f.engine
            .edit(alice, msg.id, "final final".into())
            .await
            .unwrap();

        let row = f.db.get_message(&msg.id.to_string()).unwrap().unwrap();
        assert!(row.edited);
        assert_eq!(row.content, "final final");
    }

    #[tokio::test]
    async fn reaction_double_toggle_restores_prior_state() {
        let f = fixture();
        let alice = add_user(&f.db, "alice");
        let bob = add_user(&f.db, "bob");

        let msg = f
            .engine
            .send_direct(alice, "alice", bob, text("react to me"))
            .await
            .unwrap();

        let mut bob_rx = connect(&f.registry, bob).await;
        drain_presence(&mut bob_rx);

        f.engine
            .toggle_reaction(bob, msg.id, "👍".into())
            .await
            .unwrap();
        match bob_rx.recv().await.unwrap() {
            ServerEvent::ReactionUpdated { reactions, .. } => {
                assert_eq!(reactions.get("👍").map(Vec::len), Some(1));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        f.engine
            .toggle_reaction(bob, msg.id, "👍".into())
            .await
            .unwrap();
        match bob_rx.recv().await.unwrap() {
            ServerEvent::ReactionUpdated { reactions, .. } => {
                assert!(reactions.is_empty());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stranger_cannot_react_to_direct_message() {
        let f = fixture();
        let alice = add_user(&f.db, "alice");
        let bob = add_user(&f.db, "bob");
        let eve = add_user(&f.db, "eve");

        let msg = f
            .engine
            .send_direct(alice, "alice", bob, text("private"))
            .await
            .unwrap();

        let err = f
            .engine
            .toggle_reaction(eve, msg.id, "👀".into())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[tokio::test]
    async fn offline_flow_with_pull_only_read_receipts() {
        let f = fixture();
        let alice = add_user(&f.db, "alice");
        let bob = add_user(&f.db, "bob");

        let mut alice_rx = connect(&f.registry, alice).await;
        drain_presence(&mut alice_rx);

        // A online, B offline: send succeeds, B gets nothing live
        f.engine
            .send_direct(alice, "alice", bob, text("hi"))
            .await
            .unwrap();
        match alice_rx.recv().await.unwrap() {
            ServerEvent::NewMessage { .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }

        // B connects later and fetches history: unread
        let history = f
            .db
            .direct_history(&alice.to_string(), &bob.to_string(), 50, 0, &courier_db::now())
            .unwrap();
        assert!(!history[0].read);

        // B marks read; a repeat is a no-op
        f.engine.mark_read(bob, alice).await.unwrap();
        f.engine.mark_read(bob, alice).await.unwrap();

        let history = f
            .db
            .direct_history(&alice.to_string(), &bob.to_string(), 50, 0, &courier_db::now())
            .unwrap();
        assert!(history[0].read);

        // A never receives a read-receipt push
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deleted_content_is_masked_in_payloads() {
        let f = fixture();
        let alice = add_user(&f.db, "alice");
        let bob = add_user(&f.db, "bob");

        let msg = f
            .engine
            .send_direct(alice, "alice", bob, text("secret"))
            .await
            .unwrap();
        f.engine.delete(alice, msg.id).await.unwrap();

        let row = f.db.get_message(&msg.id.to_string()).unwrap().unwrap();
        // the store keeps the content for the audit trail
        assert_eq!(row.content, "secret");

        let payload = payload_from_row(row, HashMap::new(), vec![]);
        assert!(payload.deleted);
        assert!(payload.content.is_empty());
    }

    #[tokio::test]
    async fn ttl_becomes_expiry_timestamp() {
        let f = fixture();
        let alice = add_user(&f.db, "alice");
        let bob = add_user(&f.db, "bob");

        let mut msg = text("short-lived");
        msg.ttl_secs = Some(60);
        let payload = f
            .engine
            .send_direct(alice, "alice", bob, msg)
            .await
            .unwrap();
        let expires = payload.expires_at.unwrap();
        assert!(expires > Utc::now());

        let mut bad = text("negative");
        bad.ttl_secs = Some(-5);
        let err = f
            .engine
            .send_direct(alice, "alice", bob, bad)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }
}

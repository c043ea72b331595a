use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use crate::Database;
use crate::models::{
    ContactRow, ExpiredRow, GroupRow, MessageRow, NewMessage, ReactionRow, ReceiptRow, UserRow,
};

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        password_hash: &str,
        name: &str,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, username, password_hash, name, created_at],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn user_exists(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM users WHERE id = ?1", [id], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Contact list for `viewer`: every other user, with the most recent
    /// direct-message snippet and the viewer's unread count. Deleted and
    /// expired messages never surface here.
    pub fn list_contacts(&self, viewer: &str, now: &str) -> Result<Vec<ContactRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.username, u.name, u.avatar,
                        (SELECT m.content FROM messages m
                          WHERE ((m.sender_id = u.id AND m.recipient_id = ?1)
                              OR (m.sender_id = ?1 AND m.recipient_id = u.id))
                            AND m.deleted = 0
                            AND (m.expires_at IS NULL OR m.expires_at > ?2)
                          ORDER BY m.created_at DESC LIMIT 1),
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.sender_id = u.id AND m.recipient_id = ?1
                            AND m.read = 0 AND m.deleted = 0
                            AND (m.expires_at IS NULL OR m.expires_at > ?2))
                 FROM users u
                 WHERE u.id != ?1
                 ORDER BY u.username",
            )?;

            let rows = stmt
                .query_map(params![viewer, now], |row| {
                    Ok(ContactRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        name: row.get(2)?,
                        avatar: row.get(3)?,
                        last_message: row.get(4)?,
                        unread_count: row.get::<_, i64>(5)? as u64,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Groups --

    pub fn create_group(
        &self,
        id: &str,
        name: &str,
        avatar: Option<&str>,
        created_by: &str,
        members: &[String],
        now: &str,
    ) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO groups (id, name, avatar, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, name, avatar, created_by, now],
            )?;
            for member in members {
                tx.execute(
                    "INSERT INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                    params![id, member],
                )?;
            }
            Ok(())
        })
    }

    pub fn get_group(&self, id: &str) -> Result<Option<GroupRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, avatar, created_by, created_at, updated_at
                     FROM groups WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(GroupRow {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            avatar: row.get(2)?,
                            created_by: row.get(3)?,
                            created_at: row.get(4)?,
                            updated_at: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn get_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM group_members WHERE group_id = ?1")?;
            let members = stmt
                .query_map([group_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(members)
        })
    }

    pub fn is_member(&self, group_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                    params![group_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Apply a group update, snapshotting the prior state into
    /// group_history first. `members`, when given, replaces the set.
    pub fn update_group(
        &self,
        group_id: &str,
        name: Option<&str>,
        avatar: Option<&str>,
        members: Option<&[String]>,
        actor: &str,
        now: &str,
    ) -> Result<()> {
        self.with_tx(|tx| {
            let (old_name, old_avatar): (String, Option<String>) = tx.query_row(
                "SELECT name, avatar FROM groups WHERE id = ?1",
                [group_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let old_members: Vec<String> = {
                let mut stmt =
                    tx.prepare("SELECT user_id FROM group_members WHERE group_id = ?1")?;
                stmt.query_map([group_id], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            tx.execute(
                "INSERT INTO group_history (group_id, name, avatar, members, updated_by, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    group_id,
                    old_name,
                    old_avatar,
                    serde_json::to_string(&old_members)?,
                    actor,
                    now
                ],
            )?;

            if let Some(name) = name {
                tx.execute(
                    "UPDATE groups SET name = ?1 WHERE id = ?2",
                    params![name, group_id],
                )?;
            }
            if let Some(avatar) = avatar {
                tx.execute(
                    "UPDATE groups SET avatar = ?1 WHERE id = ?2",
                    params![avatar, group_id],
                )?;
            }
            if let Some(members) = members {
                tx.execute(
                    "DELETE FROM group_members WHERE group_id = ?1",
                    [group_id],
                )?;
                for member in members {
                    tx.execute(
                        "INSERT INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                        params![group_id, member],
                    )?;
                }
            }
            tx.execute(
                "UPDATE groups SET updated_at = ?1 WHERE id = ?2",
                params![now, group_id],
            )?;

            Ok(())
        })
    }

    pub fn list_groups_for_user(&self, user_id: &str) -> Result<Vec<GroupRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.id, g.name, g.avatar, g.created_by, g.created_at, g.updated_at
                 FROM groups g
                 JOIN group_members gm ON gm.group_id = g.id
                 WHERE gm.user_id = ?1
                 ORDER BY g.updated_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(GroupRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        avatar: row.get(2)?,
                        created_by: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    pub fn insert_message(&self, msg: &NewMessage) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages
                   (id, sender_id, recipient_id, group_id, content, kind, file_url,
                    reply_to, reply_snippet, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    msg.id,
                    msg.sender_id,
                    msg.recipient_id,
                    msg.group_id,
                    msg.content,
                    msg.kind,
                    msg.file_url,
                    msg.reply_to,
                    msg.reply_snippet,
                    msg.expires_at,
                    msg.created_at
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{MESSAGE_SELECT} WHERE m.id = ?1"),
                    [id],
                    map_message_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Overwrite content, appending the prior content to the edit
    /// history first. The edited flag is set and never cleared.
    pub fn edit_message(&self, id: &str, content: &str, now: &str) -> Result<()> {
        self.with_tx(|tx| {
            let prior: String = tx.query_row(
                "SELECT content FROM messages WHERE id = ?1",
                [id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO message_edits (message_id, content, edited_at) VALUES (?1, ?2, ?3)",
                params![id, prior, now],
            )?;
            tx.execute(
                "UPDATE messages SET content = ?1, edited = 1 WHERE id = ?2",
                params![content, id],
            )?;
            Ok(())
        })
    }

    /// Soft delete: the row stays, read paths mask the content.
    pub fn mark_deleted(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE messages SET deleted = 1 WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    /// Direct history between two users, oldest first. Expired rows are
    /// filtered here even if the sweep has not removed them yet.
    pub fn direct_history(
        &self,
        user_a: &str,
        user_b: &str,
        limit: u32,
        offset: u32,
        now: &str,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE ((m.sender_id = ?1 AND m.recipient_id = ?2)
                     OR (m.sender_id = ?2 AND m.recipient_id = ?1))
                   AND (m.expires_at IS NULL OR m.expires_at > ?3)
                 ORDER BY m.created_at ASC
                 LIMIT ?4 OFFSET ?5"
            ))?;
            let rows = stmt
                .query_map(params![user_a, user_b, now, limit, offset], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn group_history(
        &self,
        group_id: &str,
        limit: u32,
        offset: u32,
        now: &str,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.group_id = ?1
                   AND (m.expires_at IS NULL OR m.expires_at > ?2)
                 ORDER BY m.created_at ASC
                 LIMIT ?3 OFFSET ?4"
            ))?;
            let rows = stmt
                .query_map(params![group_id, now, limit, offset], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Bulk-mark unread direct messages from `partner` to `reader`.
    /// Returns how many rows changed; zero on a repeat call.
    pub fn mark_direct_read(&self, partner: &str, reader: &str, now: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET read = 1, read_at = ?1
                 WHERE sender_id = ?2 AND recipient_id = ?3 AND read = 0",
                params![now, partner, reader],
            )?;
            Ok(changed)
        })
    }

    /// Append `reader` to the reader set of every group message they
    /// have not marked yet. Idempotent via the primary key.
    pub fn mark_group_read(&self, group_id: &str, reader: &str, now: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at)
                 SELECT m.id, ?1, ?2 FROM messages m
                 WHERE m.group_id = ?3 AND m.sender_id != ?1",
                params![reader, now, group_id],
            )?;
            Ok(changed)
        })
    }

    // -- Reactions --

    /// Toggle a reaction: removes if present, inserts if not.
    /// Returns true when the reaction was added.
    pub fn toggle_reaction(
        &self,
        id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
        now: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM reactions
                     WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                    params![message_id, user_id, emoji],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_id) = existing {
                conn.execute("DELETE FROM reactions WHERE id = ?1", [&existing_id])?;
                Ok(false)
            } else {
                conn.execute(
                    "INSERT INTO reactions (id, message_id, user_id, emoji, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, message_id, user_id, emoji, now],
                )?;
                Ok(true)
            }
        })
    }

    pub fn reactions_for_message(&self, message_id: &str) -> Result<Vec<ReactionRow>> {
        self.reactions_for_messages(std::slice::from_ref(&message_id.to_string()))
    }

    /// Batch-fetch reactions for a set of message IDs.
    pub fn reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, user_id, emoji FROM reactions WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let bind: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(bind.as_slice(), |row| {
                    Ok(ReactionRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        emoji: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Batch-fetch group read receipts for a set of message IDs.
    pub fn receipts_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReceiptRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, user_id, read_at FROM read_receipts WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let bind: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(bind.as_slice(), |row| {
                    Ok(ReceiptRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        read_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Expiry --

    /// Physically remove every message past its expiry, with its
    /// reactions, receipts, and edit history. Returns the routing info
    /// the sweep needs to push deletion notices.
    pub fn delete_expired(&self, now: &str) -> Result<Vec<ExpiredRow>> {
        self.with_tx(|tx| {
            let expired: Vec<ExpiredRow> = {
                let mut stmt = tx.prepare(
                    "SELECT id, sender_id, recipient_id, group_id FROM messages
                     WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                )?;
                stmt.query_map([now], |row| {
                    Ok(ExpiredRow {
                        id: row.get(0)?,
                        sender_id: row.get(1)?,
                        recipient_id: row.get(2)?,
                        group_id: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?
            };

            for row in &expired {
                tx.execute("DELETE FROM reactions WHERE message_id = ?1", [&row.id])?;
                tx.execute("DELETE FROM read_receipts WHERE message_id = ?1", [&row.id])?;
                tx.execute("DELETE FROM message_edits WHERE message_id = ?1", [&row.id])?;
                tx.execute("DELETE FROM messages WHERE id = ?1", [&row.id])?;
            }

            Ok(expired)
        })
    }
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.sender_id, u.username, m.recipient_id, m.group_id,
        m.content, m.kind, m.file_url, m.reply_to, m.reply_snippet,
        m.expires_at, m.read, m.read_at, m.edited, m.deleted, m.created_at
 FROM messages m
 LEFT JOIN users u ON m.sender_id = u.id";

fn query_user(conn: &rusqlite::Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT id, username, password, name, avatar, created_at
                 FROM users WHERE {column} = ?1"
            ),
            [value],
            |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    password: row.get(2)?,
                    name: row.get(3)?,
                    avatar: row.get(4)?,
                    created_at: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        sender_username: row
            .get::<_, Option<String>>(2)?
            .unwrap_or_else(|| "unknown".to_string()),
        recipient_id: row.get(3)?,
        group_id: row.get(4)?,
        content: row.get(5)?,
        kind: row.get(6)?,
        file_url: row.get(7)?,
        reply_to: row.get(8)?,
        reply_snippet: row.get(9)?,
        expires_at: row.get(10)?,
        read: row.get(11)?,
        read_at: row.get(12)?,
        edited: row.get(13)?,
        deleted: row.get(14)?,
        created_at: row.get(15)?,
    })
}

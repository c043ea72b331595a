use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            name        TEXT NOT NULL,
            avatar      TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS groups (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            avatar      TEXT,
            created_by  TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS group_members (
            group_id    TEXT NOT NULL REFERENCES groups(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            PRIMARY KEY (group_id, user_id)
        );

        -- Append-only snapshots of a group's prior state
        CREATE TABLE IF NOT EXISTS group_history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id    TEXT NOT NULL REFERENCES groups(id),
            name        TEXT NOT NULL,
            avatar      TEXT,
            members     TEXT NOT NULL,
            updated_by  TEXT NOT NULL REFERENCES users(id),
            updated_at  TEXT NOT NULL
        );

        -- Exactly one of recipient_id / group_id is set, never both,
        -- never neither.
        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            sender_id       TEXT NOT NULL REFERENCES users(id),
            recipient_id    TEXT REFERENCES users(id),
            group_id        TEXT REFERENCES groups(id),
            content         TEXT NOT NULL,
            kind            TEXT NOT NULL DEFAULT 'text',
            file_url        TEXT,
            reply_to        TEXT,
            reply_snippet   TEXT,
            expires_at      TEXT,
            read            INTEGER NOT NULL DEFAULT 0,
            read_at         TEXT,
            edited          INTEGER NOT NULL DEFAULT 0,
            deleted         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            CHECK ((recipient_id IS NULL) != (group_id IS NULL))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_direct
            ON messages(sender_id, recipient_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_group
            ON messages(group_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_expiry
            ON messages(expires_at) WHERE expires_at IS NOT NULL;

        -- Prior contents of edited messages, append-only
        CREATE TABLE IF NOT EXISTS message_edits (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            content     TEXT NOT NULL,
            edited_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS reactions (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE(message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        -- Group-message read markers; a reader appears at most once
        CREATE TABLE IF NOT EXISTS read_receipts (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            read_at     TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}

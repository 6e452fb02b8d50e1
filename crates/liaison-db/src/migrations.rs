use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id                      TEXT PRIMARY KEY,
            preview_cipher_text     TEXT,
            preview_iv              TEXT,
            last_message_at         TEXT,
            last_sender_role        TEXT,
            flagged                 INTEGER NOT NULL DEFAULT 0,
            seen_by_counsellor_at   TEXT,
            seen_by_beneficiary_at  TEXT,
            updated_at              TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS messages (
            id               TEXT PRIMARY KEY,
            conversation_id  TEXT NOT NULL,
            sender_role      TEXT NOT NULL,
            author_id        TEXT,
            created_at       TEXT NOT NULL,
            encrypted_body   TEXT,
            iv               TEXT,
            kind             TEXT NOT NULL,
            kind_payload     TEXT,
            broadcast_id     TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE TABLE IF NOT EXISTS broadcast_lists (
            id          TEXT PRIMARY KEY,
            owner_id    TEXT NOT NULL,
            title       TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_broadcast_lists_owner
            ON broadcast_lists(owner_id);

        CREATE TABLE IF NOT EXISTS broadcast_list_members (
            list_id         TEXT NOT NULL REFERENCES broadcast_lists(id) ON DELETE CASCADE,
            beneficiary_id  TEXT NOT NULL,
            position        INTEGER NOT NULL,
            PRIMARY KEY (list_id, beneficiary_id)
        );

        -- Audit records outlive their list
        CREATE TABLE IF NOT EXISTS broadcast_messages (
            id          TEXT PRIMARY KEY,
            list_id     TEXT NOT NULL,
            author_id   TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            content     TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_broadcast_messages_list
            ON broadcast_messages(list_id, created_at);

        CREATE TABLE IF NOT EXISTS broadcast_recipients (
            broadcast_id    TEXT NOT NULL REFERENCES broadcast_messages(id),
            beneficiary_id  TEXT NOT NULL,
            PRIMARY KEY (broadcast_id, beneficiary_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}

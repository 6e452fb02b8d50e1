use crate::Database;
use crate::models::{BroadcastListRow, BroadcastMessageRow, ConversationRow, MessageRow};
use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

/// Fixed-width RFC 3339 so lexical order in SQLite matches time order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| anyhow!("Corrupt timestamp '{}': {}", raw, e))
}

impl Database {
    // -- Conversations --

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    /// Read-modify-write of one conversation row inside a transaction.
    pub fn update_conversation<F>(&self, id: &str, f: F) -> Result<ConversationRow>
    where
        F: FnOnce(&mut ConversationRow),
    {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut row = query_conversation(&tx, id)?.unwrap_or_else(|| ConversationRow {
                id: id.to_string(),
                preview_cipher_text: None,
                preview_iv: None,
                last_message_at: None,
                last_sender_role: None,
                flagged: false,
                seen_by_counsellor_at: None,
                seen_by_beneficiary_at: None,
            });
            f(&mut row);

            tx.execute(
                "INSERT INTO conversations (id, preview_cipher_text, preview_iv, last_message_at,
                     last_sender_role, flagged, seen_by_counsellor_at, seen_by_beneficiary_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                     preview_cipher_text = excluded.preview_cipher_text,
                     preview_iv = excluded.preview_iv,
                     last_message_at = excluded.last_message_at,
                     last_sender_role = excluded.last_sender_role,
                     flagged = excluded.flagged,
                     seen_by_counsellor_at = excluded.seen_by_counsellor_at,
                     seen_by_beneficiary_at = excluded.seen_by_beneficiary_at,
                     updated_at = datetime('now')",
                rusqlite::params![
                    row.id,
                    row.preview_cipher_text,
                    row.preview_iv,
                    row.last_message_at,
                    row.last_sender_role,
                    row.flagged,
                    row.seen_by_counsellor_at,
                    row.seen_by_beneficiary_at,
                ],
            )?;
            tx.commit()?;
            Ok(row)
        })
    }

    // -- Messages --

    /// Append-only. Re-inserting an existing id is a no-op.
    pub fn insert_message(&self, row: &MessageRow) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO messages (id, conversation_id, sender_role, author_id,
                     created_at, encrypted_body, iv, kind, kind_payload, broadcast_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    row.id,
                    row.conversation_id,
                    row.sender_role,
                    row.author_id,
                    row.created_at,
                    row.encrypted_body,
                    row.iv,
                    row.kind,
                    row.kind_payload,
                    row.broadcast_id,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, conversation_id))
    }

    // -- Broadcast lists --

    pub fn insert_list(&self, row: &BroadcastListRow, members: &[String]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO broadcast_lists (id, owner_id, title) VALUES (?1, ?2, ?3)",
                (&row.id, &row.owner_id, &row.title),
            )?;
            for (position, beneficiary_id) in members.iter().enumerate() {
                tx.execute(
                    "INSERT OR IGNORE INTO broadcast_list_members (list_id, beneficiary_id, position)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![row.id, beneficiary_id, position as i64],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_list(&self, id: &str) -> Result<Option<(BroadcastListRow, Vec<String>)>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, owner_id, title FROM broadcast_lists WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(BroadcastListRow {
                            id: row.get(0)?,
                            owner_id: row.get(1)?,
                            title: row.get(2)?,
                        })
                    },
                )
                .optional()?;

            match row {
                Some(row) => {
                    let members = query_members(conn, &row.id)?;
                    Ok(Some((row, members)))
                }
                None => Ok(None),
            }
        })
    }

    pub fn get_lists_for_owner(&self, owner_id: &str) -> Result<Vec<(BroadcastListRow, Vec<String>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, title FROM broadcast_lists
                 WHERE owner_id = ?1
                 ORDER BY created_at, title",
            )?;
            let rows = stmt
                .query_map([owner_id], |row| {
                    Ok(BroadcastListRow {
                        id: row.get(0)?,
                        owner_id: row.get(1)?,
                        title: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|row| {
                    let members = query_members(conn, &row.id)?;
                    Ok((row, members))
                })
                .collect()
        })
    }

    /// Appends at the end of the display order. Returns false if already a member.
    pub fn add_member(&self, list_id: &str, beneficiary_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO broadcast_list_members (list_id, beneficiary_id, position)
                 VALUES (?1, ?2, (SELECT COALESCE(MAX(position), -1) + 1
                                  FROM broadcast_list_members WHERE list_id = ?1))",
                (list_id, beneficiary_id),
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn remove_member(&self, list_id: &str, beneficiary_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM broadcast_list_members WHERE list_id = ?1 AND beneficiary_id = ?2",
                (list_id, beneficiary_id),
            )?;
            Ok(removed > 0)
        })
    }

    pub fn delete_list(&self, list_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM broadcast_lists WHERE id = ?1", [list_id])?;
            Ok(removed > 0)
        })
    }

    // -- Broadcast audit --

    pub fn insert_broadcast_message(&self, row: &BroadcastMessageRow, recipients: &[String]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO broadcast_messages (id, list_id, author_id, created_at, content)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (&row.id, &row.list_id, &row.author_id, &row.created_at, &row.content),
            )?;
            for beneficiary_id in recipients {
                tx.execute(
                    "INSERT INTO broadcast_recipients (broadcast_id, beneficiary_id) VALUES (?1, ?2)",
                    (&row.id, beneficiary_id),
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_broadcast_messages(&self, list_id: &str) -> Result<Vec<(BroadcastMessageRow, Vec<String>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, list_id, author_id, created_at, content FROM broadcast_messages
                 WHERE list_id = ?1
                 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map([list_id], |row| {
                    Ok(BroadcastMessageRow {
                        id: row.get(0)?,
                        list_id: row.get(1)?,
                        author_id: row.get(2)?,
                        created_at: row.get(3)?,
                        content: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut recipients_stmt = conn.prepare(
                "SELECT beneficiary_id FROM broadcast_recipients WHERE broadcast_id = ?1",
            )?;
            rows.into_iter()
                .map(|row| {
                    let recipients = recipients_stmt
                        .query_map([&row.id], |r| r.get(0))?
                        .collect::<std::result::Result<Vec<String>, _>>()?;
                    Ok((row, recipients))
                })
                .collect()
        })
    }
}

fn query_conversation(conn: &Connection, id: &str) -> Result<Option<ConversationRow>> {
    let row = conn
        .query_row(
            "SELECT id, preview_cipher_text, preview_iv, last_message_at, last_sender_role,
                    flagged, seen_by_counsellor_at, seen_by_beneficiary_at
             FROM conversations WHERE id = ?1",
            [id],
            |row| {
                Ok(ConversationRow {
                    id: row.get(0)?,
                    preview_cipher_text: row.get(1)?,
                    preview_iv: row.get(2)?,
                    last_message_at: row.get(3)?,
                    last_sender_role: row.get(4)?,
                    flagged: row.get(5)?,
                    seen_by_counsellor_at: row.get(6)?,
                    seen_by_beneficiary_at: row.get(7)?,
                })
            },
        )
        .optional()?;

    Ok(row)
}

fn query_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, sender_role, author_id, created_at,
                encrypted_body, iv, kind, kind_payload, broadcast_id
         FROM messages
         WHERE conversation_id = ?1
         ORDER BY created_at ASC, id ASC",
    )?;

    let rows = stmt
        .query_map([conversation_id], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                sender_role: row.get(2)?,
                author_id: row.get(3)?,
                created_at: row.get(4)?,
                encrypted_body: row.get(5)?,
                iv: row.get(6)?,
                kind: row.get(7)?,
                kind_payload: row.get(8)?,
                broadcast_id: row.get(9)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn query_members(conn: &Connection, list_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT beneficiary_id FROM broadcast_list_members WHERE list_id = ?1 ORDER BY position",
    )?;
    let members = stmt
        .query_map([list_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(members)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, conversation: &str, created_at: &str) -> MessageRow {
        MessageRow {
            id: id.into(),
            conversation_id: conversation.into(),
            sender_role: "beneficiary".into(),
            author_id: None,
            created_at: created_at.into(),
            encrypted_body: Some("Ym9keQ==".into()),
            iv: Some("aXY=".into()),
            kind: "plain".into(),
            kind_payload: None,
            broadcast_id: None,
        }
    }

    #[test]
    fn messages_come_back_in_time_order() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message(&message("b", "c1", "2024-05-02T10:00:00.000000Z")).unwrap();
        db.insert_message(&message("a", "c1", "2024-05-01T10:00:00.000000Z")).unwrap();
        db.insert_message(&message("x", "c2", "2024-04-01T10:00:00.000000Z")).unwrap();

        let ids: Vec<String> = db.get_messages("c1").unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn duplicate_message_insert_is_ignored() {
        let db = Database::open_in_memory().unwrap();
        let row = message("a", "c1", "2024-05-01T10:00:00.000000Z");
        assert!(db.insert_message(&row).unwrap());
        assert!(!db.insert_message(&row).unwrap());
        assert_eq!(db.get_messages("c1").unwrap().len(), 1);
    }

    #[test]
    fn update_conversation_creates_then_merges() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_conversation("c1").unwrap().is_none());

        db.update_conversation("c1", |row| row.flagged = true).unwrap();
        db.update_conversation("c1", |row| {
            row.seen_by_counsellor_at = Some("2024-05-01T10:00:00.000000Z".into())
        })
        .unwrap();

        let row = db.get_conversation("c1").unwrap().unwrap();
        assert!(row.flagged);
        assert_eq!(row.seen_by_counsellor_at.as_deref(), Some("2024-05-01T10:00:00.000000Z"));
    }

    #[test]
    fn list_members_keep_insertion_order() {
        let db = Database::open_in_memory().unwrap();
        let list = BroadcastListRow {
            id: "l1".into(),
            owner_id: "o1".into(),
            title: "Atelier CV".into(),
        };
        db.insert_list(&list, &["b3".into(), "b1".into()]).unwrap();
        assert!(db.add_member("l1", "b2").unwrap());
        assert!(!db.add_member("l1", "b1").unwrap());
        assert!(db.remove_member("l1", "b3").unwrap());

        let (_, members) = db.get_list("l1").unwrap().unwrap();
        assert_eq!(members, vec!["b1", "b2"]);

        assert!(db.delete_list("l1").unwrap());
        assert!(db.get_list("l1").unwrap().is_none());
    }

    #[test]
    fn timestamps_sort_lexically() {
        let early = parse_ts("2024-05-01T09:00:00Z").unwrap();
        let late = parse_ts("2024-05-01T10:00:00.5Z").unwrap();
        assert!(format_ts(&early) < format_ts(&late));
        assert_eq!(parse_ts(&format_ts(&late)).unwrap(), late);
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::Row;
use thiserror::Error;

use oltalk_proto::types::StoredMessage;

use crate::db::{now_secs, Database};

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("recipients empty")]
    NoRecipients,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Input to `store_message`; the stored record adds the assigned
/// `message_id` and `created_at`.
#[derive(Debug, Clone)]
pub struct MessageInput {
    pub conversation_type: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_nickname: String,
    pub content: String,
}

/// One page of conversation history, oldest first, plus the cursor for the
/// next older page (absent when there is no earlier history).
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<StoredMessage>,
    pub next_before_message_id: Option<i64>,
}

/// Transactional message store plus the offline spool reads.
pub struct MessageService {
    db: Arc<Database>,
}

fn message_from_row(row: &Row) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        message_id: row.get(0)?,
        conversation_type: row.get(1)?,
        conversation_id: row.get(2)?,
        sender_id: row.get(3)?,
        sender_nickname: row.get(4)?,
        content: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl MessageService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert the message row and one target row per distinct recipient in a
    /// single transaction, so the target set is never observable half-written.
    pub fn store_message(
        &self,
        input: &MessageInput,
        recipients: &[String],
    ) -> Result<StoredMessage, MessageError> {
        if recipients.is_empty() {
            return Err(MessageError::NoRecipients);
        }
        let input = input.clone();
        let recipients: Vec<String> = recipients.to_vec();
        let created_at = now_secs();

        let stored = self.db.with_tx(move |tx| {
            tx.execute(
                "INSERT INTO messages (conversation_type, conversation_id, sender_id,
                                       sender_nickname, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    input.conversation_type,
                    input.conversation_id,
                    input.sender_id,
                    input.sender_nickname,
                    input.content,
                    created_at,
                ],
            )?;
            let message_id = tx.last_insert_rowid();

            let mut stmt = tx.prepare(
                "INSERT INTO message_targets (message_id, user_id, delivered_at)
                 VALUES (?1, ?2, NULL)",
            )?;
            let mut seen = HashSet::new();
            for user_id in &recipients {
                if seen.insert(user_id.as_str()) {
                    stmt.execute(rusqlite::params![message_id, user_id])?;
                }
            }

            Ok(StoredMessage {
                message_id,
                conversation_type: input.conversation_type,
                conversation_id: input.conversation_id,
                sender_id: input.sender_id,
                sender_nickname: input.sender_nickname,
                content: input.content,
                created_at,
            })
        })?;
        Ok(stored)
    }

    /// Undelivered messages for a user, ascending `message_id`, up to `limit`.
    pub fn fetch_undelivered(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, MessageError> {
        let user = user_id.to_string();
        let messages = self.db.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT m.message_id, m.conversation_type, m.conversation_id, m.sender_id,
                        m.sender_nickname, m.content, m.created_at
                 FROM message_targets t
                 JOIN messages m ON t.message_id = m.message_id
                 WHERE t.user_id = ?1 AND t.delivered_at IS NULL
                 ORDER BY m.message_id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![user, limit], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(messages)
    }

    pub fn mark_delivered(
        &self,
        user_id: &str,
        message_ids: &[i64],
    ) -> Result<(), MessageError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let user = user_id.to_string();
        let ids: Vec<i64> = message_ids.to_vec();
        self.db.with_tx(move |tx| {
            let mut stmt = tx.prepare(
                "UPDATE message_targets SET delivered_at = ?1
                 WHERE user_id = ?2 AND message_id = ?3",
            )?;
            let delivered_at = now_secs();
            for message_id in &ids {
                stmt.execute(rusqlite::params![delivered_at, user, message_id])?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// One history page for a conversation, paging backwards from `before`.
    ///
    /// For private conversations the viewer/peer pair matches both message
    /// directions. Membership checks for group conversations are the
    /// caller's job.
    pub fn fetch_history(
        &self,
        conversation_type: &str,
        conversation_id: &str,
        viewer_id: &str,
        before_message_id: Option<i64>,
        limit: u32,
    ) -> Result<HistoryPage, MessageError> {
        let before = before_message_id.unwrap_or(i64::MAX);
        let ctype = conversation_type.to_string();
        let cid = conversation_id.to_string();
        let viewer = viewer_id.to_string();

        let mut messages = self.db.with_conn(move |conn| {
            let rows = if ctype == "private" {
                let mut stmt = conn.prepare(
                    "SELECT message_id, conversation_type, conversation_id, sender_id,
                            sender_nickname, content, created_at
                     FROM messages
                     WHERE conversation_type = 'private'
                       AND ((sender_id = ?1 AND conversation_id = ?2)
                         OR (sender_id = ?2 AND conversation_id = ?1))
                       AND message_id < ?3
                     ORDER BY message_id DESC
                     LIMIT ?4",
                )?;
                let result = stmt
                    .query_map(
                        rusqlite::params![viewer, cid, before, limit],
                        message_from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            } else {
                let mut stmt = conn.prepare(
                    "SELECT message_id, conversation_type, conversation_id, sender_id,
                            sender_nickname, content, created_at
                     FROM messages
                     WHERE conversation_type = ?1 AND conversation_id = ?2
                       AND message_id < ?3
                     ORDER BY message_id DESC
                     LIMIT ?4",
                )?;
                let result = stmt
                    .query_map(
                        rusqlite::params![ctype, cid, before, limit],
                        message_from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            };
            Ok(rows)
        })?;

        // Query runs newest-first for the cursor; emit oldest-first.
        let next_before_message_id = if messages.len() == limit as usize {
            messages.last().map(|m| m.message_id)
        } else {
            None
        };
        messages.reverse();
        Ok(HistoryPage {
            messages,
            next_before_message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, Arc<Database>, MessageService) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("test.db")).unwrap());
        let messages = MessageService::new(db.clone());
        (dir, db, messages)
    }

    fn input(content: &str) -> MessageInput {
        MessageInput {
            conversation_type: "group".into(),
            conversation_id: "g1".into(),
            sender_id: "alice".into(),
            sender_nickname: "Alice".into(),
            content: content.into(),
        }
    }

    #[test]
    fn store_writes_one_target_per_distinct_recipient() {
        let (_dir, db, messages) = service();
        let stored = messages
            .store_message(
                &input("hi"),
                &["bob".into(), "carol".into(), "bob".into()],
            )
            .unwrap();
        assert!(stored.message_id >= 1);

        let targets: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM message_targets WHERE message_id = ?1",
                    [stored.message_id],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(targets, 2);
    }

    #[test]
    fn empty_recipients_rejected() {
        let (_dir, _db, messages) = service();
        assert!(matches!(
            messages.store_message(&input("hi"), &[]),
            Err(MessageError::NoRecipients)
        ));
    }

    #[test]
    fn spool_drains_in_message_id_order() {
        let (_dir, _db, messages) = service();
        for text in ["one", "two", "three"] {
            messages.store_message(&input(text), &["bob".into()]).unwrap();
        }

        let undelivered = messages.fetch_undelivered("bob", 10).unwrap();
        let contents: Vec<&str> = undelivered.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
        assert!(undelivered.windows(2).all(|w| w[0].message_id < w[1].message_id));

        messages
            .mark_delivered("bob", &[undelivered[0].message_id, undelivered[1].message_id])
            .unwrap();
        let remaining = messages.fetch_undelivered("bob", 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "three");
    }

    #[test]
    fn spool_respects_limit() {
        let (_dir, _db, messages) = service();
        for i in 0..5 {
            messages
                .store_message(&input(&format!("m{i}")), &["bob".into()])
                .unwrap();
        }
        assert_eq!(messages.fetch_undelivered("bob", 2).unwrap().len(), 2);
    }

    #[test]
    fn history_pages_backwards_and_emits_oldest_first() {
        let (_dir, _db, messages) = service();
        for i in 1..=5 {
            messages
                .store_message(&input(&format!("m{i}")), &["bob".into()])
                .unwrap();
        }

        let page = messages
            .fetch_history("group", "g1", "alice", None, 2)
            .unwrap();
        let contents: Vec<&str> = page.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m5"]);
        let cursor = page.next_before_message_id.unwrap();

        let page = messages
            .fetch_history("group", "g1", "alice", Some(cursor), 2)
            .unwrap();
        let contents: Vec<&str> = page.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3"]);

        let page = messages
            .fetch_history(
                "group",
                "g1",
                "alice",
                page.next_before_message_id,
                2,
            )
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].content, "m1");
        assert_eq!(page.next_before_message_id, None);
    }

    #[test]
    fn private_history_matches_both_directions() {
        let (_dir, _db, messages) = service();
        let a_to_b = MessageInput {
            conversation_type: "private".into(),
            conversation_id: "bob".into(),
            sender_id: "alice".into(),
            sender_nickname: "Alice".into(),
            content: "hello bob".into(),
        };
        let b_to_a = MessageInput {
            conversation_type: "private".into(),
            conversation_id: "alice".into(),
            sender_id: "bob".into(),
            sender_nickname: "Bob".into(),
            content: "hello alice".into(),
        };
        messages.store_message(&a_to_b, &["bob".into()]).unwrap();
        messages.store_message(&b_to_a, &["alice".into()]).unwrap();

        // Alice views her conversation with bob and sees both directions.
        let page = messages
            .fetch_history("private", "bob", "alice", None, 10)
            .unwrap();
        assert_eq!(page.messages.len(), 2);

        // An outsider viewing the same pair id sees nothing of it.
        let page = messages
            .fetch_history("private", "bob", "carol", None, 10)
            .unwrap();
        assert!(page.messages.is_empty());
    }
}

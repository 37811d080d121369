use chrono::Utc;
use tracing::instrument;

use relay_core::ids::SessionToken;
use relay_core::messages::ChatMessage;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message to a session's history. Atomically:
    /// 1. Stamps `last_message_at` on the session (NotFound if absent)
    /// 2. Inserts the message; SQLite assigns a strictly increasing id
    #[instrument(skip(self, token, text), fields(token = %token.short()))]
    pub fn record(
        &self,
        token: &SessionToken,
        text: &str,
        origin_is_visitor: bool,
    ) -> Result<ChatMessage, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let updated = tx.execute(
                "UPDATE visitor_sessions SET last_message_at = ?1 WHERE token = ?2",
                rusqlite::params![now, token.as_str()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("session {}", token.short())));
            }

            tx.execute(
                "INSERT INTO messages (session_token, sent_at, origin_is_visitor, text)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![token.as_str(), now, origin_is_visitor as i64, text],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            Ok(ChatMessage {
                id,
                sent_at: now,
                origin_is_visitor,
                text: text.to_string(),
            })
        })
    }

    /// Full history for a session, ascending by id.
    #[instrument(skip(self, token), fields(token = %token.short()))]
    pub fn list_for(&self, token: &SessionToken) -> Result<Vec<ChatMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sent_at, origin_is_visitor, text
                 FROM messages WHERE session_token = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([token.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<ChatMessage, StoreError> {
    Ok(ChatMessage {
        id: row_helpers::get(row, 0, "messages", "id")?,
        sent_at: row_helpers::get(row, 1, "messages", "sent_at")?,
        origin_is_visitor: row_helpers::get_flag(row, 2, "messages", "origin_is_visitor")?,
        text: row_helpers::get(row, 3, "messages", "text")?,
    })
}

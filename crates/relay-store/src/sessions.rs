use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::ids::SessionToken;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Persisted visitor session. Outlives any live connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub token: SessionToken,
    pub created_at: String,
    pub last_login_at: String,
    pub last_message_at: Option<String>,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert an empty session record. Fails with `Database` on a duplicate token.
    #[instrument(skip(self, token), fields(token = %token.short()))]
    pub fn create(&self, token: &SessionToken) -> Result<SessionRecord, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO visitor_sessions (token, created_at, last_login_at) VALUES (?1, ?2, ?2)",
                rusqlite::params![token.as_str(), now],
            )?;
            Ok(SessionRecord {
                token: token.clone(),
                created_at: now.clone(),
                last_login_at: now,
                last_message_at: None,
            })
        })
    }

    #[instrument(skip(self, token), fields(token = %token.short()))]
    pub fn exists(&self, token: &SessionToken) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: i64 = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM visitor_sessions WHERE token = ?1)",
                [token.as_str()],
                |row| row.get(0),
            )?;
            Ok(found == 1)
        })
    }

    #[instrument(skip(self, token), fields(token = %token.short()))]
    pub fn get(&self, token: &SessionToken) -> Result<SessionRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT token, created_at, last_login_at, last_message_at
                 FROM visitor_sessions WHERE token = ?1",
            )?;
            let mut rows = stmt.query([token.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {}", token.short()))),
            }
        })
    }

    /// Stamp the current time as the last login and return it.
    #[instrument(skip(self, token), fields(token = %token.short()))]
    pub fn touch_login(&self, token: &SessionToken) -> Result<String, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE visitor_sessions SET last_login_at = ?1 WHERE token = ?2",
                rusqlite::params![now, token.as_str()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("session {}", token.short())));
            }
            Ok(now)
        })
    }

    #[instrument(skip(self, token), fields(token = %token.short()))]
    pub fn last_message_at(&self, token: &SessionToken) -> Result<Option<String>, StoreError> {
        Ok(self.get(token)?.last_message_at)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRecord, StoreError> {
    Ok(SessionRecord {
        token: SessionToken::from_raw(row_helpers::get::<String>(
            row,
            0,
            "visitor_sessions",
            "token",
        )?),
        created_at: row_helpers::get(row, 1, "visitor_sessions", "created_at")?,
        last_login_at: row_helpers::get(row, 2, "visitor_sessions", "last_login_at")?,
        last_message_at: row_helpers::get_opt(row, 3, "visitor_sessions", "last_message_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(s: &str) -> SessionToken {
        SessionToken::from_raw(s)
    }

    #[test]
    fn create_and_get() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let created = repo.create(&token("T1")).unwrap();
        assert_eq!(created.created_at, created.last_login_at);
        assert!(created.last_message_at.is_none());

        let fetched = repo.get(&token("T1")).unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn duplicate_create_fails() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        repo.create(&token("T1")).unwrap();
        assert!(matches!(repo.create(&token("T1")), Err(StoreError::Database(_))));
    }

    #[test]
    fn exists_reflects_records() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        assert!(!repo.exists(&token("T1")).unwrap());
        repo.create(&token("T1")).unwrap();
        assert!(repo.exists(&token("T1")).unwrap());
        assert!(!repo.exists(&token("T2")).unwrap());
    }

    #[test]
    fn get_unknown_is_not_found() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        assert!(matches!(repo.get(&token("nope")), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn touch_login_updates_timestamp() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        repo.create(&token("T1")).unwrap();
        let stamped = repo.touch_login(&token("T1")).unwrap();
        assert_eq!(repo.get(&token("T1")).unwrap().last_login_at, stamped);
    }

    #[test]
    fn touch_login_unknown_is_not_found() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        assert!(matches!(repo.touch_login(&token("nope")), Err(StoreError::NotFound(_))));
    }
}

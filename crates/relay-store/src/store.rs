//! The persistence contract the relay core consumes.

use relay_core::ids::SessionToken;
use relay_core::messages::ChatMessage;

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;
use crate::sessions::{SessionRecord, SessionRepo};

/// Create/read/update operations used by session identity and routing.
/// Calls are synchronous; callers treat them as blocking.
pub trait MessageStore: Send + Sync {
    fn create_session(&self, token: &SessionToken) -> Result<SessionRecord, StoreError>;
    fn session_exists(&self, token: &SessionToken) -> Result<bool, StoreError>;
    fn record_message(
        &self,
        token: &SessionToken,
        text: &str,
        origin_is_visitor: bool,
    ) -> Result<ChatMessage, StoreError>;
    fn messages_for(&self, token: &SessionToken) -> Result<Vec<ChatMessage>, StoreError>;
    fn last_message_timestamp(&self, token: &SessionToken) -> Result<Option<String>, StoreError>;
    fn touch_login(&self, token: &SessionToken) -> Result<String, StoreError>;
}

/// SQLite-backed store combining the session and message repositories.
pub struct SqliteMessageStore {
    sessions: SessionRepo,
    messages: MessageRepo,
}

impl SqliteMessageStore {
    pub fn new(db: Database) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            messages: MessageRepo::new(db),
        }
    }
}

impl MessageStore for SqliteMessageStore {
    fn create_session(&self, token: &SessionToken) -> Result<SessionRecord, StoreError> {
        self.sessions.create(token)
    }

    fn session_exists(&self, token: &SessionToken) -> Result<bool, StoreError> {
        self.sessions.exists(token)
    }

    fn record_message(
        &self,
        token: &SessionToken,
        text: &str,
        origin_is_visitor: bool,
    ) -> Result<ChatMessage, StoreError> {
        self.messages.record(token, text, origin_is_visitor)
    }

    fn messages_for(&self, token: &SessionToken) -> Result<Vec<ChatMessage>, StoreError> {
        self.messages.list_for(token)
    }

    fn last_message_timestamp(&self, token: &SessionToken) -> Result<Option<String>, StoreError> {
        self.sessions.last_message_at(token)
    }

    fn touch_login(&self, token: &SessionToken) -> Result<String, StoreError> {
        self.sessions.touch_login(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_contract_end_to_end() {
        let store = SqliteMessageStore::new(Database::in_memory().unwrap());
        let token = SessionToken::from_raw("T1");

        assert!(!store.session_exists(&token).unwrap());
        store.create_session(&token).unwrap();
        assert!(store.session_exists(&token).unwrap());
        assert!(store.messages_for(&token).unwrap().is_empty());
        assert_eq!(store.last_message_timestamp(&token).unwrap(), None);

        let msg = store.record_message(&token, "hi", true).unwrap();
        assert_eq!(store.messages_for(&token).unwrap(), vec![msg.clone()]);
        assert_eq!(store.last_message_timestamp(&token).unwrap(), Some(msg.sent_at));

        store.touch_login(&token).unwrap();
    }

    #[test]
    fn usable_as_trait_object() {
        let store: std::sync::Arc<dyn MessageStore> =
            std::sync::Arc::new(SqliteMessageStore::new(Database::in_memory().unwrap()));
        assert!(!store.session_exists(&SessionToken::from_raw("x")).unwrap());
    }
}

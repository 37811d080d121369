//! Live visitor connections grouped by session token.

use std::collections::HashMap;

use relay_core::{ConnectionId, SessionToken};

use crate::connection::ConnectionHandle;

/// In-memory half of a session. Exists only while it has connections.
#[derive(Debug)]
struct SessionEntry {
    connections: Vec<ConnectionHandle>,
    last_login_at: String,
}

/// Outcome of [`ConnectionRegistry::attach`].
#[derive(Debug, PartialEq, Eq)]
pub enum Attached {
    /// The session went from zero connections to one.
    First,
    Additional,
}

/// Outcome of [`ConnectionRegistry::detach`].
#[derive(Debug, PartialEq, Eq)]
pub enum Detached {
    /// The last connection of this session left; the entry is gone.
    Last(SessionToken),
    Remaining(SessionToken),
    /// The connection was never bound to a session.
    Unbound,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: HashMap<SessionToken, SessionEntry>,
    bindings: HashMap<ConnectionId, SessionToken>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to a session. A connection is bound to at most one
    /// session; callers detach before rebinding.
    pub fn attach(
        &mut self,
        token: SessionToken,
        handle: ConnectionHandle,
        last_login_at: String,
    ) -> Attached {
        self.bindings.insert(handle.id().clone(), token.clone());
        match self.sessions.get_mut(&token) {
            Some(entry) => {
                entry.connections.push(handle);
                entry.last_login_at = last_login_at;
                Attached::Additional
            }
            None => {
                self.sessions.insert(
                    token,
                    SessionEntry {
                        connections: vec![handle],
                        last_login_at,
                    },
                );
                Attached::First
            }
        }
    }

    pub fn detach(&mut self, id: &ConnectionId) -> Detached {
        let Some(token) = self.bindings.remove(id) else {
            return Detached::Unbound;
        };
        let now_empty = match self.sessions.get_mut(&token) {
            Some(entry) => {
                entry.connections.retain(|h| h.id() != id);
                entry.connections.is_empty()
            }
            None => true,
        };
        if now_empty {
            self.sessions.remove(&token);
            Detached::Last(token)
        } else {
            Detached::Remaining(token)
        }
    }

    pub fn token_for(&self, id: &ConnectionId) -> Option<&SessionToken> {
        self.bindings.get(id)
    }

    pub fn connections_of(&self, token: &SessionToken) -> &[ConnectionHandle] {
        self.sessions
            .get(token)
            .map(|e| e.connections.as_slice())
            .unwrap_or(&[])
    }

    pub fn last_login_at(&self, token: &SessionToken) -> Option<&str> {
        self.sessions.get(token).map(|e| e.last_login_at.as_str())
    }

    #[cfg(test)]
    fn is_connected(&self, token: &SessionToken) -> bool {
        self.sessions.contains_key(token)
    }

    /// Sessions with at least one live connection.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    fn connection_count(&self) -> usize {
        self.bindings.len()
    }
}

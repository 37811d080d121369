//! Admin presence, the active chat list, and message routing.
//!
//! `PresenceCoordinator` is plain synchronous state. It is owned by exactly one
//! task (see `service`), so every mutation is serialized without locks.

use std::collections::HashMap;
use std::sync::Arc;

use relay_core::protocol::{AdminOutbound, VisitorOutbound};
use relay_core::{ChatMessage, ChatUserSummary, ConnectionId, RelayError, SessionToken};
use relay_store::MessageStore;
use serde::Serialize;

use crate::connection::ConnectionHandle;
use crate::identity::SessionIdentity;
use crate::registry::{Attached, ConnectionRegistry, Detached};

#[derive(Debug, Default)]
struct AdminState {
    online: bool,
    connection: Option<ConnectionHandle>,
    selected: Option<SessionToken>,
}

/// Point-in-time counters, served by `/health`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub admin_connected: bool,
    pub admin_online: bool,
    pub connected_visitors: usize,
    pub active_chat_users: usize,
}

pub(crate) fn send_admin(handle: &ConnectionHandle, frame: &AdminOutbound) -> bool {
    match frame.to_wire() {
        Ok(wire) => handle.send(wire),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode admin frame");
            false
        }
    }
}

pub(crate) fn send_visitor(handle: &ConnectionHandle, frame: &VisitorOutbound) -> bool {
    match frame.to_wire() {
        Ok(wire) => handle.send(wire),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode visitor frame");
            false
        }
    }
}

pub struct PresenceCoordinator {
    identity: SessionIdentity,
    store: Arc<dyn MessageStore>,
    registry: ConnectionRegistry,
    /// Every live visitor connection, bound to a session or not.
    visitors: HashMap<ConnectionId, ConnectionHandle>,
    active: HashMap<SessionToken, ChatUserSummary>,
    admin: AdminState,
}

impl PresenceCoordinator {
    pub fn new(store: Arc<dyn MessageStore>, identity: SessionIdentity) -> Self {
        Self {
            identity,
            store,
            registry: ConnectionRegistry::new(),
            visitors: HashMap::new(),
            active: HashMap::new(),
            admin: AdminState::default(),
        }
    }

    // ── Admin side ──

    /// Newest login wins: a previous admin connection is closed.
    pub fn admin_connected(&mut self, handle: ConnectionHandle) {
        if let Some(previous) = self.admin.connection.replace(handle.clone()) {
            tracing::warn!(
                previous = %previous.id(),
                connection_id = %handle.id(),
                "admin login replaced an existing admin connection"
            );
            previous.close();
        }
        self.admin.selected = None;
        tracing::info!(connection_id = %handle.id(), "admin connected");

        send_admin(
            &handle,
            &AdminOutbound::ChatUsers {
                users: self.chat_users(),
                connected: self.registry.session_count(),
            },
        );
        let state = if self.admin.online {
            AdminOutbound::Online
        } else {
            AdminOutbound::Offline
        };
        send_admin(&handle, &state);
    }

    pub fn is_current_admin(&self, id: &ConnectionId) -> bool {
        self.admin
            .connection
            .as_ref()
            .is_some_and(|h| h.id() == id)
    }

    /// Losing the admin connection takes the admin offline for visitors.
    pub fn admin_disconnected(&mut self, id: &ConnectionId) {
        if !self.is_current_admin(id) {
            tracing::debug!(connection_id = %id, "replaced admin connection closed");
            return;
        }
        self.admin.connection = None;
        self.admin.selected = None;
        if std::mem::replace(&mut self.admin.online, false) {
            self.broadcast_presence();
        }
        tracing::info!(connection_id = %id, "admin disconnected");
    }

    pub fn go_online(&mut self) {
        if self.admin.online {
            tracing::debug!("admin already online");
            return;
        }
        self.admin.online = true;
        self.broadcast_presence();
        self.notify_admin(&AdminOutbound::Online);
        tracing::info!("admin online");
    }

    pub fn go_offline(&mut self) {
        if std::mem::replace(&mut self.admin.online, false) {
            self.broadcast_presence();
        }
        self.notify_admin(&AdminOutbound::Offline);
        tracing::info!("admin offline");
    }

    /// Point the admin at a session and push its full history.
    pub fn select_session(&mut self, token: SessionToken) -> Result<Vec<ChatMessage>, RelayError> {
        if !self.store.session_exists(&token)? {
            return Err(RelayError::InvalidSession);
        }
        let history = self.store.messages_for(&token)?;
        tracing::debug!(token = %token.short(), messages = history.len(), "admin selected session");
        self.admin.selected = Some(token);
        self.notify_admin(&AdminOutbound::ChatLog {
            messages: history.clone(),
        });
        Ok(history)
    }

    /// Persist, then fan out to the session's connections and the admin.
    pub fn route(
        &mut self,
        origin_is_visitor: bool,
        text: &str,
        token: &SessionToken,
    ) -> Result<ChatMessage, RelayError> {
        let message = self.store.record_message(token, text, origin_is_visitor)?;
        if let Some(summary) = self.active.get_mut(token) {
            summary.last_message = Some(message.sent_at.clone());
        }

        let mut delivered = 0;
        let frame = VisitorOutbound::Message {
            message: message.clone(),
        };
        match frame.to_wire() {
            Ok(wire) => {
                for handle in self.registry.connections_of(token) {
                    if handle.send(wire.clone()) {
                        delivered += 1;
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode visitor frame"),
        }

        let notice = if self.admin.selected.as_ref() == Some(token) {
            AdminOutbound::AppendMessage {
                message: message.clone(),
            }
        } else {
            AdminOutbound::NewMessage {
                token: token.clone(),
            }
        };
        self.notify_admin(&notice);

        tracing::info!(
            token = %token.short(),
            message_id = message.id,
            origin_is_visitor,
            delivered,
            "message routed"
        );
        Ok(message)
    }

    // ── Visitor side ──

    /// Greet a new visitor connection with the admin presence and a prompt
    /// to identify itself.
    pub fn visitor_connected(&mut self, handle: ConnectionHandle) {
        tracing::debug!(connection_id = %handle.id(), "visitor connection opened");
        send_visitor(&handle, &VisitorOutbound::presence(self.admin.online));
        send_visitor(&handle, &VisitorOutbound::SendCookie);
        self.visitors.insert(handle.id().clone(), handle);
    }

    /// Resume a session. Unknown tokens get `INVALIDCOOKIE` and leave the
    /// store untouched.
    pub fn resume(
        &mut self,
        handle: &ConnectionHandle,
        token: Option<SessionToken>,
    ) -> Result<(), RelayError> {
        let Some(token) = token else {
            tracing::warn!(connection_id = %handle.id(), "resume without a token");
            send_visitor(handle, &VisitorOutbound::InvalidCookie);
            return Ok(());
        };
        if !self.identity.validate(&token)? {
            tracing::warn!(
                connection_id = %handle.id(),
                token = %token.short(),
                "resume with unknown token"
            );
            send_visitor(handle, &VisitorOutbound::InvalidCookie);
            return Ok(());
        }
        self.bind(handle, token)
    }

    pub fn request_new_token(&mut self, handle: &ConnectionHandle) -> Result<SessionToken, RelayError> {
        let token = self.identity.mint()?;
        send_visitor(
            handle,
            &VisitorOutbound::SetCookie {
                token: token.clone(),
            },
        );
        self.bind(handle, token.clone())?;
        Ok(token)
    }

    /// A visitor speaking joins the active list even with no prior history.
    pub fn visitor_message(
        &mut self,
        handle: &ConnectionHandle,
        text: &str,
    ) -> Result<ChatMessage, RelayError> {
        let token = self.registry.token_for(handle.id()).cloned().ok_or_else(|| {
            RelayError::ProtocolViolation("message before a session was established".into())
        })?;
        if !self.active.contains_key(&token) {
            let last_message = self.store.last_message_timestamp(&token)?;
            self.join(token.clone(), last_message);
        }
        self.route(true, text, &token)
    }

    pub fn visitor_disconnected(&mut self, id: &ConnectionId) {
        self.visitors.remove(id);
        self.release(id);
    }

    // ── Queries ──

    pub fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            admin_connected: self.admin.connection.is_some(),
            admin_online: self.admin.online,
            connected_visitors: self.registry.session_count(),
            active_chat_users: self.active.len(),
        }
    }

    pub fn is_active(&self, token: &SessionToken) -> bool {
        self.active.contains_key(token)
    }

    pub fn is_online(&self) -> bool {
        self.admin.online
    }

    // ── Internals ──

    fn bind(&mut self, handle: &ConnectionHandle, token: SessionToken) -> Result<(), RelayError> {
        let login = self.store.touch_login(&token)?;
        let history = self.store.messages_for(&token)?;

        if self.registry.token_for(handle.id()) == Some(&token) {
            send_visitor(handle, &VisitorOutbound::ChatLog { messages: history });
            return Ok(());
        }
        if self.registry.token_for(handle.id()).is_some() {
            self.release(handle.id());
        }

        let attached = self.registry.attach(token.clone(), handle.clone(), login);
        let last_message = history.last().map(|m| m.sent_at.clone());
        let returning = !history.is_empty();
        send_visitor(handle, &VisitorOutbound::ChatLog { messages: history });

        if attached == Attached::First {
            tracing::info!(
                connection_id = %handle.id(),
                token = %token.short(),
                "visitor connected"
            );
            self.notify_admin(&AdminOutbound::AddConnectedUser);
        }
        if returning && !self.active.contains_key(&token) {
            self.join(token, last_message);
        }
        Ok(())
    }

    fn join(&mut self, token: SessionToken, last_message: Option<String>) {
        let user = ChatUserSummary {
            token: token.clone(),
            login_time: self
                .registry
                .last_login_at(&token)
                .unwrap_or_default()
                .to_string(),
            last_message,
        };
        tracing::debug!(token = %token.short(), "joined active chat users");
        self.active.insert(token, user.clone());
        self.notify_admin(&AdminOutbound::AddChatUser { user });
    }

    fn release(&mut self, id: &ConnectionId) {
        if let Detached::Last(token) = self.registry.detach(id) {
            if self.active.remove(&token).is_some() {
                self.notify_admin(&AdminOutbound::RemoveChatUser {
                    token: token.clone(),
                });
            }
            self.notify_admin(&AdminOutbound::RemoveConnectedUser);
            tracing::info!(token = %token.short(), "visitor fully disconnected");
        }
    }

    fn notify_admin(&self, frame: &AdminOutbound) {
        if let Some(admin) = &self.admin.connection {
            send_admin(admin, frame);
        }
    }

    fn broadcast_presence(&self) {
        let frame = VisitorOutbound::presence(self.admin.online);
        match frame.to_wire() {
            Ok(wire) => {
                for handle in self.visitors.values() {
                    handle.send(wire.clone());
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode presence frame"),
        }
    }

    fn chat_users(&self) -> Vec<ChatUserSummary> {
        let mut users: Vec<_> = self.active.values().cloned().collect();
        users.sort_by(|a, b| {
            a.login_time
                .cmp(&b.login_time)
                .then_with(|| a.token.cmp(&b.token))
        });
        users
    }
}

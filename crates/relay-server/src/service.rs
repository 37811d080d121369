//! The presence actor: a single task owns the `PresenceCoordinator` and
//! applies commands from connection tasks in arrival order.

use relay_core::protocol::{AdminInbound, AdminOutbound, ErrorBody, VisitorInbound, VisitorOutbound};
use relay_core::{ConnectionId, RelayError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionHandle;
use crate::presence::{send_admin, send_visitor, PresenceCoordinator, PresenceSnapshot};
use crate::{admin, visitor};

const COMMAND_QUEUE: usize = 1024;

#[derive(Debug)]
pub enum Command {
    AdminConnected(ConnectionHandle),
    AdminEvent {
        handle: ConnectionHandle,
        event: AdminInbound,
    },
    AdminDisconnected(ConnectionId),
    VisitorConnected(ConnectionHandle),
    VisitorEvent {
        handle: ConnectionHandle,
        event: VisitorInbound,
    },
    VisitorDisconnected(ConnectionId),
    Snapshot(oneshot::Sender<PresenceSnapshot>),
}

/// Cloneable front door to the presence actor.
#[derive(Clone, Debug)]
pub struct PresenceService {
    tx: mpsc::Sender<Command>,
}

impl PresenceService {
    /// Spawn the actor. It stops when `shutdown` fires or every service
    /// clone has been dropped.
    pub fn spawn(
        coordinator: PresenceCoordinator,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let task = tokio::spawn(run(coordinator, rx, shutdown));
        (Self { tx }, task)
    }

    async fn submit(&self, command: Command) {
        if self.tx.send(command).await.is_err() {
            tracing::debug!("presence actor stopped, command dropped");
        }
    }

    pub async fn admin_connected(&self, handle: ConnectionHandle) {
        self.submit(Command::AdminConnected(handle)).await;
    }

    pub async fn admin_event(&self, handle: ConnectionHandle, event: AdminInbound) {
        self.submit(Command::AdminEvent { handle, event }).await;
    }

    pub async fn admin_disconnected(&self, id: ConnectionId) {
        self.submit(Command::AdminDisconnected(id)).await;
    }

    pub async fn visitor_connected(&self, handle: ConnectionHandle) {
        self.submit(Command::VisitorConnected(handle)).await;
    }

    pub async fn visitor_event(&self, handle: ConnectionHandle, event: VisitorInbound) {
        self.submit(Command::VisitorEvent { handle, event }).await;
    }

    pub async fn visitor_disconnected(&self, id: ConnectionId) {
        self.submit(Command::VisitorDisconnected(id)).await;
    }

    /// `None` once the actor has stopped.
    pub async fn snapshot(&self) -> Option<PresenceSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Snapshot(reply)).await;
        rx.await.ok()
    }
}

async fn run(
    mut coordinator: PresenceCoordinator,
    mut rx: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        apply(&mut coordinator, command);
    }
    tracing::debug!("presence actor stopped");
}

fn apply(coordinator: &mut PresenceCoordinator, command: Command) {
    match command {
        Command::AdminConnected(handle) => coordinator.admin_connected(handle),
        Command::AdminEvent { handle, event } => {
            if let Err(err) = admin::dispatch(coordinator, &handle, event) {
                fail_request(&handle, &err, |error| {
                    send_admin(&handle, &AdminOutbound::Error { error });
                });
            }
        }
        Command::AdminDisconnected(id) => coordinator.admin_disconnected(&id),
        Command::VisitorConnected(handle) => coordinator.visitor_connected(handle),
        Command::VisitorEvent { handle, event } => {
            if let Err(err) = visitor::dispatch(coordinator, &handle, event) {
                fail_request(&handle, &err, |error| {
                    send_visitor(&handle, &VisitorOutbound::Error { error });
                });
            }
        }
        Command::VisitorDisconnected(id) => coordinator.visitor_disconnected(&id),
        Command::Snapshot(reply) => {
            let _ = reply.send(coordinator.snapshot());
        }
    }
}

/// Violations close the connection; anything else fails only this request.
fn fail_request(handle: &ConnectionHandle, err: &RelayError, reply: impl FnOnce(ErrorBody)) {
    if err.terminates_connection() {
        tracing::warn!(connection_id = %handle.id(), error = %err, "protocol violation, closing");
        handle.close();
        return;
    }
    match err {
        RelayError::StoreUnavailable(_) => {
            tracing::error!(connection_id = %handle.id(), error = %err, "request failed")
        }
        _ => tracing::warn!(connection_id = %handle.id(), error = %err, "request rejected"),
    }
    reply(ErrorBody::from(err));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use relay_core::SessionToken;
    use relay_store::{Database, MessageStore, SqliteMessageStore};
    use secrecy::SecretString;
    use serde_json::Value;

    use crate::identity::SessionIdentity;

    fn spawn() -> (PresenceService, CancellationToken, JoinHandle<()>) {
        let store: Arc<dyn MessageStore> =
            Arc::new(SqliteMessageStore::new(Database::in_memory().unwrap()));
        let identity =
            SessionIdentity::new(store.clone(), SecretString::from("salt".to_string()), 16);
        let shutdown = CancellationToken::new();
        let (service, task) =
            PresenceService::spawn(PresenceCoordinator::new(store, identity), shutdown.clone());
        (service, shutdown, task)
    }

    fn peer() -> (ConnectionHandle, mpsc::Receiver<String>) {
        ConnectionHandle::new(32, CancellationToken::new())
    }

    async fn next(rx: &mut mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn commands_apply_in_order() {
        let (service, _shutdown, _task) = spawn();
        let (admin, mut admin_rx) = peer();
        service.admin_connected(admin.clone()).await;
        service.admin_event(admin.clone(), AdminInbound::Online).await;

        assert_eq!(next(&mut admin_rx).await["TYPE"], "CHATUSERS");
        assert_eq!(next(&mut admin_rx).await["TYPE"], "OFFLINE");
        assert_eq!(next(&mut admin_rx).await["TYPE"], "ONLINE");

        let snapshot = service.snapshot().await.unwrap();
        assert!(snapshot.admin_online);
    }

    #[tokio::test]
    async fn rejected_request_gets_error_frame() {
        let (service, _shutdown, _task) = spawn();
        let (admin, mut admin_rx) = peer();
        service.admin_connected(admin.clone()).await;
        service
            .admin_event(
                admin.clone(),
                AdminInbound::Message {
                    text: "hello".into(),
                    target: SessionToken::from_raw("ghost"),
                },
            )
            .await;

        next(&mut admin_rx).await;
        next(&mut admin_rx).await;
        let frame = next(&mut admin_rx).await;
        assert_eq!(frame["TYPE"], "ERROR");
        assert_eq!(frame["ERROR"]["code"], "INVALID_SESSION");
        assert_eq!(frame["VIEW"], "CHATSCREEN");
        assert!(!admin.is_closed());
    }

    #[tokio::test]
    async fn violation_closes_connection() {
        let (service, _shutdown, _task) = spawn();
        let (visitor, _rx) = peer();
        service.visitor_connected(visitor.clone()).await;
        service
            .visitor_event(visitor.clone(), VisitorInbound::Message { text: "hi".into() })
            .await;
        service.snapshot().await.unwrap();
        assert!(visitor.is_closed());
    }

    #[tokio::test]
    async fn shutdown_stops_actor() {
        let (service, shutdown, task) = spawn();
        shutdown.cancel();
        task.await.unwrap();
        assert!(service.snapshot().await.is_none());
    }
}

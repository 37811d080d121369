//! Admin endpoint: one authenticated operator connection.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use relay_core::protocol::AdminInbound;
use relay_core::RelayError;
use tracing::Instrument;

use crate::connection::{Connection, ConnectionHandle};
use crate::presence::PresenceCoordinator;
use crate::server::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve(socket, state))
}

async fn serve(socket: WebSocket, state: AppState) {
    let (handle, rx) =
        ConnectionHandle::new(state.config.max_send_queue, state.shutdown.child_token());
    let id = handle.id().clone();
    let span = tracing::info_span!("admin", connection_id = %id);

    async move {
        let mut conn = Connection::start(socket, handle.clone(), rx, state.heartbeat());
        state.presence.admin_connected(handle.clone()).await;

        loop {
            match conn.next_text().await {
                Ok(Some(text)) => match AdminInbound::decode(&text) {
                    Ok(event) => state.presence.admin_event(handle.clone(), event).await,
                    Err(e) => {
                        tracing::warn!(connection_id = %id, error = %e, "closing admin connection");
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %id, error = %e, "closing admin connection");
                    break;
                }
            }
        }

        state.presence.admin_disconnected(id).await;
        conn.finish().await;
    }
    .instrument(span)
    .await
}

/// Admin dispatch table. Events from a replaced admin connection are dropped.
pub(crate) fn dispatch(
    coordinator: &mut PresenceCoordinator,
    handle: &ConnectionHandle,
    event: AdminInbound,
) -> Result<(), RelayError> {
    if !coordinator.is_current_admin(handle.id()) {
        tracing::debug!(connection_id = %handle.id(), "event from replaced admin ignored");
        return Ok(());
    }
    match event {
        AdminInbound::Online => coordinator.go_online(),
        AdminInbound::Offline => coordinator.go_offline(),
        AdminInbound::SelectSession { token } => {
            coordinator.select_session(token)?;
        }
        AdminInbound::Message { text, target } => {
            coordinator.route(false, &text, &target)?;
        }
        AdminInbound::Unknown => tracing::debug!("ignoring unknown admin event"),
    }
    Ok(())
}

//! Visitor endpoint: anonymous, any number of connections per session.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use relay_core::protocol::VisitorInbound;
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
    let span = tracing::info_span!("visitor", connection_id = %id);

    async move {
        let mut conn = Connection::start(socket, handle.clone(), rx, state.heartbeat());
        state.presence.visitor_connected(handle.clone()).await;

        loop {
            match conn.next_text().await {
                Ok(Some(text)) => match VisitorInbound::decode(&text) {
                    Ok(event) => state.presence.visitor_event(handle.clone(), event).await,
                    Err(e) => {
                        tracing::warn!(connection_id = %id, error = %e, "closing visitor connection");
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %id, error = %e, "closing visitor connection");
                    break;
                }
            }
        }

        state.presence.visitor_disconnected(id).await;
        conn.finish().await;
    }
    .instrument(span)
    .await
}

/// Visitor dispatch table.
pub(crate) fn dispatch(
    coordinator: &mut PresenceCoordinator,
    handle: &ConnectionHandle,
    event: VisitorInbound,
) -> Result<(), RelayError> {
    match event {
        VisitorInbound::Resume { token } => coordinator.resume(handle, token),
        VisitorInbound::RequestNewToken => coordinator.request_new_token(handle).map(|_| ()),
        VisitorInbound::Message { text } => coordinator.visitor_message(handle, &text).map(|_| ()),
        VisitorInbound::Unknown => {
            tracing::debug!(connection_id = %handle.id(), "ignoring unknown visitor event");
            Ok(())
        }
    }
}

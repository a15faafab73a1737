//! WebSocket handler — one store session per connection.
//!
//! DESIGN
//! ======
//! On upgrade, the coordinator authenticates the connection from its query
//! parameters and registers its outbound channel with the hub. The task then
//! runs a `select!` loop:
//! - Incoming text frames → decode `Inbound` → coordinator
//! - Hub messages (actions, version notices, projections) → socket
//! - Provisioning completion → first hydrate
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → authenticate, join rooms, hydrate or start provisioning
//! 2. Client sends `action` / `client-action` / `present`
//! 3. Close → unregister from the hub

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::message::{Inbound, Outbound};
use crate::services::coordinator::{ConnectionInfo, Coordinator, Session};
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state, params))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(socket: WebSocket, state: AppState, params: HashMap<String, String>) {
    let connection = Uuid::new_v4();
    let coordinator = Arc::clone(state.engine.coordinator());

    // Per-connection channel fed by the hub.
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.config.outbound_capacity);

    let mut session = match coordinator
        .connect(ConnectionInfo { id: connection, params }, tx)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            error!(%connection, error = %e, "ws: connection setup failed");
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => dispatch_text(&coordinator, &session, text.as_str()).await,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(out) = rx.recv() => {
                if send_message(&mut sink, &out).await.is_err() {
                    break;
                }
            }
            _ = session.provisioned(), if session.is_pending() => {
                coordinator.complete_hydration(&session).await;
            }
        }
    }

    coordinator.disconnect(&session).await;
    info!(%connection, "ws: client disconnected");
}

// =============================================================================
// INBOUND
// =============================================================================

async fn dispatch_text(coordinator: &Coordinator, session: &Session, text: &str) {
    let msg: Inbound = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(connection = %session.connection, error = %e, "ws: invalid inbound message");
            return;
        }
    };
    if let Err(e) = coordinator.handle(session, msg).await {
        error!(connection = %session.connection, identity = %session.identity, error = %e, "ws: failed to enqueue action");
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

async fn send_message(sink: &mut SplitSink<WebSocket, Message>, msg: &Outbound) -> Result<(), ()> {
    let json = match serde_json::to_string(msg) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, event = msg.event(), "ws: failed to serialize message");
            return Err(());
        }
    };
    debug!(event = msg.event(), "ws: send message");
    sink.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;

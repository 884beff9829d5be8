//! WebSocket upgrade handlers: the single `/extension` socket to the bridge
//! host, and the `/client` (plus `/client/:session`) sockets automation
//! drivers connect through.

use std::sync::Arc;
use uuid::Uuid;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};

use super::bridge_link;
use super::router::handle_client_command;
use super::state::{ClientHandle, RelayState};
use crate::cdp::CdpCommand;

const SESSION_HEADER: &str = "X-DevBrowser-Session";
const DEFAULT_SESSION: &str = "default";

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/extension", get(extension_upgrade))
        .route("/client", get(client_upgrade))
        .route("/client/:session", get(client_upgrade_with_session))
        .with_state(state)
}

async fn extension_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| bridge_link::handle_extension_socket(socket, state))
}

async fn client_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let session = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SESSION)
        .to_string();
    ws.on_upgrade(move |socket| handle_client_socket(socket, state, session))
}

async fn client_upgrade_with_session(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    Path(session): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client_socket(socket, state, session))
}

/// Drive one client WebSocket: register a [`ClientHandle`], relay incoming
/// commands through [`handle_client_command`], and clean up the client's
/// session membership (but never its targets or the bridge link) on
/// disconnect.
async fn handle_client_socket(socket: WebSocket, state: Arc<RelayState>, session: String) {
    let client_id = Uuid::new_v4().to_string();
    let (mut write, mut read) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();

    state.clients.lock().await.insert(
        client_id.clone(),
        ClientHandle {
            sender: tx,
            known_targets: Default::default(),
            session: session.clone(),
        },
    );
    {
        let mut sessions = state.sessions.lock().await;
        sessions.entry(session.clone()).or_default().client_ids.insert(client_id.clone());
    }
    tracing::info!(client_id = %client_id, session = %session, "client connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let Ok(cmd) = serde_json::from_str::<CdpCommand>(&text) else {
                    tracing::warn!(client_id = %client_id, raw = %text, "malformed client command, closing socket");
                    let clients = state.clients.lock().await;
                    if let Some(client) = clients.get(&client_id) {
                        let _ = client.sender.send(Message::Text(json_rpc_parse_error().to_string().into()));
                    }
                    drop(clients);
                    break;
                };
                let reply = handle_client_command(&state, &client_id, cmd).await;
                let clients = state.clients.lock().await;
                if let Some(client) = clients.get(&client_id) {
                    let _ = client.sender.send(Message::Text(reply.to_string().into()));
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    writer.abort();
    state.clients.lock().await.remove(&client_id);
    if let Some(entry) = state.sessions.lock().await.get_mut(&session) {
        entry.client_ids.remove(&client_id);
    }
    tracing::info!(client_id = %client_id, session = %session, "client disconnected");
}

/// A standard JSON-RPC parse-error reply (`-32700`) with no `id`, sent
/// before the socket is closed on malformed input (§7).
fn json_rpc_parse_error() -> serde_json::Value {
    serde_json::json!({
        "error": { "code": -32700, "message": "Parse error" },
    })
}

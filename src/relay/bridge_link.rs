//! The relay's side of the single bridge-host WebSocket: installs the
//! outbound sender on [`RelayState`], replaces (with close code 4001) any
//! prior connection, and dispatches incoming [`BridgeMessage`] frames to
//! the pending-response table or to session-aware event delivery.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};

use super::recovery;
use super::state::{ConnectedTarget, PendingDetach, RelayState};
use crate::cdp::{parse_bridge_message, BridgeEvent, BridgeMessage};

/// Close code telling a previous bridge-host connection to stand down.
const CLOSE_REPLACED: u16 = 4001;

/// Drive one accepted `/extension` WebSocket end to end: install it as the
/// active bridge link, displacing and 4001-closing whatever was there
/// before, then read and dispatch frames until the socket closes.
pub async fn handle_extension_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut write, mut read) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();

    if let Some(previous) = state.set_bridge_out(Some(tx)).await {
        let _ = previous.send(Message::Close(Some(CloseFrame {
            code: CLOSE_REPLACED,
            reason: "Extension Replaced".into(),
        })));
    }
    tracing::info!("bridge host connected");

    tokio::spawn({
        let state = state.clone();
        async move {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            recovery::run(&state).await;
        }
    });

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
                if !handle_incoming(&state, &text).await {
                    tracing::warn!(raw = %text, "malformed message from bridge host, closing socket");
                    let _ = state
                        .bridge_sender()
                        .await
                        .map(|tx| tx.send(Message::Text(json_rpc_parse_error().to_string().into())));
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    writer.abort();
    // Only clear the link if nobody has since replaced it.
    if state.is_bridge_connected().await {
        state.set_bridge_out(None).await;
    }
    tracing::info!("bridge host disconnected");
}

/// A standard JSON-RPC parse-error reply (`-32700`) with no `id`, sent
/// before the socket is closed on malformed input (§7).
fn json_rpc_parse_error() -> Value {
    json!({ "error": { "code": -32700, "message": "Parse error" } })
}

/// Dispatch one parsed frame from the bridge host. Returns `false` if the
/// frame could not be classified at all (malformed input), signaling the
/// caller to close the socket per §7.
async fn handle_incoming(state: &Arc<RelayState>, text: &str) -> bool {
    match parse_bridge_message(text) {
        Some(BridgeMessage::Response { id, result }) => {
            state.resolve_pending(id, result).await;
        }
        Some(BridgeMessage::Event(event)) => handle_event(state, event).await,
        Some(BridgeMessage::Log(log)) => {
            tracing::info!(level = %log.level, args = ?log.args, "bridge host log");
        }
        Some(BridgeMessage::Command(_)) => {
            tracing::warn!("bridge host sent a command; the relay does not accept inbound commands");
        }
        None => return false,
    }
    true
}

async fn handle_event(state: &Arc<RelayState>, event: BridgeEvent) {
    match event.method.as_str() {
        "Target.attachedToTarget" => handle_attached(state, &event).await,
        "Target.detachedFromTarget" => handle_detached(state, &event).await,
        "Target.targetInfoChanged" => handle_info_changed(state, &event).await,
        _ => deliver_to_owner(state, &event).await,
    }
}

async fn handle_attached(state: &Arc<RelayState>, event: &BridgeEvent) {
    let Some(sid) = event.session_id.clone() else { return };
    let Some(target_info) = event.params.get("targetInfo") else { return };
    let target_id = target_info.get("targetId").and_then(Value::as_str).unwrap_or_default().to_string();
    let url = target_info.get("url").and_then(Value::as_str).unwrap_or_default().to_string();
    let title = target_info.get("title").and_then(Value::as_str).unwrap_or_default().to_string();
    let target_type = target_info.get("type").and_then(Value::as_str).unwrap_or("page").to_string();

    let connected = ConnectedTarget {
        cdp_session_id: sid.clone(),
        target_id: target_id.clone(),
        url: url.clone(),
        title,
        target_type,
    };
    state.connected_targets.lock().await.insert(sid.clone(), connected.clone());
    state.notify_target_attached(&connected).await;

    if let Some(agent_session) = event.agent_session.clone() {
        state.target_to_agent_session.lock().await.insert(sid.clone(), agent_session.clone());
        let mut sessions = state.sessions.lock().await;
        sessions.entry(agent_session).or_default().target_sessions.insert(sid.clone());
    }

    // A reattach under a new cdpSessionId for a target that was mid-grace
    // (§8 invariants 8/9): cancel the pending removal and repoint the named
    // page at the fresh session id instead of letting the name fall out of
    // `GET /pages`.
    if let Some(pending) = state.cancel_detach_grace(&target_id).await {
        state.named_pages.lock().await.insert(pending.key.clone(), sid.clone());
        let tab_id = state
            .snapshot_persisted()
            .iter()
            .find(|p| p.key == pending.key)
            .map(|p| p.tab_id)
            .unwrap_or(0);
        state
            .upsert_persisted(crate::persistence::PersistedPage {
                key: pending.key,
                target_id,
                tab_id,
                url,
                last_seen: now_unix_secs(),
            })
            .await;
    }

    deliver_to_owner(state, event).await;
}

fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn handle_detached(state: &Arc<RelayState>, event: &BridgeEvent) {
    let Some(sid) = event.session_id.clone() else { return };
    let target_id = state.connected_targets.lock().await.remove(&sid).map(|t| t.target_id);

    // The named page, if any, stays addressable for the grace window in
    // case this is a cross-origin navigation reattaching under a new
    // cdpSessionId (§8 invariants 8/9) rather than a real tab close.
    let pending_key = {
        let named = state.named_pages.lock().await;
        named.iter().find(|(_, v)| **v == sid).map(|(k, _)| k.clone())
    };

    let agent_session = state.target_to_agent_session.lock().await.remove(&sid);
    if let Some(session_id) = &agent_session {
        let mut sessions = state.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.target_sessions.remove(&sid);
        }
    }

    if let (Some(key), Some(target_id)) = (&pending_key, &target_id) {
        let name = agent_session
            .as_deref()
            .and_then(|s| key.strip_prefix(&format!("{s}:")))
            .unwrap_or(key.as_str())
            .to_string();
        state
            .start_detach_grace(
                target_id.clone(),
                PendingDetach {
                    key: key.clone(),
                    name,
                    agent_session: agent_session.clone(),
                },
            )
            .await;
    }

    deliver_to_owner(state, event).await;
}

async fn handle_info_changed(state: &Arc<RelayState>, event: &BridgeEvent) {
    if let Some(sid) = event.session_id.clone() {
        if let Some(url) = event.params.get("targetInfo").and_then(|t| t.get("url")).and_then(Value::as_str) {
            let mut targets = state.connected_targets.lock().await;
            if let Some(target) = targets.get_mut(&sid) {
                target.url = url.to_string();
            }
        }
    }
    deliver_to_owner(state, event).await;
}

/// Deliver an event to every client of the owning agent session, or to
/// every connected client if the target is not yet claimed by any session.
async fn deliver_to_owner(state: &Arc<RelayState>, event: &BridgeEvent) {
    let owner = match &event.session_id {
        Some(sid) => state.target_to_agent_session.lock().await.get(sid).cloned(),
        None => None,
    };

    let payload = json!({ "method": event.method, "params": event.params, "sessionId": event.session_id });
    let clients = state.clients.lock().await;
    for client in clients.values() {
        let targeted = owner.is_none() || owner.as_deref() == Some(client.session.as_str());
        if targeted {
            let _ = client.sender.send(Message::Text(payload.to_string().into()));
        }
    }
}

//! Per-client CDP command handling: the relay's own minimal CDP persona
//! (§4.G) answered locally, everything else forwarded to the bridge host as
//! `forwardCDPCommand`.

use std::sync::Arc;

use serde_json::{json, Value};

use super::state::{ConnectedTarget, RelayState};
use crate::cdp::CdpCommand;

fn target_info_json(t: &ConnectedTarget) -> Value {
    json!({
        "targetId": t.target_id,
        "type": t.target_type,
        "title": t.title,
        "url": t.url,
        "attached": true,
    })
}

/// Handle one command from a client and return the JSON-RPC-shaped reply
/// (`{id, result}` or `{id, error}`). Spontaneous events this command
/// triggers (e.g. synthesized `attachedToTarget`) are delivered to the
/// originating client's socket as a side effect, after the reply value has
/// been computed.
pub async fn handle_client_command(state: &Arc<RelayState>, client_id: &str, cmd: CdpCommand) -> Value {
    if !state.is_bridge_connected().await && !is_locally_answerable(&cmd.method) {
        return json!({
            "id": cmd.id,
            "sessionId": cmd.session_id,
            "error": { "message": "Extension not connected" },
        });
    }

    let result = dispatch(state, client_id, &cmd).await;
    match result {
        Ok(value) => json!({ "id": cmd.id, "sessionId": cmd.session_id, "result": value }),
        Err(message) => json!({ "id": cmd.id, "sessionId": cmd.session_id, "error": { "message": message } }),
    }
}

/// Methods the relay answers without the bridge host being connected.
fn is_locally_answerable(method: &str) -> bool {
    matches!(
        method,
        "Browser.getVersion"
            | "Browser.setDownloadBehavior"
            | "Target.setAutoAttach"
            | "Target.setDiscoverTargets"
            | "Target.attachToBrowserTarget"
            | "Target.detachFromTarget"
            | "Target.attachToTarget"
            | "Target.getTargetInfo"
            | "Target.getTargets"
    )
}

async fn dispatch(state: &Arc<RelayState>, client_id: &str, cmd: &CdpCommand) -> Result<Value, String> {
    let params = cmd.params.clone().unwrap_or(Value::Null);
    match cmd.method.as_str() {
        "Browser.getVersion" => Ok(json!({
            "protocolVersion": "1.3",
            "product": "devbridge-relay",
            "revision": "1",
            "userAgent": "devbridge-relay",
        })),
        "Browser.setDownloadBehavior" => Ok(json!({})),
        "Target.setAutoAttach" => {
            if cmd.session_id.is_some() {
                forward(state, cmd.session_id.clone(), &cmd.method, Some(params)).await
            } else {
                announce_attached_to(state, client_id).await;
                Ok(json!({}))
            }
        }
        "Target.setDiscoverTargets" => {
            announce_created_to(state, client_id).await;
            Ok(json!({}))
        }
        "Target.attachToBrowserTarget" => Ok(json!({ "sessionId": "browser" })),
        "Target.detachFromTarget" => {
            if params.get("sessionId").and_then(Value::as_str) == Some("browser") {
                Ok(json!({}))
            } else {
                forward(state, cmd.session_id.clone(), &cmd.method, Some(params)).await
            }
        }
        "Target.attachToTarget" => attach_to_target(state, client_id, &params).await,
        "Target.getTargetInfo" => get_target_info(state, cmd, &params).await,
        "Target.getTargets" => {
            let targets = state.connected_targets.lock().await;
            let list: Vec<Value> = targets.values().map(target_info_json).collect();
            Ok(json!({ "targetInfos": list }))
        }
        _ => forward(state, cmd.session_id.clone(), &cmd.method, cmd.params.clone()).await,
    }
}

async fn forward(state: &Arc<RelayState>, session_id: Option<String>, method: &str, params: Option<Value>) -> Result<Value, String> {
    state
        .send_bridge_command(
            "forwardCDPCommand",
            Some(json!({ "sessionId": session_id, "method": method, "params": params })),
        )
        .await
        .map_err(|e| e.to_string())
}

async fn attach_to_target(state: &Arc<RelayState>, client_id: &str, params: &Value) -> Result<Value, String> {
    let target_id = params
        .get("targetId")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing targetId".to_string())?;

    let target = {
        let targets = state.connected_targets.lock().await;
        targets.values().find(|t| t.target_id == target_id).cloned()
    }
    .ok_or_else(|| format!("no target found for {target_id}"))?;

    mark_known_and_notify(state, client_id, &target).await;
    Ok(json!({ "sessionId": target.cdp_session_id }))
}

async fn get_target_info(state: &Arc<RelayState>, cmd: &CdpCommand, params: &Value) -> Result<Value, String> {
    let targets = state.connected_targets.lock().await;
    let target = if let Some(target_id) = params.get("targetId").and_then(Value::as_str) {
        targets.values().find(|t| t.target_id == target_id)
    } else if let Some(sid) = cmd.session_id.as_deref() {
        targets.get(sid)
    } else {
        targets.values().next()
    };
    target
        .map(|t| json!({ "targetInfo": target_info_json(t) }))
        .ok_or_else(|| "no target available".to_string())
}

/// Emit `Target.attachedToTarget` for every currently-known target this
/// client has not already been told about.
async fn announce_attached_to(state: &Arc<RelayState>, client_id: &str) {
    let pending: Vec<ConnectedTarget> = {
        let targets = state.connected_targets.lock().await;
        let clients = state.clients.lock().await;
        let Some(client) = clients.get(client_id) else {
            return;
        };
        targets
            .values()
            .filter(|t| !client.known_targets.contains(&t.target_id))
            .cloned()
            .collect()
    };
    for target in pending {
        mark_known_and_notify(state, client_id, &target).await;
    }
}

async fn announce_created_to(state: &Arc<RelayState>, client_id: &str) {
    let targets: Vec<ConnectedTarget> = state.connected_targets.lock().await.values().cloned().collect();
    for target in targets {
        send_event(
            state,
            client_id,
            "Target.targetCreated",
            json!({ "targetInfo": target_info_json(&target) }),
            None,
        )
        .await;
    }
}

async fn mark_known_and_notify(state: &Arc<RelayState>, client_id: &str, target: &ConnectedTarget) {
    {
        let mut clients = state.clients.lock().await;
        if let Some(client) = clients.get_mut(client_id) {
            if !client.known_targets.insert(target.target_id.clone()) {
                return;
            }
        }
    }
    send_event(
        state,
        client_id,
        "Target.attachedToTarget",
        json!({
            "sessionId": target.cdp_session_id,
            "targetInfo": target_info_json(target),
            "waitingForDebugger": false,
        }),
        Some(target.cdp_session_id.clone()),
    )
    .await;
}

async fn send_event(state: &Arc<RelayState>, client_id: &str, method: &str, params: Value, session_id: Option<String>) {
    let clients = state.clients.lock().await;
    let Some(client) = clients.get(client_id) else {
        return;
    };
    let payload = json!({ "method": method, "params": params, "sessionId": session_id });
    let _ = client
        .sender
        .send(axum::extract::ws::Message::Text(payload.to_string().into()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::state::ClientHandle;
    use std::time::Duration;

    fn cmd(id: u64, method: &str, params: Option<Value>) -> CdpCommand {
        CdpCommand {
            id,
            method: method.to_string(),
            params,
            session_id: None,
        }
    }

    async fn register_client(state: &Arc<RelayState>, client_id: &str) -> tokio::sync::mpsc::UnboundedReceiver<axum::extract::ws::Message> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        state.clients.lock().await.insert(
            client_id.to_string(),
            ClientHandle {
                sender: tx,
                known_targets: Default::default(),
                session: "default".to_string(),
            },
        );
        rx
    }

    fn state() -> Arc<RelayState> {
        RelayState::new(None, 7, Duration::from_millis(50), 5, 3, Duration::from_secs(1), Duration::from_millis(500), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn browser_get_version_answered_locally() {
        let state = state();
        let reply = handle_client_command(&state, "c1", cmd(1, "Browser.getVersion", None)).await;
        assert_eq!(reply["result"]["product"], "devbridge-relay");
    }

    #[tokio::test]
    async fn unforwardable_method_without_bridge_errors() {
        let state = state();
        let reply = handle_client_command(&state, "c1", cmd(1, "Page.navigate", None)).await;
        assert_eq!(reply["error"]["message"], "Extension not connected");
    }

    #[tokio::test]
    async fn set_auto_attach_announces_known_targets_once() {
        let state = state();
        let mut rx = register_client(&state, "c1").await;
        state.connected_targets.lock().await.insert(
            "sid-1".to_string(),
            ConnectedTarget {
                cdp_session_id: "sid-1".to_string(),
                target_id: "t1".to_string(),
                url: "https://example.com".to_string(),
                title: "Example".to_string(),
                target_type: "page".to_string(),
            },
        );

        let reply = handle_client_command(&state, "c1", cmd(1, "Target.setAutoAttach", None)).await;
        assert_eq!(reply["result"], json!({}));

        let event = rx.try_recv().unwrap();
        let axum::extract::ws::Message::Text(text) = event else { panic!("expected text frame") };
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["method"], "Target.attachedToTarget");

        // A second call must not re-announce the same target.
        handle_client_command(&state, "c1", cmd(2, "Target.setAutoAttach", None)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn attach_to_target_returns_session_id() {
        let state = state();
        let _rx = register_client(&state, "c1").await;
        state.connected_targets.lock().await.insert(
            "sid-1".to_string(),
            ConnectedTarget {
                cdp_session_id: "sid-1".to_string(),
                target_id: "t1".to_string(),
                url: "https://example.com".to_string(),
                title: "Example".to_string(),
                target_type: "page".to_string(),
            },
        );

        let reply = handle_client_command(
            &state,
            "c1",
            cmd(1, "Target.attachToTarget", Some(json!({ "targetId": "t1" }))),
        )
        .await;
        assert_eq!(reply["result"]["sessionId"], "sid-1");
    }

    #[tokio::test]
    async fn attach_to_browser_target_returns_sentinel() {
        let state = state();
        let reply = handle_client_command(&state, "c1", cmd(1, "Target.attachToBrowserTarget", None)).await;
        assert_eq!(reply["result"]["sessionId"], "browser");
    }
}

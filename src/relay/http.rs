//! REST surface for page lifecycle (§4.I / §6), a pure facade over
//! [`RelayState`] sharing it with the WebSocket handlers behind the same
//! `Arc`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use super::state::{page_key, RelayState};

const SESSION_HEADER: &str = "X-DevBrowser-Session";
const DEFAULT_SESSION: &str = "default";
const MAX_NAME_LEN: usize = 256;

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/pages", get(list_pages).post(create_page))
        .route("/pages/:name", delete(delete_page))
        .route("/sessions/:id", delete(close_session))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn session_of(headers: &HeaderMap) -> String {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SESSION)
        .to_string()
}

async fn get_root(State(state): State<Arc<RelayState>>) -> Json<Value> {
    Json(json!({
        "wsEndpoint": "/client",
        "extensionConnected": state.is_bridge_connected().await,
        "mode": "extension",
    }))
}

async fn list_pages(State(state): State<Arc<RelayState>>, headers: HeaderMap) -> Json<Value> {
    let session = session_of(&headers);
    let names = state
        .sessions
        .lock()
        .await
        .get(&session)
        .map(|s| s.page_names.iter().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    Json(json!({ "pages": names }))
}

#[derive(Debug, Deserialize)]
struct CreatePageRequest {
    name: String,
    #[serde(default)]
    #[allow(dead_code)]
    viewport: Option<Value>,
    #[serde(default)]
    #[allow(dead_code)]
    pinned: bool,
    #[serde(default)]
    url: Option<String>,
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("name must be at most {MAX_NAME_LEN} characters"));
    }
    if name.contains(':') {
        return Err("name must not contain a colon".to_string());
    }
    Ok(())
}

async fn create_page(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(req): Json<CreatePageRequest>,
) -> impl IntoResponse {
    let session = session_of(&headers);
    if let Err(message) = validate_name(&session).and_then(|()| validate_name(&req.name)) {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response();
    }

    let key = page_key(&session, &req.name);

    if let Some(sid) = state.named_pages.lock().await.get(&key).cloned() {
        let existing = { state.connected_targets.lock().await.get(&sid).cloned() };
        // The sessionId may be stale if a cross-origin navigation detached
        // it moments ago and a reattach under a new cdpSessionId is still
        // in flight (§8 invariants 8/9); ride out the grace window on the
        // stable targetId from the persisted entry rather than treating the
        // name as gone.
        let existing = match existing {
            Some(t) => Some(t),
            None => {
                let target_id = state.snapshot_persisted().iter().find(|p| p.key == key).map(|p| p.target_id.clone());
                match target_id {
                    Some(target_id) => state.wait_for_target(&target_id, state.grace_period).await,
                    None => None,
                }
            }
        };
        if let Some(target) = existing {
            let _ = state
                .send_bridge_command(
                    "forwardCDPCommand",
                    Some(json!({ "sessionId": target.cdp_session_id, "method": "Target.activateTarget" })),
                )
                .await;
            return Json(json!({
                "wsEndpoint": "/client",
                "name": req.name,
                "targetId": target.target_id,
                "url": target.url,
            }))
            .into_response();
        }
    }

    let existing_count = state
        .sessions
        .lock()
        .await
        .get(&session)
        .map(|s| s.page_names.len())
        .unwrap_or(0);
    if existing_count >= state.tab_limit {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": format!("session has reached its tab limit ({} of {})", existing_count, state.tab_limit) })),
        )
            .into_response();
    }

    if !state.is_bridge_connected().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Extension not connected" })),
        )
            .into_response();
    }

    let create_result = state
        .send_bridge_command(
            "createTab",
            Some(json!({ "sessionId": session, "url": req.url })),
        )
        .await;
    let created = match create_result {
        Ok(v) => v,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": e.to_string() }))).into_response(),
    };
    let Some(target_id) = created.get("targetId").and_then(Value::as_str) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "createTab returned no targetId" }))).into_response();
    };

    let target = state.wait_for_target(target_id, state.target_wait_timeout).await;
    let Some(target) = target else {
        return (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({ "error": "timed out waiting for the new target to attach" })),
        )
            .into_response();
    };

    state.named_pages.lock().await.insert(key.clone(), target.cdp_session_id.clone());
    {
        let mut sessions = state.sessions.lock().await;
        let entry = sessions.entry(session.clone()).or_default();
        entry.page_names.insert(req.name.clone());
        entry.target_sessions.insert(target.cdp_session_id.clone());
    }
    state.target_to_agent_session.lock().await.insert(target.cdp_session_id.clone(), session.clone());

    state
        .upsert_persisted(crate::persistence::PersistedPage {
            key,
            target_id: target.target_id.clone(),
            tab_id: created.get("tabId").and_then(Value::as_u64).unwrap_or(0),
            url: target.url.clone(),
            last_seen: now_unix_secs(),
        })
        .await;

    let mut response = json!({
        "wsEndpoint": "/client",
        "name": req.name,
        "targetId": target.target_id,
        "url": target.url,
    });
    if existing_count + 1 >= state.warn_threshold {
        response["warning"] = json!(format!(
            "session is approaching its tab limit ({} of {})",
            existing_count + 1,
            state.tab_limit
        ));
    }
    Json(response).into_response()
}

async fn delete_page(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let session = session_of(&headers);
    let key = page_key(&session, &name);

    let Some(sid) = state.named_pages.lock().await.remove(&key) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "no such page" }))).into_response();
    };

    let _ = state
        .send_bridge_command(
            "forwardCDPCommand",
            Some(json!({ "sessionId": sid, "method": "Target.closeTarget" })),
        )
        .await;

    state.connected_targets.lock().await.remove(&sid);
    state.target_to_agent_session.lock().await.remove(&sid);
    if let Some(entry) = state.sessions.lock().await.get_mut(&session) {
        entry.page_names.remove(&name);
        entry.target_sessions.remove(&sid);
    }
    state.remove_persisted(&key).await;

    Json(json!({ "success": true })).into_response()
}

async fn close_session(State(state): State<Arc<RelayState>>, Path(id): Path<String>) -> Json<Value> {
    let page_names: Vec<String> = state
        .sessions
        .lock()
        .await
        .get(&id)
        .map(|s| s.page_names.iter().cloned().collect())
        .unwrap_or_default();

    let _ = state
        .send_bridge_command("closeSession", Some(json!({ "sessionId": id })))
        .await;

    let keys: Vec<String> = page_names.iter().map(|n| page_key(&id, n)).collect();
    for key in &keys {
        if let Some(sid) = state.named_pages.lock().await.remove(key) {
            state.connected_targets.lock().await.remove(&sid);
            state.target_to_agent_session.lock().await.remove(&sid);
        }
        state.remove_persisted(key).await;
    }
    state.sessions.lock().await.remove(&id);

    Json(json!({ "closed": page_names.len(), "pages": page_names }))
}

async fn stats(State(state): State<Arc<RelayState>>) -> Json<Value> {
    Json(json!({
        "extensionConnected": state.is_bridge_connected().await,
        "connectedTargets": state.connected_targets.lock().await.len(),
        "namedPages": state.named_pages.lock().await.len(),
        "clients": state.clients.lock().await.len(),
        "sessions": state.sessions.lock().await.len(),
        "persistedPages": state.snapshot_persisted().len(),
    }))
}

fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<RelayState> {
        RelayState::new(None, 7, Duration::from_millis(50), 2, 1, Duration::from_millis(100), Duration::from_millis(500), Duration::from_secs(5))
    }

    #[test]
    fn validate_name_rejects_empty() {
        assert!(validate_name("").is_err());
    }

    #[test]
    fn validate_name_rejects_colon() {
        let err = validate_name("a:b").unwrap_err();
        assert!(err.contains("colon"));
    }

    #[test]
    fn validate_name_rejects_too_long() {
        let name = "a".repeat(300);
        assert!(validate_name(&name).is_err());
    }

    #[tokio::test]
    async fn create_page_without_bridge_returns_503() {
        let state = state();
        let headers = HeaderMap::new();
        let response = create_page(
            State(state),
            headers,
            Json(CreatePageRequest {
                name: "home".to_string(),
                viewport: None,
                pinned: false,
                url: None,
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn delete_unknown_page_returns_404() {
        let state = state();
        let response = delete_page(State(state), HeaderMap::new(), Path("ghost".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_pages_empty_for_unknown_session() {
        let state = state();
        let Json(value) = list_pages(State(state), HeaderMap::new()).await;
        assert_eq!(value["pages"], json!([]));
    }
}

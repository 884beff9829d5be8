//! Shared harness for the end-to-end relay scenarios: spins up a real
//! relay server on an ephemeral port and drives a scriptable fake bridge
//! host against it over a real WebSocket, the same way the bridge-host
//! binary would connect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::MaybeTlsStream;

use devbridge::relay::{self, RelayOptions};

pub struct RunningRelay {
    pub http_base: String,
    pub ws_base: String,
}

/// Start a relay instance bound to `127.0.0.1:0` with no persistence, a tab
/// limit of 5 and a warn threshold of 3 (matching the scenario table).
pub async fn spawn_relay() -> RunningRelay {
    let app = relay::build(RelayOptions {
        persistence_path: None,
        max_age_days: 7,
        debounce: Duration::from_millis(20),
        tab_limit: 5,
        warn_threshold: 3,
        command_timeout: Duration::from_secs(10),
        grace_period: Duration::from_millis(500),
        target_wait_timeout: Duration::from_secs(5),
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    RunningRelay {
        http_base: format!("http://{addr}"),
        ws_base: format!("ws://{addr}"),
    }
}

#[derive(Clone)]
struct TabRecord {
    target_id: String,
    session_id: String,
    url: String,
    agent_session: String,
}

struct FakeState {
    tabs: Mutex<HashMap<u64, TabRecord>>,
    next_tab_id: AtomicU64,
    attach_delay_ms: AtomicU64,
}

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A scriptable stand-in for the bridge-host binary, connected to the
/// relay's `/extension` socket exactly the way `ConnectionManager` would.
pub struct FakeBridge {
    write: Arc<Mutex<futures_util::stream::SplitSink<WsStream, WsMessage>>>,
    state: Arc<FakeState>,
}

impl FakeBridge {
    pub async fn connect(relay: &RunningRelay) -> Self {
        let url = format!("{}/extension", relay.ws_base);
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (write, mut read) = ws.split();
        let write = Arc::new(Mutex::new(write));
        let state = Arc::new(FakeState {
            tabs: Mutex::new(HashMap::new()),
            next_tab_id: AtomicU64::new(1),
            attach_delay_ms: AtomicU64::new(0),
        });

        let loop_write = write.clone();
        let loop_state = state.clone();
        tokio::spawn(async move {
            while let Some(Ok(WsMessage::Text(text))) = read.next().await {
                handle_command(&text, &loop_write, &loop_state).await;
            }
        });

        Self { write, state }
    }

    /// Delay (in ms) between a `createTab` response and its synthesized
    /// `Target.attachedToTarget` event, simulating the real extension's
    /// async debugger attach.
    pub fn set_attach_delay_ms(&self, ms: u64) {
        self.state.attach_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Simulate a cross-origin navigation: detach the tab's current CDP
    /// session and reattach it under a new one, keeping the same
    /// `targetId`. Returns the new `cdpSessionId`.
    pub async fn simulate_reattach(&self, tab_id: u64) -> String {
        let (old_session, target_id, url, agent_session) = {
            let tabs = self.state.tabs.lock().await;
            let t = tabs.get(&tab_id).expect("unknown tab");
            (t.session_id.clone(), t.target_id.clone(), t.url.clone(), t.agent_session.clone())
        };
        let new_session = format!("cdp-{}-r{}", tab_id, self.state.next_tab_id.fetch_add(1, Ordering::SeqCst));

        send_event(
            &self.write,
            "Target.detachedFromTarget",
            json!({ "targetId": target_id }),
            Some(&old_session),
            None,
        )
        .await;
        send_event(
            &self.write,
            "Target.attachedToTarget",
            json!({ "targetInfo": { "targetId": target_id, "url": url, "title": "", "type": "page" } }),
            Some(&new_session),
            Some(&agent_session),
        )
        .await;

        self.state.tabs.lock().await.get_mut(&tab_id).unwrap().session_id = new_session.clone();
        new_session
    }
}

async fn send_event(
    write: &Arc<Mutex<futures_util::stream::SplitSink<WsStream, WsMessage>>>,
    method: &str,
    params: Value,
    session_id: Option<&str>,
    agent_session: Option<&str>,
) {
    let payload = json!({
        "method": "forwardCDPEvent",
        "params": { "method": method, "params": params, "sessionId": session_id },
        "_agentSession": agent_session,
    });
    let mut w = write.lock().await;
    let _ = w.send(WsMessage::Text(payload.to_string().into())).await;
}

async fn handle_command(
    text: &str,
    write: &Arc<Mutex<futures_util::stream::SplitSink<WsStream, WsMessage>>>,
    state: &Arc<FakeState>,
) {
    let Ok(raw) = serde_json::from_str::<Value>(text) else { return };
    let Some(id) = raw.get("id").and_then(Value::as_u64) else { return };
    let method = raw.get("method").and_then(Value::as_str).unwrap_or_default();
    let params = raw.get("params").cloned().unwrap_or(Value::Null);

    let result = match method {
        "createTab" => create_tab(params, state, write).await,
        "forwardCDPCommand" => forward_cdp_command(&params, state).await,
        "getAvailableTargets" => get_available_targets(state).await,
        "attachToTab" => attach_to_tab(&params, state).await,
        "closeSession" => json!({}),
        _ => json!({}),
    };

    let reply = json!({ "id": id, "result": result });
    let mut w = write.lock().await;
    let _ = w.send(WsMessage::Text(reply.to_string().into())).await;
}

async fn create_tab(
    params: Value,
    state: &Arc<FakeState>,
    write: &Arc<Mutex<futures_util::stream::SplitSink<WsStream, WsMessage>>>,
) -> Value {
    let tab_id = state.next_tab_id.fetch_add(1, Ordering::SeqCst);
    let target_id = format!("target-{tab_id}");
    let session_id = format!("cdp-{tab_id}");
    let url = params.get("url").and_then(Value::as_str).unwrap_or("about:blank").to_string();
    let agent_session = params.get("sessionId").and_then(Value::as_str).unwrap_or_default().to_string();

    state.tabs.lock().await.insert(
        tab_id,
        TabRecord { target_id: target_id.clone(), session_id: session_id.clone(), url: url.clone(), agent_session: agent_session.clone() },
    );

    let delay = state.attach_delay_ms.load(Ordering::SeqCst);
    let write = write.clone();
    let target_id_for_event = target_id.clone();
    let url_for_event = url.clone();
    tokio::spawn(async move {
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        send_event(
            &write,
            "Target.attachedToTarget",
            json!({ "targetInfo": { "targetId": target_id_for_event, "url": url_for_event, "title": "", "type": "page" } }),
            Some(&session_id),
            Some(&agent_session),
        )
        .await;
    });

    json!({ "tabId": tab_id, "targetId": target_id, "url": url })
}

async fn forward_cdp_command(params: &Value, state: &Arc<FakeState>) -> Value {
    let method = params.get("method").and_then(Value::as_str).unwrap_or_default();
    let session_id = params.get("sessionId").and_then(Value::as_str);
    if method == "Target.closeTarget" {
        if let Some(sid) = session_id {
            let mut tabs = state.tabs.lock().await;
            let closed = tabs.iter().find(|(_, t)| t.session_id == sid).map(|(id, _)| *id);
            if let Some(id) = closed {
                tabs.remove(&id);
            }
        }
    }
    json!({})
}

async fn get_available_targets(state: &Arc<FakeState>) -> Value {
    let tabs = state.tabs.lock().await;
    let targets: Vec<Value> = tabs
        .iter()
        .map(|(id, t)| json!({ "tabId": id, "targetId": t.target_id, "url": t.url }))
        .collect();
    json!({ "targets": targets })
}

async fn attach_to_tab(params: &Value, state: &Arc<FakeState>) -> Value {
    let Some(tab_id) = params.get("tabId").and_then(Value::as_u64) else {
        return json!({ "error": "missing tabId" });
    };
    let mut tabs = state.tabs.lock().await;
    let Some(record) = tabs.get_mut(&tab_id) else {
        return json!({ "error": "no such tab" });
    };
    record.session_id = format!("cdp-{tab_id}-recovered");
    json!({ "sessionId": record.session_id, "targetId": record.target_id, "url": record.url })
}

//! The bridge host: a native process standing in for the browser extension.
//! It drives a [`chrome_api::DebuggeeBackend`], keeps the session and tab
//! bookkeeping current, and maintains a single outbound connection to the
//! relay over which it receives commands and forwards CDP events.

mod cdp_router;
mod chrome_api;
mod connection_manager;
mod error;
mod session_registry;
mod tab_manager;

pub use cdp_router::{CdpRouter, OutgoingEvent};
pub use chrome_api::{DebuggeeBackend, DebuggerEvent, FakeBackend, GroupId, TabId, TabSnapshot, TargetInfo};
pub use connection_manager::{ConnectionManager, ConnectionState};
pub use error::BridgeError;
pub use session_registry::{SessionGroup, SessionRegistry};
pub use tab_manager::{TabBinding, TabManager};

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

/// Owns every bridge-host component and the background tasks that keep them
/// running: the relay connection, the command dispatcher, and the pump that
/// turns backend-originated debugger events into `forwardCDPEvent` frames.
pub struct BridgeHost {
    pub backend: Arc<dyn DebuggeeBackend>,
    pub sessions: Arc<SessionRegistry>,
    pub tabs: Arc<TabManager>,
    pub router: Arc<CdpRouter>,
    pub connection: Arc<ConnectionManager>,
}

impl BridgeHost {
    #[must_use]
    pub fn new(
        backend: Arc<dyn DebuggeeBackend>,
        registry_store_path: Option<PathBuf>,
        relay_host: impl Into<String>,
        relay_http_port: u16,
        relay_ws_url: impl Into<String>,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new(backend.clone(), registry_store_path));
        let tabs = Arc::new(TabManager::new(backend.clone()));
        let router = Arc::new(CdpRouter::new(backend.clone(), sessions.clone(), tabs.clone()));
        let connection = Arc::new(ConnectionManager::new(relay_host, relay_http_port, relay_ws_url));
        Self {
            backend,
            sessions,
            tabs,
            router,
            connection,
        }
    }

    /// Load persisted session-to-group mappings and start the connection
    /// and event-pump background tasks. Idempotent to call again after a
    /// deliberate disconnect (the connection manager resets its replaced
    /// flag on each call).
    pub async fn start(self: &Arc<Self>) {
        self.sessions.initialize().await;
        self.connection.start_maintaining(self.router.clone());
        self.spawn_event_pump();
        self.spawn_reannounce_on_connect();
    }

    /// Re-announce every attached target each time the relay connection
    /// comes up, so a newly (re)connected relay rediscovers tabs this
    /// bridge host never lost track of (§4.C `reannounceTargets`, fired
    /// from the connection manager's `onConnect`).
    fn spawn_reannounce_on_connect(self: &Arc<Self>) {
        let mut connected = self.connection.subscribe_connected();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match connected.recv().await {
                    Ok(()) => this.reannounce().await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_event_pump(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut events = this.backend.subscribe();
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(outgoing) = this.router.handle_backend_event(event).await {
                            this.emit(outgoing).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event pump lagged behind backend; some events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn emit(&self, event: OutgoingEvent) {
        let payload = json!({
            "method": "forwardCDPEvent",
            "params": {
                "method": event.cdp_method,
                "params": event.cdp_params,
                "sessionId": event.cdp_session_id,
            },
            "_agentSession": event.agent_session,
        });
        if let Err(e) = self.connection.send(payload).await {
            tracing::debug!(error = %e, "dropped outgoing event, relay not connected");
        }
    }

    /// Re-announce every currently-attached tab as `Target.attachedToTarget`
    /// so a newly (re)connected relay rediscovers live targets without the
    /// bridge host having to re-attach anything.
    pub async fn reannounce(&self) {
        for binding in self.tabs.reannounce_targets().await {
            let agent_session = self.sessions.session_for_tab(binding.tab_id).await;
            self.emit(OutgoingEvent {
                cdp_method: "Target.attachedToTarget".to_string(),
                cdp_params: json!({
                    "sessionId": binding.cdp_session_id,
                    "targetInfo": {
                        "targetId": binding.target_info.target_id,
                        "url": binding.target_info.url,
                        "title": binding.target_info.title,
                        "type": binding.target_info.target_type,
                    },
                }),
                cdp_session_id: Some(binding.cdp_session_id),
                agent_session,
            })
            .await;
        }
    }
}

//! Dispatches commands arriving from the relay to the session registry, tab
//! manager, and debuggee backend, and turns backend-originated debugger
//! events into `forwardCDPEvent` payloads addressed to the owning agent
//! session.

use std::sync::Arc;

use serde_json::{json, Value};

use super::chrome_api::{DebuggeeBackend, DebuggerEvent, TabId};
use super::error::BridgeError;
use super::session_registry::SessionRegistry;
use super::tab_manager::TabManager;

/// An event ready to be forwarded to the relay on the bridge-host<->relay
/// socket, shaped like the `forwardCDPEvent` wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEvent {
    pub cdp_method: String,
    pub cdp_params: Value,
    pub cdp_session_id: Option<String>,
    pub agent_session: Option<String>,
}

pub struct CdpRouter {
    backend: Arc<dyn DebuggeeBackend>,
    sessions: Arc<SessionRegistry>,
    tabs: Arc<TabManager>,
}

impl CdpRouter {
    #[must_use]
    pub fn new(backend: Arc<dyn DebuggeeBackend>, sessions: Arc<SessionRegistry>, tabs: Arc<TabManager>) -> Self {
        Self { backend, sessions, tabs }
    }

    /// Dispatch one command from the relay and produce its JSON result.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::UnknownMethod` for anything not in the table
    /// below, and whatever error the underlying operation produced otherwise.
    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        match method {
            "getOrCreateSession" => self.get_or_create_session(params).await,
            "closeSession" => self.close_session(params).await,
            "getSessionTabs" => self.get_session_tabs(params).await,
            "createTab" => self.create_tab(params).await,
            "forwardCDPCommand" => self.forward_cdp_command(params).await,
            "getAvailableTargets" => self.get_available_targets().await,
            "attachToTab" => self.attach_to_tab(params).await,
            "closeTab" => self.close_tab(params).await,
            other => Err(BridgeError::UnknownMethod(other.to_string())),
        }
    }

    async fn get_or_create_session(&self, params: Value) -> Result<Value, BridgeError> {
        let session_id = require_str(&params, "sessionId")?;
        let group = self.sessions.get_or_create_group(session_id).await?;
        Ok(json!({ "groupId": group.group_id, "groupName": group.group_name }))
    }

    async fn close_session(&self, params: Value) -> Result<Value, BridgeError> {
        let session_id = require_str(&params, "sessionId")?;
        let tab_ids = self.sessions.close_session(session_id).await?;
        for tab_id in &tab_ids {
            self.tabs.detach(*tab_id, false).await;
        }
        Ok(json!({ "tabIds": tab_ids }))
    }

    async fn get_session_tabs(&self, params: Value) -> Result<Value, BridgeError> {
        let session_id = require_str(&params, "sessionId")?;
        let group = self
            .sessions
            .existing_group(session_id)
            .await
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
        let tab_ids = self.backend.group_tabs(group.group_id).await?;
        Ok(json!({ "tabIds": tab_ids }))
    }

    async fn create_tab(&self, params: Value) -> Result<Value, BridgeError> {
        let session_id = require_str(&params, "sessionId")?;
        let url = params.get("url").and_then(Value::as_str);

        let tab = self.backend.create_tab(url).await?;
        self.sessions.add_tab_to_session(tab.tab_id, session_id).await?;
        let binding = self.tabs.attach(tab.tab_id).await?;

        Ok(json!({
            "tabId": tab.tab_id,
            "targetId": binding.target_info.target_id,
            "sessionId": binding.cdp_session_id,
            "url": binding.target_info.url,
        }))
    }

    async fn get_available_targets(&self) -> Result<Value, BridgeError> {
        let bindings = self.tabs.reannounce_targets().await;
        let targets: Vec<Value> = bindings
            .into_iter()
            .map(|b| {
                json!({
                    "targetId": b.target_info.target_id,
                    "tabId": b.tab_id,
                    "url": b.target_info.url,
                    "title": b.target_info.title,
                    "type": b.target_info.target_type,
                    "sessionId": b.cdp_session_id,
                })
            })
            .collect();
        Ok(json!({ "targets": targets }))
    }

    async fn attach_to_tab(&self, params: Value) -> Result<Value, BridgeError> {
        let tab_id = require_tab_id(&params)?;
        let binding = self.tabs.attach(tab_id).await?;
        Ok(json!({
            "targetId": binding.target_info.target_id,
            "sessionId": binding.cdp_session_id,
            "url": binding.target_info.url,
        }))
    }

    async fn close_tab(&self, params: Value) -> Result<Value, BridgeError> {
        let tab_id = require_tab_id(&params)?;
        self.tabs.detach(tab_id, true).await;
        self.backend.close_tab(tab_id).await?;
        Ok(json!({ "closed": true }))
    }

    /// Resolve the target tab for a forwarded CDP command in order:
    /// 1. by CDP `sessionId` naming a primary (attached) tab
    /// 2. by CDP `sessionId` naming a tracked child session's parent tab
    /// 3. by `params.targetId`
    ///
    /// `Runtime.enable`, `Target.closeTarget`, and `Target.activateTarget`
    /// are intercepted; everything else is forwarded to the backend as-is.
    async fn forward_cdp_command(&self, params: Value) -> Result<Value, BridgeError> {
        let inner_method = require_str(&params, "method")?.to_string();
        let cdp_session_id = params.get("sessionId").and_then(Value::as_str);
        let target_id = params.get("targetId").and_then(Value::as_str);
        let inner_params = params.get("params").cloned();

        let (tab_id, child_session_id) = self.resolve_tab(cdp_session_id, target_id).await?;

        match inner_method.as_str() {
            "Runtime.enable" => {
                let _ = self
                    .backend
                    .send_debugger_command(tab_id, child_session_id.as_deref(), "Runtime.disable", None)
                    .await;
                self.backend
                    .send_debugger_command(tab_id, child_session_id.as_deref(), "Runtime.enable", inner_params)
                    .await
            }
            "Target.closeTarget" => {
                self.tabs.detach(tab_id, true).await;
                self.backend.close_tab(tab_id).await?;
                Ok(json!({ "success": true }))
            }
            "Target.activateTarget" => {
                self.backend.activate_tab(tab_id).await?;
                Ok(json!({}))
            }
            _ => {
                self.backend
                    .send_debugger_command(tab_id, child_session_id.as_deref(), &inner_method, inner_params)
                    .await
            }
        }
    }

    /// Resolve the target tab and, when the command's `sessionId` names a
    /// child (non-primary) CDP session, the child session id to forward
    /// alongside it — `None` whenever the resolved session is the tab's
    /// primary one, per the "included only when it differs" rule.
    async fn resolve_tab(
        &self,
        cdp_session_id: Option<&str>,
        target_id: Option<&str>,
    ) -> Result<(TabId, Option<String>), BridgeError> {
        if let Some(sid) = cdp_session_id {
            if let Some(binding) = self.tabs.by_session_id(sid).await {
                return Ok((binding.tab_id, None));
            }
            if let Some(tab_id) = self.tabs.parent_of_child_session(sid).await {
                return Ok((tab_id, Some(sid.to_string())));
            }
        }
        if let Some(tid) = target_id {
            if let Some(binding) = self.tabs.by_target_id(tid).await {
                return Ok((binding.tab_id, None));
            }
        }
        Err(BridgeError::TabNotFound(
            cdp_session_id.or(target_id).unwrap_or("<none>").to_string(),
        ))
    }

    /// Turn a backend-originated debugger event into the outbound shape,
    /// updating the child-session index along the way. Returns `None` only
    /// when the event carries no meaningful payload to forward (never
    /// currently, kept for future filtering).
    pub async fn handle_backend_event(&self, event: DebuggerEvent) -> Option<OutgoingEvent> {
        match event {
            DebuggerEvent::AttachedToTarget {
                tab_id,
                cdp_session_id,
                target_info,
            } => {
                let is_primary = self
                    .tabs
                    .get(tab_id)
                    .await
                    .is_some_and(|b| b.cdp_session_id == cdp_session_id);
                if !is_primary {
                    self.tabs.track_child_session(&cdp_session_id, tab_id).await;
                }
                let agent_session = self.sessions.session_for_tab(tab_id).await;
                Some(OutgoingEvent {
                    cdp_method: "Target.attachedToTarget".to_string(),
                    cdp_params: json!({
                        "sessionId": cdp_session_id,
                        "targetInfo": target_info_json(&target_info),
                    }),
                    cdp_session_id: Some(cdp_session_id),
                    agent_session,
                })
            }
            DebuggerEvent::DetachedFromTarget { tab_id, cdp_session_id } => {
                self.tabs.untrack_child_session(&cdp_session_id).await;
                let agent_session = self.sessions.session_for_tab(tab_id).await;
                Some(OutgoingEvent {
                    cdp_method: "Target.detachedFromTarget".to_string(),
                    cdp_params: json!({ "sessionId": cdp_session_id }),
                    cdp_session_id: Some(cdp_session_id),
                    agent_session,
                })
            }
            DebuggerEvent::TargetInfoChanged { tab_id, target_info } => {
                let cdp_session_id = self.tabs.get(tab_id).await.map(|b| b.cdp_session_id);
                let agent_session = self.sessions.session_for_tab(tab_id).await;
                Some(OutgoingEvent {
                    cdp_method: "Target.targetInfoChanged".to_string(),
                    cdp_params: json!({ "targetInfo": target_info_json(&target_info) }),
                    cdp_session_id,
                    agent_session,
                })
            }
            DebuggerEvent::Custom {
                tab_id,
                cdp_session_id,
                method,
                params,
            } => {
                let agent_session = self.sessions.session_for_tab(tab_id).await;
                Some(OutgoingEvent {
                    cdp_method: method,
                    cdp_params: params,
                    cdp_session_id: Some(cdp_session_id),
                    agent_session,
                })
            }
        }
    }
}

fn target_info_json(info: &super::chrome_api::TargetInfo) -> Value {
    json!({
        "targetId": info.target_id,
        "url": info.url,
        "title": info.title,
        "type": info.target_type,
    })
}

fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, BridgeError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::Protocol(format!("missing or non-string `{key}`")))
}

fn require_tab_id(params: &Value) -> Result<TabId, BridgeError> {
    params
        .get("tabId")
        .and_then(Value::as_u64)
        .ok_or_else(|| BridgeError::Protocol("missing or non-numeric `tabId`".to_string()))
}

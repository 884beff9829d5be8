//! Attaches/detaches the debugger to tabs and indexes the resulting
//! bindings by cdpSessionId, targetId, and tabId. Child (iframe/worker)
//! sessions are tracked separately and routed to their parent tab.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::chrome_api::{DebuggeeBackend, TabId, TargetInfo};
use super::error::BridgeError;

/// Exponential backoff schedule for debugger-attach retries (ms). The
/// backend is not always ready to accept a debugger immediately after a
/// tab is created.
const ATTACH_RETRY_DELAYS_MS: [u64; 4] = [50, 100, 200, 400];

#[derive(Debug, Clone)]
pub struct TabBinding {
    pub tab_id: TabId,
    pub cdp_session_id: String,
    pub target_info: TargetInfo,
}

pub struct TabManager {
    backend: Arc<dyn DebuggeeBackend>,
    bindings: Mutex<HashMap<TabId, TabBinding>>,
    by_session: Mutex<HashMap<String, TabId>>,
    by_target: Mutex<HashMap<String, TabId>>,
    child_sessions: Mutex<HashMap<String, TabId>>,
}

impl TabManager {
    #[must_use]
    pub fn new(backend: Arc<dyn DebuggeeBackend>) -> Self {
        Self {
            backend,
            bindings: Mutex::new(HashMap::new()),
            by_session: Mutex::new(HashMap::new()),
            by_target: Mutex::new(HashMap::new()),
            child_sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the debugger to `tab_id`, retrying up to 5 times with
    /// exponential backoff if the backend is not yet ready.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::AttachFailed` after the retry budget is exhausted.
    pub async fn attach(&self, tab_id: TabId) -> Result<TabBinding, BridgeError> {
        let mut last_err = None;
        for (attempt, delay_ms) in std::iter::once(0)
            .chain(ATTACH_RETRY_DELAYS_MS.iter().copied())
            .enumerate()
        {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            match self.backend.attach_debugger(tab_id).await {
                Ok(cdp_session_id) => {
                    let target_info = self.backend.get_target_info(tab_id).await?;
                    let binding = TabBinding {
                        tab_id,
                        cdp_session_id: cdp_session_id.clone(),
                        target_info: target_info.clone(),
                    };
                    self.bindings.lock().await.insert(tab_id, binding.clone());
                    self.by_session
                        .lock()
                        .await
                        .insert(cdp_session_id, tab_id);
                    self.by_target
                        .lock()
                        .await
                        .insert(target_info.target_id, tab_id);
                    return Ok(binding);
                }
                Err(e) => {
                    tracing::debug!(tab_id, attempt, error = %e, "attach attempt failed");
                    last_err = Some(e);
                }
            }
        }
        let _ = last_err;
        Err(BridgeError::AttachFailed {
            tab_id,
            attempts: (ATTACH_RETRY_DELAYS_MS.len() + 1) as u32,
        })
    }

    /// Detach the debugger from `tab_id` and forget its bindings.
    /// `user_initiated` only affects logging; the binding is removed either way.
    pub async fn detach(&self, tab_id: TabId, user_initiated: bool) {
        let binding = self.bindings.lock().await.remove(&tab_id);
        if let Some(binding) = &binding {
            self.by_session.lock().await.remove(&binding.cdp_session_id);
            self.by_target.lock().await.remove(&binding.target_info.target_id);
        }
        self.child_sessions.lock().await.retain(|_, t| *t != tab_id);
        if let Err(e) = self.backend.detach_debugger(tab_id).await {
            tracing::debug!(tab_id, user_initiated, error = %e, "detach_debugger failed (tab likely already gone)");
        }
    }

    /// Update bookkeeping for a debugger detach the backend initiated on
    /// its own (crash, tab navigated away from an attachable state). No
    /// auto-reattach is performed; a later client re-adopts the tab.
    pub async fn handle_debugger_detach(&self, tab_id: TabId) {
        let binding = self.bindings.lock().await.remove(&tab_id);
        if let Some(binding) = binding {
            self.by_session.lock().await.remove(&binding.cdp_session_id);
            self.by_target.lock().await.remove(&binding.target_info.target_id);
        }
        self.child_sessions.lock().await.retain(|_, t| *t != tab_id);
    }

    pub async fn by_session_id(&self, session_id: &str) -> Option<TabBinding> {
        let tab_id = *self.by_session.lock().await.get(session_id)?;
        self.bindings.lock().await.get(&tab_id).cloned()
    }

    pub async fn by_target_id(&self, target_id: &str) -> Option<TabBinding> {
        let tab_id = *self.by_target.lock().await.get(target_id)?;
        self.bindings.lock().await.get(&tab_id).cloned()
    }

    pub async fn get(&self, tab_id: TabId) -> Option<TabBinding> {
        self.bindings.lock().await.get(&tab_id).cloned()
    }

    /// Record that `child_session_id` belongs to an attached child (iframe,
    /// worker) whose commands should be routed to `parent_tab_id`.
    pub async fn track_child_session(&self, child_session_id: &str, parent_tab_id: TabId) {
        self.child_sessions
            .lock()
            .await
            .insert(child_session_id.to_string(), parent_tab_id);
    }

    pub async fn untrack_child_session(&self, child_session_id: &str) {
        self.child_sessions.lock().await.remove(child_session_id);
    }

    /// Resolve a child session id to its parent tab, if tracked.
    pub async fn parent_of_child_session(&self, child_session_id: &str) -> Option<TabId> {
        self.child_sessions.lock().await.get(child_session_id).copied()
    }

    /// Snapshot of every currently-attached tab's binding, used by the
    /// router to emit a fresh `attachedToTarget` for each one when the
    /// relay (re)connects.
    pub async fn reannounce_targets(&self) -> Vec<TabBinding> {
        self.bindings.lock().await.values().cloned().collect()
    }
}

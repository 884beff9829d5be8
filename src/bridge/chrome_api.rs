//! The seam the bridge host drives instead of calling `chrome.debugger` /
//! `chrome.tabs` / `chrome.tabGroups` directly. A real implementation would
//! sit behind a native-messaging shim; [`FakeBackend`] models tabs, groups,
//! and debugger attachment in memory, faithfully enough to exercise every
//! router and recovery invariant without a real browser.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::error::BridgeError;

pub type TabId = u64;
pub type GroupId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabSnapshot {
    pub tab_id: TabId,
    pub url: String,
    pub title: String,
    pub group_id: Option<GroupId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub target_id: String,
    pub tab_id: TabId,
    pub url: String,
    pub title: String,
    pub target_type: String,
}

/// Debugger-originated events a real extension would receive via
/// `chrome.debugger.onEvent`; the fake backend synthesizes the same shape.
#[derive(Debug, Clone)]
pub enum DebuggerEvent {
    AttachedToTarget {
        tab_id: TabId,
        cdp_session_id: String,
        target_info: TargetInfo,
    },
    DetachedFromTarget {
        tab_id: TabId,
        cdp_session_id: String,
    },
    TargetInfoChanged {
        tab_id: TabId,
        target_info: TargetInfo,
    },
    Custom {
        tab_id: TabId,
        cdp_session_id: String,
        method: String,
        params: Value,
    },
}

/// Abstraction over `chrome.debugger`/`chrome.tabs`/`chrome.tabGroups`, async
/// so a real native-messaging-backed implementation can be substituted
/// without touching the router, registry, or tab manager.
#[async_trait]
pub trait DebuggeeBackend: Send + Sync {
    async fn create_tab(&self, url: Option<&str>) -> Result<TabSnapshot, BridgeError>;
    async fn close_tab(&self, tab_id: TabId) -> Result<(), BridgeError>;
    async fn activate_tab(&self, tab_id: TabId) -> Result<(), BridgeError>;
    async fn query_tabs(&self) -> Result<Vec<TabSnapshot>, BridgeError>;
    async fn attach_debugger(&self, tab_id: TabId) -> Result<String, BridgeError>;
    async fn detach_debugger(&self, tab_id: TabId) -> Result<(), BridgeError>;
    async fn get_target_info(&self, tab_id: TabId) -> Result<TargetInfo, BridgeError>;
    /// `child_session_id` is `Some` only when the command targets a
    /// non-primary CDP session (an attached iframe or worker) rather than
    /// the tab's own debugger attachment.
    async fn send_debugger_command(
        &self,
        tab_id: TabId,
        child_session_id: Option<&str>,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, BridgeError>;
    async fn create_group(&self, title: &str) -> Result<GroupId, BridgeError>;
    async fn add_to_group(&self, tab_id: TabId, group_id: GroupId) -> Result<(), BridgeError>;
    async fn group_exists(&self, group_id: GroupId) -> Result<bool, BridgeError>;
    async fn group_title(&self, group_id: GroupId) -> Result<String, BridgeError>;
    async fn close_group(&self, group_id: GroupId) -> Result<(), BridgeError>;
    async fn group_tabs(&self, group_id: GroupId) -> Result<Vec<TabId>, BridgeError>;

    /// Subscribe to debugger-originated events. Each call returns an
    /// independent receiver (broadcast semantics): the router and tests can
    /// both listen.
    fn subscribe(&self) -> broadcast::Receiver<DebuggerEvent>;
}

#[derive(Debug, Clone)]
struct TabRecord {
    url: String,
    title: String,
    group_id: Option<GroupId>,
    target_id: String,
    attached_session: Option<String>,
}

#[derive(Debug, Default)]
struct GroupRecord {
    title: String,
    tab_ids: Vec<TabId>,
}

struct Inner {
    tabs: HashMap<TabId, TabRecord>,
    groups: HashMap<GroupId, GroupRecord>,
}

/// In-memory [`DebuggeeBackend`] used by the bridge-host binary's default
/// configuration and by tests. Each attach call mints a fresh cdpSessionId,
/// mirroring Chrome's ephemeral-session behavior.
pub struct FakeBackend {
    inner: Mutex<Inner>,
    next_tab_id: AtomicU64,
    next_group_id: AtomicU64,
    next_session_seq: AtomicU64,
    events: broadcast::Sender<DebuggerEvent>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner {
                tabs: HashMap::new(),
                groups: HashMap::new(),
            }),
            next_tab_id: AtomicU64::new(1),
            next_group_id: AtomicU64::new(1),
            next_session_seq: AtomicU64::new(1),
            events: tx,
        }
    }

    fn fresh_session_id(&self) -> String {
        let n = self.next_session_seq.fetch_add(1, Ordering::SeqCst);
        format!("fake-session-{n}")
    }

    fn snapshot(tab_id: TabId, rec: &TabRecord) -> TabSnapshot {
        TabSnapshot {
            tab_id,
            url: rec.url.clone(),
            title: rec.title.clone(),
            group_id: rec.group_id,
        }
    }

    fn target_info(tab_id: TabId, rec: &TabRecord) -> TargetInfo {
        TargetInfo {
            target_id: rec.target_id.clone(),
            tab_id,
            url: rec.url.clone(),
            title: rec.title.clone(),
            target_type: "page".to_string(),
        }
    }

    /// Test/demo helper: directly set a tab's URL, as if it navigated, and
    /// emit `Target.targetInfoChanged`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::TabNotFound` if the tab does not exist.
    pub fn simulate_navigation(&self, tab_id: TabId, url: &str) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner
            .tabs
            .get_mut(&tab_id)
            .ok_or_else(|| BridgeError::TabNotFound(tab_id.to_string()))?;
        rec.url = url.to_string();
        let info = Self::target_info(tab_id, rec);
        drop(inner);
        let _ = self.events.send(DebuggerEvent::TargetInfoChanged {
            tab_id,
            target_info: info,
        });
        Ok(())
    }

    /// Test/demo helper: simulate a cross-origin navigation that tears down
    /// and recreates the CDP session while keeping the same `targetId`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::TabNotFound` if the tab does not exist or is not attached.
    pub fn simulate_reattach(&self, tab_id: TabId) -> Result<String, BridgeError> {
        let old_session;
        let new_session = self.fresh_session_id();
        let info;
        {
            let mut inner = self.inner.lock().unwrap();
            let rec = inner
                .tabs
                .get_mut(&tab_id)
                .ok_or_else(|| BridgeError::TabNotFound(tab_id.to_string()))?;
            old_session = rec
                .attached_session
                .clone()
                .ok_or_else(|| BridgeError::TabNotFound(tab_id.to_string()))?;
            rec.attached_session = Some(new_session.clone());
            info = Self::target_info(tab_id, rec);
        }
        let _ = self.events.send(DebuggerEvent::DetachedFromTarget {
            tab_id,
            cdp_session_id: old_session,
        });
        let _ = self.events.send(DebuggerEvent::AttachedToTarget {
            tab_id,
            cdp_session_id: new_session.clone(),
            target_info: info,
        });
        Ok(new_session)
    }
}

#[async_trait]
impl DebuggeeBackend for FakeBackend {
    async fn create_tab(&self, url: Option<&str>) -> Result<TabSnapshot, BridgeError> {
        let mut inner = self.inner.lock().unwrap();
        let tab_id = self.next_tab_id.fetch_add(1, Ordering::SeqCst);
        let target_id = format!("fake-target-{tab_id}");
        let rec = TabRecord {
            url: url.unwrap_or("about:blank").to_string(),
            title: "New Tab".to_string(),
            group_id: None,
            target_id,
            attached_session: None,
        };
        let snapshot = Self::snapshot(tab_id, &rec);
        inner.tabs.insert(tab_id, rec);
        Ok(snapshot)
    }

    async fn close_tab(&self, tab_id: TabId) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner
            .tabs
            .remove(&tab_id)
            .ok_or_else(|| BridgeError::TabNotFound(tab_id.to_string()))?;
        if let Some(gid) = rec.group_id {
            if let Some(group) = inner.groups.get_mut(&gid) {
                group.tab_ids.retain(|t| *t != tab_id);
            }
        }
        Ok(())
    }

    async fn activate_tab(&self, tab_id: TabId) -> Result<(), BridgeError> {
        let inner = self.inner.lock().unwrap();
        if inner.tabs.contains_key(&tab_id) {
            Ok(())
        } else {
            Err(BridgeError::TabNotFound(tab_id.to_string()))
        }
    }

    async fn query_tabs(&self) -> Result<Vec<TabSnapshot>, BridgeError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tabs
            .iter()
            .map(|(id, rec)| Self::snapshot(*id, rec))
            .collect())
    }

    async fn attach_debugger(&self, tab_id: TabId) -> Result<String, BridgeError> {
        let session_id = self.fresh_session_id();
        let info;
        {
            let mut inner = self.inner.lock().unwrap();
            let rec = inner
                .tabs
                .get_mut(&tab_id)
                .ok_or_else(|| BridgeError::TabNotFound(tab_id.to_string()))?;
            rec.attached_session = Some(session_id.clone());
            info = Self::target_info(tab_id, rec);
        }
        let _ = self.events.send(DebuggerEvent::AttachedToTarget {
            tab_id,
            cdp_session_id: session_id.clone(),
            target_info: info,
        });
        Ok(session_id)
    }

    async fn detach_debugger(&self, tab_id: TabId) -> Result<(), BridgeError> {
        let session_id;
        {
            let mut inner = self.inner.lock().unwrap();
            let rec = inner
                .tabs
                .get_mut(&tab_id)
                .ok_or_else(|| BridgeError::TabNotFound(tab_id.to_string()))?;
            session_id = rec.attached_session.take();
        }
        if let Some(sid) = session_id {
            let _ = self.events.send(DebuggerEvent::DetachedFromTarget {
                tab_id,
                cdp_session_id: sid,
            });
        }
        Ok(())
    }

    async fn get_target_info(&self, tab_id: TabId) -> Result<TargetInfo, BridgeError> {
        let inner = self.inner.lock().unwrap();
        let rec = inner
            .tabs
            .get(&tab_id)
            .ok_or_else(|| BridgeError::TabNotFound(tab_id.to_string()))?;
        Ok(Self::target_info(tab_id, rec))
    }

    async fn send_debugger_command(
        &self,
        tab_id: TabId,
        child_session_id: Option<&str>,
        method: &str,
        _params: Option<Value>,
    ) -> Result<Value, BridgeError> {
        let inner = self.inner.lock().unwrap();
        if !inner.tabs.contains_key(&tab_id) {
            return Err(BridgeError::TabNotFound(tab_id.to_string()));
        }
        Ok(serde_json::json!({ "echoed": method, "childSessionId": child_session_id }))
    }

    async fn create_group(&self, title: &str) -> Result<GroupId, BridgeError> {
        let mut inner = self.inner.lock().unwrap();
        let group_id = self.next_group_id.fetch_add(1, Ordering::SeqCst);
        inner.groups.insert(
            group_id,
            GroupRecord {
                title: title.to_string(),
                tab_ids: Vec::new(),
            },
        );
        Ok(group_id)
    }

    async fn add_to_group(&self, tab_id: TabId, group_id: GroupId) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.groups.contains_key(&group_id) {
            return Err(BridgeError::Backend(format!("no such group {group_id}")));
        }
        let rec = inner
            .tabs
            .get_mut(&tab_id)
            .ok_or_else(|| BridgeError::TabNotFound(tab_id.to_string()))?;
        rec.group_id = Some(group_id);
        let group = inner.groups.get_mut(&group_id).unwrap();
        if !group.tab_ids.contains(&tab_id) {
            group.tab_ids.push(tab_id);
        }
        Ok(())
    }

    async fn group_exists(&self, group_id: GroupId) -> Result<bool, BridgeError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.groups.contains_key(&group_id))
    }

    async fn group_title(&self, group_id: GroupId) -> Result<String, BridgeError> {
        let inner = self.inner.lock().unwrap();
        inner
            .groups
            .get(&group_id)
            .map(|g| g.title.clone())
            .ok_or_else(|| BridgeError::Backend(format!("no such group {group_id}")))
    }

    async fn close_group(&self, group_id: GroupId) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(group) = inner.groups.remove(&group_id) else {
            return Ok(());
        };
        for tab_id in group.tab_ids {
            inner.tabs.remove(&tab_id);
        }
        Ok(())
    }

    async fn group_tabs(&self, group_id: GroupId) -> Result<Vec<TabId>, BridgeError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .groups
            .get(&group_id)
            .map(|g| g.tab_ids.clone())
            .unwrap_or_default())
    }

    fn subscribe(&self) -> broadcast::Receiver<DebuggerEvent> {
        self.events.subscribe()
    }
}

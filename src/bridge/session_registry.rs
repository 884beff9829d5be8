//! Maps agent sessions to Chrome tab groups. The tab group's membership is
//! the ground truth for tab ownership; this registry's maps are a cache
//! over it, rebuilt from live groups on [`SessionRegistry::initialize`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::chrome_api::{DebuggeeBackend, GroupId, TabId};
use super::error::BridgeError;

const GROUP_TITLE_PREFIX: &str = "Session ";
/// How long the throwaway tab used to seed a new (otherwise-empty) group
/// survives before it is closed.
const THROWAWAY_GRACE_MS: u64 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGroup {
    pub group_id: GroupId,
    pub group_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    session_id: String,
    group_id: GroupId,
    group_name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    sessions: Vec<PersistedEntry>,
}

pub struct SessionRegistry {
    backend: Arc<dyn DebuggeeBackend>,
    sessions: Mutex<HashMap<String, SessionGroup>>,
    next_session_num: AtomicU64,
    store_path: Option<PathBuf>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(backend: Arc<dyn DebuggeeBackend>, store_path: Option<PathBuf>) -> Self {
        Self {
            backend,
            sessions: Mutex::new(HashMap::new()),
            next_session_num: AtomicU64::new(1),
            store_path,
        }
    }

    /// Load the stored `(sessionId -> groupId, groupName)` triples, discard
    /// any whose group no longer exists, and reseed the session-number
    /// counter from the highest observed `Session N` title.
    pub async fn initialize(&self) {
        let Some(path) = &self.store_path else {
            return;
        };
        let entries = load_entries(path);
        let mut live = HashMap::new();
        let mut max_num = 0u64;

        for entry in entries {
            match self.backend.group_exists(entry.group_id).await {
                Ok(true) => {
                    if let Some(n) = parse_session_number(&entry.group_name) {
                        max_num = max_num.max(n);
                    }
                    live.insert(
                        entry.session_id.clone(),
                        SessionGroup {
                            group_id: entry.group_id,
                            group_name: entry.group_name,
                        },
                    );
                }
                _ => {
                    tracing::info!(session = %entry.session_id, group = entry.group_id, "discarding stale session group on initialize");
                }
            }
        }

        self.next_session_num.store(max_num + 1, Ordering::SeqCst);
        *self.sessions.lock().await = live;
        self.persist().await;
    }

    /// Reuse the existing live group for `session_id`, or create a new one.
    ///
    /// Creating a group requires a throwaway tab (Chrome cannot create an
    /// empty tab group); that tab is scheduled for removal shortly after.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Backend` if group/tab creation fails.
    pub async fn get_or_create_group(&self, session_id: &str) -> Result<SessionGroup, BridgeError> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(group) = sessions.get(session_id) {
                if self.backend.group_exists(group.group_id).await.unwrap_or(false) {
                    return Ok(group.clone());
                }
            }
        }

        let throwaway = self.backend.create_tab(None).await?;
        let num = self.next_session_num.fetch_add(1, Ordering::SeqCst);
        let group_name = format!("{GROUP_TITLE_PREFIX}{num}");
        let group_id = self.backend.create_group(&group_name).await?;
        self.backend.add_to_group(throwaway.tab_id, group_id).await?;

        let group = SessionGroup {
            group_id,
            group_name,
        };
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), group.clone());
        self.persist().await;

        let backend = self.backend.clone();
        let tab_id = throwaway.tab_id;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(THROWAWAY_GRACE_MS)).await;
            if let Err(e) = backend.close_tab(tab_id).await {
                tracing::debug!(error = %e, tab_id, "throwaway seed tab already gone");
            }
        });

        Ok(group)
    }

    /// Add a tab to an already-registered session's group.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::SessionNotFound` if `session_id` has no group yet.
    pub async fn add_tab_to_session(&self, tab_id: TabId, session_id: &str) -> Result<(), BridgeError> {
        let group_id = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(session_id)
                .map(|g| g.group_id)
                .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?
        };
        self.backend.add_to_group(tab_id, group_id).await
    }

    /// Look up the group for an already-registered session without creating
    /// one. Returns `None` if the session has no group (or its group no
    /// longer exists).
    pub async fn existing_group(&self, session_id: &str) -> Option<SessionGroup> {
        let sessions = self.sessions.lock().await;
        let group = sessions.get(session_id)?;
        if self.backend.group_exists(group.group_id).await.unwrap_or(false) {
            Some(group.clone())
        } else {
            None
        }
    }

    /// Resolve the owning session for a tab via its live group membership.
    /// Returns `None` if the tab is not in any managed group.
    pub async fn session_for_tab(&self, tab_id: TabId) -> Option<String> {
        let tabs = self.backend.query_tabs().await.ok()?;
        let group_id = tabs.into_iter().find(|t| t.tab_id == tab_id)?.group_id?;
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .find(|(_, g)| g.group_id == group_id)
            .map(|(sid, _)| sid.clone())
    }

    /// Close every tab in the session's group, forget the mapping, and persist.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::SessionNotFound` if `session_id` is unknown.
    pub async fn close_session(&self, session_id: &str) -> Result<Vec<TabId>, BridgeError> {
        let group = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .remove(session_id)
                .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?
        };
        let tabs = self.backend.group_tabs(group.group_id).await.unwrap_or_default();
        self.backend.close_group(group.group_id).await?;
        self.persist().await;
        Ok(tabs)
    }

    async fn persist(&self) {
        let Some(path) = &self.store_path else {
            return;
        };
        let entries: Vec<PersistedEntry> = self
            .sessions
            .lock()
            .await
            .iter()
            .map(|(session_id, g)| PersistedEntry {
                session_id: session_id.clone(),
                group_id: g.group_id,
                group_name: g.group_name.clone(),
            })
            .collect();
        if let Err(e) = save_entries(path, &entries) {
            tracing::warn!(error = %e, "failed to persist session registry");
        }
    }
}

fn parse_session_number(title: &str) -> Option<u64> {
    title.strip_prefix(GROUP_TITLE_PREFIX)?.trim().parse().ok()
}

fn load_entries(path: &Path) -> Vec<PersistedEntry> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<RegistryFile>(&s).ok())
        .map(|f| f.sessions)
        .unwrap_or_default()
}

fn save_entries(path: &Path, entries: &[PersistedEntry]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = RegistryFile {
        sessions: entries.to_vec(),
    };
    let json = serde_json::to_string_pretty(&file)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

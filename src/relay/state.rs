//! The relay's single shared state: target/session/client registries plus
//! the bridge-host link's pending-response table. Lives behind one
//! `Arc<RelayState>`; every mutation is a single lock acquisition with no
//! `.await` in between, so reads are always point-in-time consistent.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use super::error::RelayError;
use crate::persistence::{self, DebouncedWriter, PersistedPage, SharedPageList};

/// A target the relay currently believes is live, keyed by its ephemeral
/// `cdpSessionId`.
#[derive(Debug, Clone)]
pub struct ConnectedTarget {
    pub cdp_session_id: String,
    pub target_id: String,
    pub url: String,
    pub title: String,
    pub target_type: String,
}

pub struct ClientHandle {
    pub sender: tokio::sync::mpsc::UnboundedSender<Message>,
    pub known_targets: HashSet<String>,
    pub session: String,
}

#[derive(Debug, Default, Clone)]
pub struct SessionEntry {
    pub client_ids: HashSet<String>,
    pub page_names: HashSet<String>,
    pub target_sessions: HashSet<String>,
}

/// A named page whose target has detached but may still reattach (same
/// `targetId`, new `cdpSessionId`) within the grace period. While pending,
/// the name stays in `named_pages`/`page_names` so `GET /pages` does not
/// lose it; a background task finalizes the removal if grace expires.
#[derive(Debug, Clone)]
pub struct PendingDetach {
    pub key: String,
    pub name: String,
    pub agent_session: Option<String>,
}

/// Build the internal `named_pages` key from an agent session and page name.
#[must_use]
pub fn page_key(session: &str, name: &str) -> String {
    format!("{session}:{name}")
}

pub struct RelayState {
    pub connected_targets: Mutex<HashMap<String, ConnectedTarget>>,
    pub named_pages: Mutex<HashMap<String, String>>,
    pub clients: Mutex<HashMap<String, ClientHandle>>,
    pub sessions: Mutex<HashMap<String, SessionEntry>>,
    pub target_to_agent_session: Mutex<HashMap<String, String>>,

    persisted_pages: SharedPageList,
    persistence_path: Option<PathBuf>,
    debounced_writer: Mutex<Option<DebouncedWriter>>,
    max_age_days: u64,

    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>,
    next_msg_id: AtomicU64,
    bridge_out: Mutex<Option<tokio::sync::mpsc::UnboundedSender<Message>>>,
    pending_attach: Mutex<HashMap<String, oneshot::Sender<ConnectedTarget>>>,

    pub tab_limit: usize,
    pub warn_threshold: usize,
    pub command_timeout: Duration,
    pub grace_period: Duration,
    pub target_wait_timeout: Duration,

    /// Targets that detached and may still reattach under a new
    /// `cdpSessionId` within `grace_period`, keyed by the stable `targetId`.
    pending_detach: Mutex<HashMap<String, PendingDetach>>,
}

impl RelayState {
    #[must_use]
    pub fn new(
        persistence_path: Option<PathBuf>,
        max_age_days: u64,
        debounce: Duration,
        tab_limit: usize,
        warn_threshold: usize,
        command_timeout: Duration,
        grace_period: Duration,
        target_wait_timeout: Duration,
    ) -> Arc<Self> {
        let pages = persistence_path
            .as_deref()
            .map(|p| persistence::load(p, max_age_days))
            .unwrap_or_default();
        let persisted_pages: SharedPageList = Arc::new(std::sync::Mutex::new(pages));

        let debounced_writer = persistence_path.clone().map(|path| {
            let pages = persisted_pages.clone();
            DebouncedWriter::spawn(path, debounce, move || {
                pages.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
            })
        });

        Arc::new(Self {
            connected_targets: Mutex::new(HashMap::new()),
            named_pages: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            target_to_agent_session: Mutex::new(HashMap::new()),
            persisted_pages,
            persistence_path,
            debounced_writer: Mutex::new(debounced_writer),
            max_age_days,
            pending: Mutex::new(HashMap::new()),
            next_msg_id: AtomicU64::new(1),
            bridge_out: Mutex::new(None),
            pending_attach: Mutex::new(HashMap::new()),
            tab_limit,
            warn_threshold,
            command_timeout,
            grace_period,
            target_wait_timeout,
            pending_detach: Mutex::new(HashMap::new()),
        })
    }

    pub async fn is_bridge_connected(&self) -> bool {
        self.bridge_out.lock().await.is_some()
    }

    /// Clone of the current outbound bridge sender, if a bridge host is
    /// connected. Used to push a one-off frame (e.g. a parse-error reply)
    /// without going through [`Self::send_bridge_command`]'s request/reply
    /// bookkeeping.
    pub async fn bridge_sender(&self) -> Option<tokio::sync::mpsc::UnboundedSender<Message>> {
        self.bridge_out.lock().await.clone()
    }

    /// Install a new outbound sender for the bridge-host socket, returning
    /// whatever sender was previously installed (the caller uses this to
    /// close code-4001 the superseded connection).
    pub async fn set_bridge_out(
        &self,
        sender: Option<tokio::sync::mpsc::UnboundedSender<Message>>,
    ) -> Option<tokio::sync::mpsc::UnboundedSender<Message>> {
        let disconnected = sender.is_none();
        let previous = std::mem::replace(&mut *self.bridge_out.lock().await, sender);
        if disconnected {
            self.cancel_all_pending(RelayError::ExtensionNotConnected).await;
        }
        previous
    }

    async fn cancel_all_pending(&self, err: RelayError) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(err.to_string()));
        }
    }

    /// Send a command to the bridge host and wait for its response, bounded
    /// by `command_timeout`.
    ///
    /// # Errors
    ///
    /// `RelayError::ExtensionNotConnected` if there is no bridge link;
    /// `RelayError::Timeout` on expiry; `RelayError::Bridge` for an error
    /// response.
    pub async fn send_bridge_command(&self, method: &str, params: Option<Value>) -> Result<Value, RelayError> {
        let id = self.next_msg_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let payload = serde_json::json!({ "id": id, "method": method, "params": params });
        {
            let out = self.bridge_out.lock().await;
            let Some(sender) = out.as_ref() else {
                self.pending.lock().await.remove(&id);
                return Err(RelayError::ExtensionNotConnected);
            };
            if sender.send(Message::Text(payload.to_string().into())).is_err() {
                self.pending.lock().await.remove(&id);
                return Err(RelayError::ExtensionNotConnected);
            }
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(RelayError::Bridge(message)),
            Ok(Err(_)) => Err(RelayError::Internal("pending response channel dropped".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RelayError::Timeout)
            }
        }
    }

    /// Resolve a previously-registered pending command by its id.
    pub async fn resolve_pending(&self, id: u64, result: Result<Value, String>) {
        if let Some(tx) = self.pending.lock().await.remove(&id) {
            let _ = tx.send(result);
        }
    }

    // --- persisted page bookkeeping -----------------------------------

    pub fn snapshot_persisted(&self) -> Vec<PersistedPage> {
        self.persisted_pages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub async fn upsert_persisted(&self, page: PersistedPage) {
        {
            let mut pages = self.persisted_pages.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            pages.retain(|p| p.key != page.key);
            pages.push(page);
        }
        self.request_persist().await;
    }

    pub async fn remove_persisted(&self, key: &str) {
        {
            let mut pages = self.persisted_pages.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            pages.retain(|p| p.key != key);
        }
        self.request_persist().await;
    }

    async fn request_persist(&self) {
        if let Some(writer) = self.debounced_writer.lock().await.as_ref() {
            writer.request_save();
        }
    }

    #[must_use]
    pub fn max_age_days(&self) -> u64 {
        self.max_age_days
    }

    #[must_use]
    pub fn persistence_path(&self) -> Option<&PathBuf> {
        self.persistence_path.as_ref()
    }

    /// Wait (up to `timeout`) for `target_id` to show up in
    /// `connected_targets`, driven by the `Target.attachedToTarget` event
    /// handler rather than a fixed sleep. Returns immediately if the target
    /// is already known.
    pub async fn wait_for_target(&self, target_id: &str, timeout: Duration) -> Option<ConnectedTarget> {
        {
            let targets = self.connected_targets.lock().await;
            if let Some(t) = targets.values().find(|t| t.target_id == target_id) {
                return Some(t.clone());
            }
        }
        let (tx, rx) = oneshot::channel();
        self.pending_attach.lock().await.insert(target_id.to_string(), tx);
        let result = tokio::time::timeout(timeout, rx).await;
        self.pending_attach.lock().await.remove(target_id);
        result.ok().and_then(std::result::Result::ok)
    }

    /// Called by the bridge-link event handler once a target has been
    /// recorded in `connected_targets`, to wake up anyone in
    /// [`Self::wait_for_target`].
    pub async fn notify_target_attached(&self, target: &ConnectedTarget) {
        if let Some(tx) = self.pending_attach.lock().await.remove(&target.target_id) {
            let _ = tx.send(target.clone());
        }
    }

    // --- detach grace period (§8 invariants 8/9) ----------------------

    /// Start the grace window for a detached named page, keyed by the
    /// stable `targetId`. The name stays addressable (registered first,
    /// before the timer is spawned) until either a matching reattach
    /// cancels this window ([`Self::cancel_detach_grace`]) or the window
    /// elapses, at which point the mapping is finalized as removed.
    pub async fn start_detach_grace(self: &Arc<Self>, target_id: String, entry: PendingDetach) {
        self.pending_detach.lock().await.insert(target_id.clone(), entry);
        let state = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(state.grace_period).await;
            state.finalize_detach_grace(&target_id).await;
        });
    }

    /// Cancel a pending grace window (a reattach arrived in time), removing
    /// and returning the pending entry if one was registered.
    pub async fn cancel_detach_grace(&self, target_id: &str) -> Option<PendingDetach> {
        self.pending_detach.lock().await.remove(target_id)
    }

    async fn finalize_detach_grace(&self, target_id: &str) {
        let Some(entry) = self.pending_detach.lock().await.remove(target_id) else {
            return;
        };
        self.named_pages.lock().await.remove(&entry.key);
        if let Some(session_id) = &entry.agent_session {
            if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
                session.page_names.remove(&entry.name);
            }
        }
        self.remove_persisted(&entry.key).await;
        tracing::debug!(key = %entry.key, "detach grace expired, page removed");
    }
}

//! Durable page-mapping storage: `(key, targetId, tabId, url, lastSeen)` rows
//! surviving relay restarts so the recovery engine can re-bind live tabs to
//! the names agents already know.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use std::sync::Mutex as SyncMutex;
use tokio::sync::mpsc;

const FORMAT_VERSION: u32 = 1;
const SECS_PER_DAY: u64 = 86_400;

/// A single durable page mapping. `key` is `"<session>:<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPage {
    pub key: String,
    pub target_id: String,
    pub tab_id: u64,
    pub url: String,
    /// Unix timestamp (seconds) this entry was last confirmed live.
    pub last_seen: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PageFile {
    version: u32,
    pages: Vec<PersistedPage>,
}

#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    Serde(serde_json::Error),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "persistence I/O error: {e}"),
            Self::Serde(e) => write!(f, "persistence serialization error: {e}"),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Serde(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e)
    }
}

impl From<PersistenceError> for crate::error::AppError {
    fn from(e: PersistenceError) -> Self {
        use crate::error::ExitCode;
        Self::new(e.to_string(), ExitCode::GeneralError)
    }
}

fn now_unix_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Load persisted pages, silently dropping entries older than `max_age_days`.
///
/// Returns an empty list on any read or parse error — a corrupt or missing
/// persistence file is not fatal, it just means recovery has nothing to work
/// with.
#[must_use]
pub fn load(path: &Path, max_age_days: u64) -> Vec<PersistedPage> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    let file: PageFile = match serde_json::from_str(&contents) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };

    let now = now_unix_secs();
    let max_age_secs = max_age_days.saturating_mul(SECS_PER_DAY);
    file.pages
        .into_iter()
        .filter(|p| now.saturating_sub(p.last_seen) <= max_age_secs)
        .collect()
}

/// Write the full page list atomically: write to `<path>.tmp`, then rename.
///
/// # Errors
///
/// Returns `PersistenceError::Io` on any filesystem failure.
pub fn save(path: &Path, pages: &[PersistedPage]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = PageFile {
        version: FORMAT_VERSION,
        pages: pages.to_vec(),
    };
    let json = serde_json::to_string_pretty(&file)?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Coalesces repeated save requests into a single write after a debounce
/// window elapses with no further requests.
///
/// Mirrors the write-temp-then-rename discipline of [`save`], just delayed:
/// a background task owns the timer, and `request_save` only ever resets it.
pub struct DebouncedWriter {
    tx: mpsc::UnboundedSender<()>,
}

impl DebouncedWriter {
    /// Spawn the background debounce task. `getter` is called to fetch the
    /// latest snapshot to persist once the debounce window has elapsed with
    /// no further requests.
    pub fn spawn<F>(path: PathBuf, delay: Duration, getter: F) -> Self
    where
        F: Fn() -> Vec<PersistedPage> + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let getter = Arc::new(getter);

        tokio::spawn(async move {
            loop {
                if rx.recv().await.is_none() {
                    return;
                }
                loop {
                    tokio::select! {
                        biased;
                        more = rx.recv() => {
                            if more.is_none() {
                                return;
                            }
                            // another request arrived inside the window, restart it
                        }
                        () = tokio::time::sleep(delay) => break,
                    }
                }
                let snapshot = getter();
                if let Err(e) = save(&path, &snapshot) {
                    tracing::warn!(error = %e, path = %path.display(), "debounced page save failed");
                }
            }
        });

        Self { tx }
    }

    /// Request a save. Cheap and non-blocking; coalesced with any other
    /// pending request inside the debounce window.
    pub fn request_save(&self) {
        let _ = self.tx.send(());
    }
}

/// In-memory mirror the relay mutates directly; `DebouncedWriter::spawn`'s
/// getter closure typically clones out of a guard of one of these. A plain
/// `std::sync::Mutex` rather than the async kind: every access is a quick
/// clone-out with no `.await` held across the lock.
pub type SharedPageList = Arc<SyncMutex<Vec<PersistedPage>>>;

//! Re-binds persisted page mappings to live tabs after the bridge host
//! (re)connects. Stateless beyond the `RelayState` it's handed; triggered
//! ~500 ms after connect by [`super::bridge_link::handle_extension_socket`].

use std::sync::Arc;

use serde_json::Value;

use super::state::{ConnectedTarget, RelayState};
use crate::persistence::PersistedPage;

struct Candidate {
    tab_id: u64,
    url: String,
}

pub async fn run(state: &Arc<RelayState>) {
    let entries = state.snapshot_persisted();
    if entries.is_empty() {
        return;
    }

    let candidates = match fetch_candidates(state).await {
        Some(c) => c,
        None => {
            tracing::warn!("recovery: getAvailableTargets failed, skipping this pass");
            return;
        }
    };

    let mut used = std::collections::HashSet::new();
    for entry in entries {
        let Some(candidate) = candidates
            .iter()
            .filter(|c| !used.contains(&c.tab_id))
            .find(|c| c.url == entry.url)
        else {
            tracing::info!(key = %entry.key, "recovery: no matching tab, dropping stale entry");
            state.remove_persisted(&entry.key).await;
            continue;
        };
        used.insert(candidate.tab_id);

        if let Err(e) = reattach(state, &entry, candidate.tab_id).await {
            tracing::warn!(key = %entry.key, error = %e, "recovery: attach failed, dropping entry");
            state.remove_persisted(&entry.key).await;
        }
    }
}

async fn fetch_candidates(state: &Arc<RelayState>) -> Option<Vec<Candidate>> {
    let result = state.send_bridge_command("getAvailableTargets", None).await.ok()?;
    let targets = result.get("targets")?.as_array()?;
    Some(
        targets
            .iter()
            .filter_map(|t| {
                Some(Candidate {
                    tab_id: t.get("tabId")?.as_u64()?,
                    url: t.get("url")?.as_str()?.to_string(),
                })
            })
            .collect(),
    )
}

async fn reattach(state: &Arc<RelayState>, entry: &PersistedPage, tab_id: u64) -> Result<(), String> {
    let result = state
        .send_bridge_command("attachToTab", Some(serde_json::json!({ "tabId": tab_id })))
        .await
        .map_err(|e| e.to_string())?;

    let session_id = result
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or("attachToTab response missing sessionId")?
        .to_string();
    let target_id = result
        .get("targetId")
        .and_then(Value::as_str)
        .unwrap_or(&entry.target_id)
        .to_string();
    let url = result.get("url").and_then(Value::as_str).unwrap_or(&entry.url).to_string();

    state.connected_targets.lock().await.insert(
        session_id.clone(),
        ConnectedTarget {
            cdp_session_id: session_id.clone(),
            target_id: target_id.clone(),
            url: url.clone(),
            title: String::new(),
            target_type: "page".to_string(),
        },
    );
    state.named_pages.lock().await.insert(entry.key.clone(), session_id.clone());

    if let Some((session, name)) = entry.key.split_once(':') {
        state.target_to_agent_session.lock().await.insert(session_id.clone(), session.to_string());
        let mut sessions = state.sessions.lock().await;
        let owned = sessions.entry(session.to_string()).or_default();
        owned.page_names.insert(name.to_string());
        owned.target_sessions.insert(session_id.clone());
    }

    state
        .upsert_persisted(PersistedPage {
            key: entry.key.clone(),
            target_id,
            tab_id,
            url,
            last_seen: now_unix_secs(),
        })
        .await;

    Ok(())
}

fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

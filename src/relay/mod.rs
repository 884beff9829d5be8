//! The relay: the process automation clients and the bridge host both
//! connect to. Owns [`RelayState`], the shared source of truth for
//! connected targets, named pages and sessions, and exposes it through an
//! HTTP page-lifecycle surface and two families of WebSocket.

mod bridge_link;
mod error;
mod http;
mod recovery;
mod router;
mod state;
mod ws;

pub use error::RelayError;
pub use state::{page_key, ClientHandle, ConnectedTarget, RelayState, SessionEntry};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;

/// The resolved settings the relay binary hands to [`build`], distinct from
/// [`crate::config::ResolvedConfig`] (the raw TOML-derived settings) so this
/// module has no dependency on the config file shape.
pub struct RelayOptions {
    pub persistence_path: Option<PathBuf>,
    pub max_age_days: u64,
    pub debounce: Duration,
    pub tab_limit: usize,
    pub warn_threshold: usize,
    pub command_timeout: Duration,
    pub grace_period: Duration,
    pub target_wait_timeout: Duration,
}

/// Build the full axum [`Router`] (HTTP page surface plus both WebSocket
/// families) over one shared [`RelayState`].
#[must_use]
pub fn build(config: RelayOptions) -> Router {
    let state = RelayState::new(
        config.persistence_path,
        config.max_age_days,
        config.debounce,
        config.tab_limit,
        config.warn_threshold,
        config.command_timeout,
        config.grace_period,
        config.target_wait_timeout,
    );
    app(state)
}

fn app(state: Arc<RelayState>) -> Router {
    http::router(state.clone()).merge(ws::router(state))
}

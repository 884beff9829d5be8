//! Owns the bridge host's single outbound WebSocket connection to the relay.
//!
//! Modeled as a small state machine (`Idle -> Probing -> Connecting -> Open`,
//! with `Backoff` on failure) driven by one background task per
//! [`ConnectionManager::start_maintaining`] call. A generation counter tags
//! each connection attempt so a stale socket's close handler can never
//! trigger a reconnect chain that belongs to a newer connection.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;

use super::cdp_router::CdpRouter;
use super::error::BridgeError;
use crate::cdp::parse_bridge_message;
use crate::cdp::BridgeMessage;

/// WebSocket close code the relay sends when a newer bridge-host connection
/// has displaced this one. The receiving side must not reconnect on its own.
pub const CLOSE_REPLACED: u16 = 4001;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_INTERVAL: Duration = Duration::from_secs(3);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Probing,
    Connecting,
    Open,
    Backoff,
}

pub struct ConnectionManager {
    relay_host: String,
    relay_http_port: u16,
    relay_ws_url: String,
    state: Mutex<ConnectionState>,
    generation: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    replaced: std::sync::atomic::AtomicBool,
    maintaining: std::sync::atomic::AtomicBool,
    /// Fires once per successful connect, so callers (the bridge host) can
    /// re-announce already-attached targets without this module knowing
    /// anything about tabs or sessions.
    connected: tokio::sync::broadcast::Sender<()>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(relay_host: impl Into<String>, relay_http_port: u16, relay_ws_url: impl Into<String>) -> Self {
        let (connected, _) = tokio::sync::broadcast::channel(8);
        Self {
            relay_host: relay_host.into(),
            relay_http_port,
            relay_ws_url: relay_ws_url.into(),
            state: Mutex::new(ConnectionState::Idle),
            generation: AtomicU64::new(0),
            outbound: Mutex::new(None),
            replaced: std::sync::atomic::AtomicBool::new(false),
            maintaining: std::sync::atomic::AtomicBool::new(false),
            connected,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// Subscribe to connect notifications (one per successful open). Used
    /// by [`crate::bridge::BridgeHost`] to re-announce attached targets on
    /// every (re)connect, mirroring `onConnect` calling `reannounceTargets`.
    #[must_use]
    pub fn subscribe_connected(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.connected.subscribe()
    }

    async fn set_state(&self, s: ConnectionState) {
        *self.state.lock().await = s;
    }

    /// Liveness probe: if the socket reports `Open`, confirm the relay is
    /// actually reachable with a fresh HTTP HEAD. A half-open socket (the
    /// relay crashed without a clean close) reports `Open` here but fails
    /// the HEAD; in that case the stale socket is closed so the maintain
    /// loop's next read returns and reconnects.
    pub async fn check_connection(&self) -> bool {
        if self.state().await != ConnectionState::Open || self.outbound.lock().await.is_none() {
            return false;
        }
        if self.probe().await {
            return true;
        }
        if let Some(tx) = self.outbound.lock().await.take() {
            let _ = tx.send(Message::Close(None));
        }
        false
    }

    /// Send an already-serialized frame over the open socket, if any.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::NotConnected` if there is no open socket.
    pub async fn send(&self, payload: Value) -> Result<(), BridgeError> {
        let tx = self.outbound.lock().await;
        let tx = tx.as_ref().ok_or(BridgeError::NotConnected)?;
        tx.send(Message::Text(payload.to_string().into()))
            .map_err(|_| BridgeError::NotConnected)
    }

    /// Begin (or resume) maintaining the connection: probe, connect, read,
    /// and on any disconnect that isn't a 4001 replacement, chain into a
    /// backoff-and-retry loop. Idempotent: a call while a maintain loop is
    /// already running (any non-`Idle` state) is a no-op, so repeated calls
    /// — e.g. from a keep-alive tick — never spawn a second, overlapping
    /// reconnect chain. Returns immediately; the work runs in a spawned task
    /// tied to `self`.
    pub fn start_maintaining(self: &Arc<Self>, router: Arc<CdpRouter>) {
        if self
            .maintaining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.replaced.store(false, Ordering::SeqCst);
        let this = self.clone();
        tokio::spawn(async move {
            this.maintain_loop(router).await;
            this.maintaining.store(false, Ordering::SeqCst);
        });
    }

    async fn maintain_loop(self: Arc<Self>, router: Arc<CdpRouter>) {
        loop {
            if self.replaced.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Idle).await;
                return;
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

            self.set_state(ConnectionState::Probing).await;
            if !self.probe().await {
                self.set_state(ConnectionState::Backoff).await;
                tokio::time::sleep(BACKOFF_INTERVAL).await;
                continue;
            }

            self.set_state(ConnectionState::Connecting).await;
            match self.connect_and_serve(generation, router.clone()).await {
                Ok(()) => {
                    // Graceful close (e.g. replaced); run_socket already decided
                    // whether to keep looping via `replaced`.
                }
                Err(e) => {
                    tracing::warn!(error = %e, generation, "bridge connection lost");
                }
            }

            if self.replaced.load(Ordering::SeqCst) {
                return;
            }
            self.set_state(ConnectionState::Backoff).await;
            tokio::time::sleep(BACKOFF_INTERVAL).await;
        }
    }

    /// HTTP HEAD probe of the relay's HTTP surface, mirroring the raw-socket
    /// technique used for Chrome discovery elsewhere in this crate.
    async fn probe(&self) -> bool {
        let host = self.relay_host.clone();
        let port = self.relay_http_port;
        tokio::task::spawn_blocking(move || probe_blocking(&host, port))
            .await
            .unwrap_or(false)
    }

    async fn connect_and_serve(&self, generation: u64, router: Arc<CdpRouter>) -> Result<(), BridgeError> {
        let connect = tokio_tungstenite::connect_async(self.relay_ws_url.as_str());
        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| BridgeError::Backend("relay connect timed out".to_string()))?
            .map_err(|e| BridgeError::Backend(format!("relay connect failed: {e}")))?;

        self.set_state(ConnectionState::Open).await;
        tracing::info!(generation, "bridge host connected to relay");

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock().await = Some(tx);
        let _ = self.connected.send(());

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_incoming(&text, &router).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.as_ref().map_or(1000, |f| u16::from(f.code));
                            if code == CLOSE_REPLACED {
                                self.replaced.store(true, Ordering::SeqCst);
                                tracing::info!("bridge connection replaced by newer instance, not reconnecting");
                            }
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(BridgeError::Backend(format!("relay socket error: {e}")));
                        }
                        None => break,
                    }
                }
                outgoing = rx.recv() => {
                    let Some(msg) = outgoing else { break };
                    if write.send(msg).await.is_err() {
                        return Err(BridgeError::Backend("failed writing to relay socket".to_string()));
                    }
                }
                _ = keepalive.tick() => {
                    if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return Err(BridgeError::Backend("keepalive ping failed".to_string()));
                    }
                }
            }

            if self.generation.load(Ordering::SeqCst) != generation {
                // A newer connection attempt has already superseded this one;
                // this socket's loop should not affect shared state further.
                return Ok(());
            }
        }

        *self.outbound.lock().await = None;
        Ok(())
    }

    async fn handle_incoming(&self, text: &str, router: &Arc<CdpRouter>) {
        let Some(BridgeMessage::Command(cmd)) = parse_bridge_message(text) else {
            tracing::warn!(raw = %text, "unrecognized message from relay");
            return;
        };
        let result = router.dispatch(&cmd.method, cmd.params.unwrap_or(Value::Null)).await;
        let reply = match result {
            Ok(value) => json!({ "id": cmd.id, "result": value }),
            Err(e) => json!({ "id": cmd.id, "error": e.to_string() }),
        };
        if let Err(e) = self.send(reply).await {
            tracing::warn!(error = %e, "failed to send command reply");
        }
    }
}

fn probe_blocking(host: &str, port: u16) -> bool {
    let Ok(addr) = format!("{host}:{port}").parse() else {
        return false;
    };
    let Ok(mut stream) = TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) else {
        return false;
    };
    stream.set_read_timeout(Some(PROBE_TIMEOUT)).ok();
    let request = format!("HEAD / HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: close\r\n\r\n");
    if stream.write_all(request.as_bytes()).is_err() {
        return false;
    }
    let mut buf = [0u8; 256];
    stream.read(&mut buf).is_ok_and(|n| n > 0 && buf.starts_with(b"HTTP/1.1 2"))
}

use std::fmt;

/// Errors surfaced by the bridge host: the debuggee backend, the session
/// registry, the tab manager, and the CDP router.
#[derive(Debug)]
pub enum BridgeError {
    /// No tab matches the requested tabId/targetId/sessionId.
    TabNotFound(String),
    /// No session is registered under this id.
    SessionNotFound(String),
    /// The backend refused or failed a debugger operation.
    Backend(String),
    /// A debugger attach attempt exhausted its retry budget.
    AttachFailed { tab_id: u64, attempts: u32 },
    /// The relay sent a method the router does not recognize.
    UnknownMethod(String),
    /// The connection to the relay is not currently open.
    NotConnected,
    /// Malformed message received on the bridge-host<->relay wire.
    Protocol(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TabNotFound(id) => write!(f, "no tab found for {id}"),
            Self::SessionNotFound(id) => write!(f, "no session found for {id}"),
            Self::Backend(msg) => write!(f, "debuggee backend error: {msg}"),
            Self::AttachFailed { tab_id, attempts } => {
                write!(f, "debugger attach to tab {tab_id} failed after {attempts} attempts")
            }
            Self::UnknownMethod(method) => write!(f, "unknown method: {method}"),
            Self::NotConnected => write!(f, "not connected to relay"),
            Self::Protocol(msg) => write!(f, "bridge protocol error: {msg}"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<BridgeError> for crate::error::AppError {
    fn from(e: BridgeError) -> Self {
        use crate::error::ExitCode;
        let code = match &e {
            BridgeError::NotConnected => ExitCode::ConnectionError,
            BridgeError::Protocol(_) => ExitCode::ProtocolError,
            BridgeError::TabNotFound(_)
            | BridgeError::SessionNotFound(_)
            | BridgeError::Backend(_)
            | BridgeError::AttachFailed { .. }
            | BridgeError::UnknownMethod(_) => ExitCode::GeneralError,
        };
        Self::new(e.to_string(), code)
    }
}

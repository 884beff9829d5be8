use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A CDP JSON-RPC command, in either direction of the client↔relay socket.
///
/// Also used (with `id` left unset by the caller's own counter) for commands
/// the relay sends across the client socket when synthesizing events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdpCommand {
    /// Unique message ID for response correlation.
    pub id: u64,
    /// CDP method name (e.g., `Target.setAutoAttach`).
    pub method: String,
    /// Optional parameters for the command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Optional session ID for session-scoped commands.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Raw incoming CDP message before classification.
///
/// This is the union of response and event fields — every incoming
/// WebSocket message is deserialized into this type first, then
/// classified via [`classify`](Self::classify).
#[derive(Debug, Deserialize)]
pub struct RawCdpMessage {
    /// Present for responses; absent for events.
    pub id: Option<u64>,
    /// Present for events (and some responses with `method`).
    pub method: Option<String>,
    /// Event parameters or additional response data.
    pub params: Option<Value>,
    /// Successful response payload.
    pub result: Option<Value>,
    /// Protocol error payload.
    pub error: Option<CdpProtocolError>,
    /// Session ID for session-scoped messages.
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// CDP protocol error payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CdpProtocolError {
    /// The CDP error code (e.g., -32000).
    #[serde(default)]
    pub code: i64,
    /// Human-readable error description.
    pub message: String,
}

/// Parsed CDP response (has an `id`).
#[derive(Debug)]
pub struct CdpResponse {
    /// The message ID that correlates to the sent command.
    pub id: u64,
    /// The result: either a successful value or a protocol error.
    pub result: Result<Value, CdpProtocolError>,
    /// Session ID if this response is session-scoped.
    pub session_id: Option<String>,
}

/// Parsed CDP event (no `id`, has `method`).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    /// The CDP event method name (e.g., `Target.attachedToTarget`).
    pub method: String,
    /// Event parameters.
    pub params: Value,
    /// Session ID if this event is session-scoped.
    pub session_id: Option<String>,
}

/// Classification of a raw CDP message.
pub enum MessageKind {
    /// A response to a previously sent command.
    Response(CdpResponse),
    /// An asynchronous event.
    Event(CdpEvent),
}

impl RawCdpMessage {
    /// Classify this raw message as either a response or an event.
    ///
    /// Messages with an `id` field are responses; messages with a `method`
    /// field but no `id` are events. Returns `None` if the message cannot
    /// be classified (neither `id` nor `method` present).
    #[must_use]
    pub fn classify(self) -> Option<MessageKind> {
        if let Some(id) = self.id {
            let result = if let Some(error) = self.error {
                Err(error)
            } else {
                Ok(self.result.unwrap_or(Value::Null))
            };
            Some(MessageKind::Response(CdpResponse {
                id,
                result,
                session_id: self.session_id,
            }))
        } else if let Some(method) = self.method {
            Some(MessageKind::Event(CdpEvent {
                method,
                params: self.params.unwrap_or(Value::Null),
                session_id: self.session_id,
            }))
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Relay <-> bridge-host wire protocol (§6, "Bridge host<->relay WebSocket").
// ---------------------------------------------------------------------------

/// Command sent from the relay to the bridge host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeCommand {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Event synthesized by the bridge host and forwarded to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedCdpEvent {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A single parsed message arriving on the bridge-host<->relay socket, from
/// either side's point of view.
#[derive(Debug, Clone)]
pub enum BridgeMessage {
    /// `{id, result?} | {id, error}` — answers a previously sent `BridgeCommand`.
    Response {
        id: u64,
        result: Result<Value, String>,
    },
    /// `{method:"forwardCDPEvent", params:{method, params?, sessionId?}, _agentSession?}`.
    Event(BridgeEvent),
    /// `{method:"log", params:{level, args[]}}`.
    Log(BridgeLog),
    /// A command sent the other direction (bridge host receiving from relay).
    Command(BridgeCommand),
}

#[derive(Debug, Clone)]
pub struct BridgeEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
    pub agent_session: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeLog {
    pub level: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// On-wire envelope used to classify an incoming bridge message before
/// committing to a shape, same spirit as [`RawCdpMessage`].
#[derive(Debug, Deserialize)]
struct RawBridgeMessage {
    id: Option<u64>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<RawBridgeError>,
    #[serde(rename = "_agentSession")]
    agent_session: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBridgeError {
    Message(String),
    Structured(CdpProtocolError),
}

impl RawBridgeError {
    fn into_message(self) -> String {
        match self {
            Self::Message(m) => m,
            Self::Structured(e) => e.message,
        }
    }
}

/// Parse one line of the bridge-host<->relay protocol.
///
/// Returns `None` for a message that is neither a valid response, event,
/// log, nor command (malformed input — the caller should treat this as a
/// JSON-RPC parse error on the socket).
#[must_use]
pub fn parse_bridge_message(text: &str) -> Option<BridgeMessage> {
    let raw: RawBridgeMessage = serde_json::from_str(text).ok()?;

    if let Some(id) = raw.id {
        if raw.method.is_none() {
            let result = match raw.error {
                Some(e) => Err(e.into_message()),
                None => Ok(raw.result.unwrap_or(Value::Null)),
            };
            return Some(BridgeMessage::Response { id, result });
        }
        // Has both id and method: treat as a command (relay -> bridge host).
        return Some(BridgeMessage::Command(BridgeCommand {
            id,
            method: raw.method.unwrap(),
            params: raw.params,
        }));
    }

    match raw.method.as_deref() {
        Some("forwardCDPEvent") => {
            let params = raw.params.unwrap_or(Value::Null);
            let method = params
                .get("method")
                .and_then(Value::as_str)
                .map(str::to_owned)?;
            let session_id = params
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let inner_params = params.get("params").cloned().unwrap_or(Value::Null);
            Some(BridgeMessage::Event(BridgeEvent {
                method,
                params: inner_params,
                session_id,
                agent_session: raw.agent_session,
            }))
        }
        Some("log") => {
            let params = raw.params.unwrap_or(Value::Null);
            let log: BridgeLog = serde_json::from_value(params).ok()?;
            Some(BridgeMessage::Log(log))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // --- CdpCommand serialization ---

    #[test]
    fn serialize_command_without_params_or_session() {
        let cmd = CdpCommand {
            id: 1,
            method: "Browser.getVersion".into(),
            params: None,
            session_id: None,
        };
        let json: Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "Browser.getVersion");
        assert!(json.get("params").is_none());
        assert!(json.get("sessionId").is_none());
    }

    #[test]
    fn serialize_command_with_session_id() {
        let cmd = CdpCommand {
            id: 3,
            method: "Runtime.evaluate".into(),
            params: Some(json!({"expression": "1+1"})),
            session_id: Some("session-abc".into()),
        };
        let json: Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["sessionId"], "session-abc");
    }

    // --- RawCdpMessage / classify() ---

    #[test]
    fn classify_response() {
        let raw: RawCdpMessage = serde_json::from_str(r#"{"id": 1, "result": {"ok": true}}"#).unwrap();
        match raw.classify() {
            Some(MessageKind::Response(resp)) => {
                assert_eq!(resp.id, 1);
                assert!(resp.result.is_ok());
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn classify_error_response() {
        let raw: RawCdpMessage = serde_json::from_str(
            r#"{"id": 2, "error": {"code": -32600, "message": "Invalid request"}}"#,
        )
        .unwrap();
        match raw.classify() {
            Some(MessageKind::Response(resp)) => {
                let err = resp.result.unwrap_err();
                assert_eq!(err.code, -32600);
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn classify_event() {
        let raw: RawCdpMessage = serde_json::from_str(
            r#"{"method": "Target.attachedToTarget", "params": {"targetInfo": {}}}"#,
        )
        .unwrap();
        match raw.classify() {
            Some(MessageKind::Event(event)) => {
                assert_eq!(event.method, "Target.attachedToTarget");
            }
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn classify_unclassifiable_returns_none() {
        let raw: RawCdpMessage = serde_json::from_str(r"{}").unwrap();
        assert!(raw.classify().is_none());
    }

    // --- Bridge protocol parsing ---

    #[test]
    fn parse_bridge_response_success() {
        let msg = parse_bridge_message(r#"{"id": 5, "result": {"tabId": 1}}"#).unwrap();
        match msg {
            BridgeMessage::Response { id, result } => {
                assert_eq!(id, 5);
                assert_eq!(result.unwrap()["tabId"], 1);
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn parse_bridge_response_string_error() {
        let msg = parse_bridge_message(r#"{"id": 6, "error": "no such tab"}"#).unwrap();
        match msg {
            BridgeMessage::Response { id, result } => {
                assert_eq!(id, 6);
                assert_eq!(result.unwrap_err(), "no such tab");
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn parse_bridge_command() {
        let msg = parse_bridge_message(
            r#"{"id": 7, "method": "getAvailableTargets", "params": {}}"#,
        )
        .unwrap();
        match msg {
            BridgeMessage::Command(cmd) => {
                assert_eq!(cmd.id, 7);
                assert_eq!(cmd.method, "getAvailableTargets");
            }
            _ => panic!("expected command"),
        }
    }

    #[test]
    fn parse_bridge_forwarded_event() {
        let raw = r#"{"method":"forwardCDPEvent","params":{"method":"Target.attachedToTarget","sessionId":"sid-1","params":{"targetInfo":{}}},"_agentSession":"s1"}"#;
        let msg = parse_bridge_message(raw).unwrap();
        match msg {
            BridgeMessage::Event(ev) => {
                assert_eq!(ev.method, "Target.attachedToTarget");
                assert_eq!(ev.session_id.as_deref(), Some("sid-1"));
                assert_eq!(ev.agent_session.as_deref(), Some("s1"));
            }
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn parse_bridge_log() {
        let raw = r#"{"method":"log","params":{"level":"warn","args":["tab closed"]}}"#;
        let msg = parse_bridge_message(raw).unwrap();
        match msg {
            BridgeMessage::Log(log) => {
                assert_eq!(log.level, "warn");
                assert_eq!(log.args.len(), 1);
            }
            _ => panic!("expected log"),
        }
    }

    #[test]
    fn parse_bridge_malformed_returns_none() {
        assert!(parse_bridge_message("not json").is_none());
        assert!(parse_bridge_message("{}").is_none());
    }
}

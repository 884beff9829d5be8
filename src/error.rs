use std::fmt;

/// Process exit codes shared by both binaries (`devbridge-relay`, `devbridge-host`).
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    ConnectionError = 2,
    ConfigError = 3,
    TimeoutError = 4,
    ProtocolError = 5,
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::GeneralError => write!(f, "general error"),
            Self::ConnectionError => write!(f, "connection error"),
            Self::ConfigError => write!(f, "config error"),
            Self::TimeoutError => write!(f, "timeout error"),
            Self::ProtocolError => write!(f, "protocol error"),
        }
    }
}

/// Top-level error type both binaries' entry points exit through.
///
/// Every fallible component (`RelayError`, `BridgeError`, `CdpError`,
/// `ConfigError`, `PersistenceError`) converts into this via `From`, so a
/// single `print_json_stderr` + exit-code path covers every failure.
#[derive(Debug)]
pub struct AppError {
    pub message: String,
    pub code: ExitCode,
    /// Extra structured fields a caller wants surfaced alongside `message`
    /// (e.g. `{"limit": 5, "current": 6}` for a capacity error).
    pub custom_json: Option<serde_json::Value>,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl AppError {
    #[must_use]
    pub fn new(message: impl Into<String>, code: ExitCode) -> Self {
        Self {
            message: message.into(),
            code,
            custom_json: None,
        }
    }

    #[must_use]
    pub fn with_json(mut self, json: serde_json::Value) -> Self {
        self.custom_json = Some(json);
        self
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        let mut value = serde_json::json!({
            "error": self.message,
            "code": self.code as u8,
        });
        if let (Some(extra), Some(obj)) = (&self.custom_json, value.as_object_mut()) {
            if let Some(extra_obj) = extra.as_object() {
                for (k, v) in extra_obj {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }
        serde_json::to_string(&value)
            .unwrap_or_else(|_| format!(r#"{{"error":"{}","code":{}}}"#, self.message, self.code as u8))
    }

    pub fn print_json_stderr(&self) {
        eprintln!("{}", self.to_json());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_json_has_error_and_code() {
        let err = AppError::new("bad config", ExitCode::ConfigError);
        let parsed: serde_json::Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(parsed["error"], "bad config");
        assert_eq!(parsed["code"], 3);
    }

    #[test]
    fn to_json_merges_custom_fields() {
        let err = AppError::new("limit reached", ExitCode::GeneralError)
            .with_json(serde_json::json!({"limit": 5, "current": 6}));
        let parsed: serde_json::Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(parsed["limit"], 5);
        assert_eq!(parsed["current"], 6);
        assert_eq!(parsed["error"], "limit reached");
    }

    #[test]
    fn exit_code_display() {
        assert_eq!(ExitCode::Success.to_string(), "success");
        assert_eq!(ExitCode::ConnectionError.to_string(), "connection error");
    }

    #[test]
    fn app_error_display() {
        let err = AppError::new("port in use", ExitCode::GeneralError);
        assert_eq!(err.to_string(), "general error: port in use");
    }
}

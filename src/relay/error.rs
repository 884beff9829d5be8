use std::fmt;

/// Errors surfaced by the relay's router, HTTP surface, and bridge link.
#[derive(Debug)]
pub enum RelayError {
    /// No bridge host is currently connected.
    ExtensionNotConnected,
    /// The bridge host did not answer within the round-trip timeout.
    Timeout,
    /// The bridge host answered with an error string.
    Bridge(String),
    /// A requested page name has no mapping in this session.
    PageNotFound(String),
    /// `name` or session id failed validation (empty, too long, reserved `:`).
    Validation(String),
    /// The session has reached its open-tab limit.
    TabLimitExceeded { limit: usize },
    /// An unrecoverable I/O or (de)serialization failure.
    Internal(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExtensionNotConnected => write!(f, "Extension not connected"),
            Self::Timeout => write!(f, "bridge host did not respond in time"),
            Self::Bridge(msg) => write!(f, "{msg}"),
            Self::PageNotFound(name) => write!(f, "no page named {name}"),
            Self::Validation(msg) => write!(f, "{msg}"),
            Self::TabLimitExceeded { limit } => {
                write!(f, "session has reached its tab limit ({limit})")
            }
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<RelayError> for crate::error::AppError {
    fn from(e: RelayError) -> Self {
        use crate::error::ExitCode;
        let code = match &e {
            RelayError::ExtensionNotConnected | RelayError::Timeout => ExitCode::ConnectionError,
            RelayError::Validation(_) | RelayError::TabLimitExceeded { .. } | RelayError::PageNotFound(_) => {
                ExitCode::GeneralError
            }
            RelayError::Bridge(_) => ExitCode::ProtocolError,
            RelayError::Internal(_) => ExitCode::GeneralError,
        };
        Self::new(e.to_string(), code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_extension_not_connected() {
        assert_eq!(RelayError::ExtensionNotConnected.to_string(), "Extension not connected");
    }

    #[test]
    fn display_tab_limit_mentions_limit() {
        assert!(RelayError::TabLimitExceeded { limit: 5 }.to_string().contains("limit"));
    }

    #[test]
    fn into_app_error_maps_exit_code() {
        let app: crate::error::AppError = RelayError::Timeout.into();
        assert!(matches!(app.code, crate::error::ExitCode::ConnectionError));
    }
}

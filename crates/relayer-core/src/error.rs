use serde::Serialize;

/// Error categories from the propagation-policy design: driver-level errors
/// abort the run, unit/session-level errors are captured and do not.
#[derive(Debug, thiserror::Error, Clone)]
pub enum RelayError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("rate limited: flood-wait {seconds}s")]
    RateLimited { seconds: u64 },

    #[error("transient error: {0}")]
    Transient(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("last logged-in session is protected from disable")]
    LastSessionProtected,

    #[error("no sessions available")]
    NoSessionsAvailable,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serde(e.to_string())
    }
}

impl Serialize for RelayError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = RelayError::Validation("empty targets".to_string());
        assert_eq!(err.to_string(), "validation error: empty targets");
    }

    #[test]
    fn rate_limited_display() {
        let err = RelayError::RateLimited { seconds: 120 };
        assert_eq!(err.to_string(), "rate limited: flood-wait 120s");
    }

    #[test]
    fn last_session_protected_display() {
        let err = RelayError::LastSessionProtected;
        assert_eq!(
            err.to_string(),
            "last logged-in session is protected from disable"
        );
    }

    #[test]
    fn io_error_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        let err: RelayError = io_err.into();
        assert!(err.to_string().contains("missing file"));
    }

    #[test]
    fn serialize_produces_string() {
        let err = RelayError::Cancelled;
        let json = serde_json::to_string(&err).expect("serialize should succeed");
        assert_eq!(json, "\"operation cancelled\"");
    }
}

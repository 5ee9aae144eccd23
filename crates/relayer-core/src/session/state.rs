use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`super::pool::SessionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disabled,
    NotLoggedIn,
    LoggingIn,
    LoggedIn,
    LoginFailed,
    Error,
}

impl SessionState {
    pub fn is_logged_in(self) -> bool {
        matches!(self, SessionState::LoggedIn)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disabled => "disabled",
            SessionState::NotLoggedIn => "not-logged-in",
            SessionState::LoggingIn => "logging-in",
            SessionState::LoggedIn => "logged-in",
            SessionState::LoginFailed => "login-failed",
            SessionState::Error => "error",
        };
        write!(f, "{s}")
    }
}

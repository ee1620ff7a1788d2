//! Error types shared by the client, the tasks and the scheduler.

use thiserror::Error;

use crate::model::ErrorDetail;
use crate::tasks::TaskKey;

/// Coarse failure domain used when reporting and reacting to errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The token was rejected.
    Auth,
    /// Unreachable or invalid host, or a response we could not make sense of.
    Host,
    /// Timeouts and dropped connections.
    TransientNetwork,
    /// Unexpected internal state.
    Logic,
}

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Gotify request failed: {0}")]
    Api(ErrorDetail),

    #[error("Connection request failed: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Api(detail) if detail.is_unauthorized() => ErrorKind::Auth,
            Self::Api(_) | Self::InvalidUrl(_) | Self::Decode(_) => ErrorKind::Host,
            Self::Transport(_) | Self::Timeout(_) => ErrorKind::TransientNetwork,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }

    /// Server error body, or a synthesized one for failures that never
    /// reached the server.
    pub fn detail(&self) -> ErrorDetail {
        match self {
            Self::Api(detail) => detail.clone(),
            Self::Transport(reason) => ErrorDetail::new("Connection failed", 0, reason.clone()),
            Self::Timeout(reason) => ErrorDetail::new("Timeout", 0, reason.clone()),
            Self::InvalidUrl(reason) => ErrorDetail::new("Invalid URL", 0, reason.clone()),
            Self::Decode(reason) => ErrorDetail::new("Malformed response", 0, reason.clone()),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(error.to_string())
        } else if error.is_decode() {
            Self::Decode(error.to_string())
        } else if error.is_builder() {
            Self::InvalidUrl(error.to_string())
        } else {
            Self::Transport(error.to_string())
        }
    }
}

/// Failure raised while a task runs. Never crosses the task boundary: the
/// scheduler turns it into a `Failed` signal.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Unexpected state: {0}")]
    Logic(String),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Client(error) => error.kind(),
            Self::Logic(_) => ErrorKind::Logic,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Task {key} is already running")]
    AlreadyRunning { key: TaskKey },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("No token found. Set one in the settings file or GOTIFY_TOKEN")]
    MissingToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_split_auth_from_host() {
        let unauthorized = ClientError::Api(ErrorDetail::new("Unauthorized", 401, ""));
        let missing = ClientError::Api(ErrorDetail::new("Not Found", 404, ""));
        assert_eq!(unauthorized.kind(), ErrorKind::Auth);
        assert!(unauthorized.is_unauthorized());
        assert_eq!(missing.kind(), ErrorKind::Host);
    }

    #[test]
    fn transport_failures_are_transient() {
        assert_eq!(
            ClientError::Timeout("10s".into()).kind(),
            ErrorKind::TransientNetwork
        );
        assert_eq!(
            ClientError::Transport("refused".into()).kind(),
            ErrorKind::TransientNetwork
        );
    }

    #[test]
    fn synthesized_detail_carries_reason() {
        let detail = ClientError::Transport("connection refused".into()).detail();
        assert_eq!(detail.error_code, 0);
        assert_eq!(detail.error_description, "connection refused");
        assert!(!detail.is_unauthorized());
    }
}

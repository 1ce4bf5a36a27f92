//! GitHub API error taxonomy.
//!
//! Every failure of the REST client is normalised into [`GitHubError`], so
//! callers branch on one type:
//!
//! - **Status**: the API answered with a non-success code. `401` means the
//!   stored credential is no longer valid; `404` means the resource is gone.
//! - **Timeout** / **Network** / **Decode**: transient, retried next cycle.
//! - **Cancelled**: shutdown interrupted a rate-limit wait.
//!
//! Rate limiting is not an error: the client waits for the reset and retries.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub API error (HTTP {status}): {message}")]
    Status { status: u16, message: String },

    #[error("GitHub request timed out")]
    Timeout,

    #[error("GitHub request failed: {0}")]
    Network(String),

    #[error("invalid GitHub response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("GitHub request cancelled by shutdown")]
    Cancelled,
}

impl GitHubError {
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        GitHubError::Status {
            status: status.as_u16(),
            message: message.into(),
        }
    }

    /// HTTP-flavoured code for every variant, so logs and callers can treat
    /// transport failures like server errors.
    pub fn status_code(&self) -> u16 {
        match self {
            GitHubError::Status { status, .. } => *status,
            GitHubError::Timeout => 408,
            GitHubError::InvalidInput(_) => 400,
            GitHubError::Network(_) | GitHubError::Decode(_) | GitHubError::Cancelled => 500,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status_code() == 401
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == 404
    }
}

impl From<reqwest::Error> for GitHubError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GitHubError::Timeout
        } else if err.is_decode() {
            GitHubError::Decode(err.to_string())
        } else {
            GitHubError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GitHubError {
    fn from(err: serde_json::Error) -> Self {
        GitHubError::Decode(err.to_string())
    }
}

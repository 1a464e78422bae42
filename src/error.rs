//! Error types shared by the resolver, proxy and browser layers.

use thiserror::Error;

/// Failures surfaced by resolution and proxying.
///
/// Every variant owns plain data so a single result can be handed to all
/// callers waiting on the same in-flight operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("no stream found: {0}")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream returned {status} for {url}")]
    UpstreamStatus { status: u16, url: String },

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl RelayError {
    /// Short machine-readable kind, used in logs and the error log.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::Upstream(_) | Self::UpstreamStatus { .. } => "upstream",
            Self::BadRequest(_) => "bad_request",
        }
    }

    /// Returns `true` if an explicit time bound elapsed.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if let (Some(status), Some(url)) = (err.status(), err.url()) {
            Self::UpstreamStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }
        } else {
            Self::Upstream(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Upstream(format!("devtools connection: {err}"))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Upstream(format!("invalid devtools message: {err}"))
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

use thiserror::Error as ThisError;

/// Failures surfaced to dashboard callers. The display string is the
/// user-facing `error` message.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{message}")]
    Unauthorized {
        message: String,
        detail: Option<String>,
    },

    #[error("{0}")]
    NotConnected(String),

    #[error("{0}")]
    MissingConfiguration(String),

    /// The upstream provider answered, but not with what we needed.
    #[error("{0}")]
    Upstream(String),

    /// The upstream service refused the request outright.
    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    BadGateway(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Error::Unauthorized {
            message: message.into(),
            detail: None,
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Error::Upstream(message.into())
    }

    /// Extra hint attached by the failure itself, overriding the handler's default.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Error::Unauthorized { detail, .. } => detail.as_deref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Other(err.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Other(err.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

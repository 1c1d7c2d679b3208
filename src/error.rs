use std::error::Error;
use std::fmt;
use std::io;

// Crate-wide error type for the receiver.
#[derive(Debug)]
pub enum AppError {
    RequestError(reqwest::Error),
    ParseError {
        error: serde_json::Error,
        context: String,
    },
    IoError(io::Error),
    InvalidResponse(String),
    /// The service answered 400 with an "Unknown SID" marker: the channel
    /// expired and must be reopened with OSID/OAID.
    SessionExpired,
    /// The service answered 410 Gone: the session is unrecoverable and a
    /// full handshake (including a fresh lounge token) is required.
    SessionGone,
    /// A retriable transport failure (502, connection reset, EOF on bind).
    Transient(String),
    /// The request hit the client timeout; retried after a fixed pause
    /// without counting against the backoff budget.
    Timeout,
    /// The media backend could not answer a property read right now.
    PropertyUnavailable,
    ConfigError(String),
    Other(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AppError::RequestError(e) => write!(f, "request error: {}", e),
            AppError::ParseError { error, context } => {
                write!(f, "parse error: {} in {}", error, context)
            }
            AppError::IoError(e) => write!(f, "IO error: {}", e),
            AppError::InvalidResponse(s) => write!(f, "invalid response: {}", s),
            AppError::SessionExpired => write!(f, "lounge session expired"),
            AppError::SessionGone => write!(f, "lounge session gone"),
            AppError::Transient(s) => write!(f, "transient error: {}", s),
            AppError::Timeout => write!(f, "request timed out"),
            AppError::PropertyUnavailable => write!(f, "media player: property unavailable"),
            AppError::ConfigError(s) => write!(f, "config error: {}", s),
            AppError::Other(s) => write!(f, "{}", s),
        }
    }
}

impl Error for AppError {}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::IoError(err)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Timeout
        } else {
            AppError::RequestError(err)
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ParseError {
            error: err,
            context: "no context provided".to_string(),
        }
    }
}

/// Create a parse error carrying the decode context.
pub fn parse_error(error: serde_json::Error, context: impl Into<String>) -> AppError {
    AppError::ParseError {
        error,
        context: context.into(),
    }
}

impl AppError {
    /// Whether the session loop may keep the channel alive after this error.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AppError::Transient(_)
                | AppError::Timeout
                | AppError::SessionExpired
                | AppError::SessionGone
        )
    }
}

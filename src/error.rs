use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Classification shared by every tracker adapter.
///
/// Adapters map their HTTP status codes and client failures onto these
/// kinds at the port boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    NotFound,
    AccessDenied,
    Transition,
    RateLimit,
    Transient,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::Transition => "transition",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Transient => "transient",
            ErrorKind::Other => "other",
        }
    }
}

/// Error raised by an [`IssueTrackerPort`](crate::ports::IssueTrackerPort) call.
#[derive(Debug, Clone, Error)]
pub enum TrackerError {
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("resource not found: {message}")]
    NotFound {
        message: String,
        issue_key: Option<String>,
    },

    #[error("access denied: {message}")]
    AccessDenied {
        message: String,
        issue_key: Option<String>,
    },

    #[error("transition failed: {message}")]
    Transition {
        message: String,
        issue_key: Option<String>,
    },

    #[error("rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<u64>,
    },

    #[error("transient tracker error: {message}")]
    Transient { message: String },

    #[error("tracker error: {message}")]
    Other {
        message: String,
        issue_key: Option<String>,
    },
}

impl TrackerError {
    pub fn authentication(message: impl Into<String>) -> Self {
        TrackerError::Authentication {
            message: message.into(),
        }
    }

    pub fn not_found(issue_key: &str, message: impl Into<String>) -> Self {
        TrackerError::NotFound {
            message: message.into(),
            issue_key: Some(issue_key.to_string()),
        }
    }

    pub fn access_denied(issue_key: &str, message: impl Into<String>) -> Self {
        TrackerError::AccessDenied {
            message: message.into(),
            issue_key: Some(issue_key.to_string()),
        }
    }

    pub fn transition(issue_key: &str, message: impl Into<String>) -> Self {
        TrackerError::Transition {
            message: message.into(),
            issue_key: Some(issue_key.to_string()),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        TrackerError::Transient {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::Authentication { .. } => ErrorKind::Authentication,
            TrackerError::NotFound { .. } => ErrorKind::NotFound,
            TrackerError::AccessDenied { .. } => ErrorKind::AccessDenied,
            TrackerError::Transition { .. } => ErrorKind::Transition,
            TrackerError::RateLimit { .. } => ErrorKind::RateLimit,
            TrackerError::Transient { .. } => ErrorKind::Transient,
            TrackerError::Other { .. } => ErrorKind::Other,
        }
    }

    /// Fatal errors abort the whole remaining batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TrackerError::Authentication { .. })
    }

    /// Only read operations are ever retried on these.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrackerError::RateLimit { .. } | TrackerError::Transient { .. }
        )
    }

    pub fn issue_key(&self) -> Option<&str> {
        match self {
            TrackerError::NotFound { issue_key, .. }
            | TrackerError::AccessDenied { issue_key, .. }
            | TrackerError::Transition { issue_key, .. }
            | TrackerError::Other { issue_key, .. } => issue_key.as_deref(),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            TrackerError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Failure while turning the markdown document into stories.
#[derive(Debug, Clone)]
pub struct ParserError {
    pub message: String,
    pub source_path: PathBuf,
    pub line: Option<usize>,
}

impl ParserError {
    pub fn new(source_path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source_path: source_path.into(),
            line: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

impl std::fmt::Display for ParserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source_path.display())?;
        if let Some(line) = self.line {
            write!(f, ":{line}")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for ParserError {}

/// Invalid configuration, detected before any sync work starts.
#[derive(Debug, Clone, Error)]
#[error("invalid configuration: {}", .problems.join("; "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

/// Unrecoverable failure of a sync run.
///
/// Per-item tracker failures never surface here; they are collected into
/// the run's result instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Parser(#[from] ParserError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for SyncError {
    fn from(value: anyhow::Error) -> Self {
        SyncError::Storage(value)
    }
}

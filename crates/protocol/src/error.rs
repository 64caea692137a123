//! Errors reported by remote actions.

/// Failure of a single remote action, as reported by the endpoint or the
/// transport carrying it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ActionError {
    /// Returns `true` for failures worth retrying (the same request may
    /// succeed a moment later).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout | Self::Transport(_))
    }
}

impl From<std::io::Error> for ActionError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(e.to_string()),
            std::io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(e.to_string()),
        }
    }
}

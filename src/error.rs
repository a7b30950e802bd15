use thiserror::Error;

/// Failures reported by a backend adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The session could not be established or was lost (credentials,
    /// connectivity). Fatal to the whole account.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// One conversation could not be listed or fetched. Recorded on the
    /// conversation and retried with `--force`.
    #[error("conversation error: {0}")]
    Conversation(String),
}

impl BackendError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Authentication(_))
    }
}

/// Reasons the unknown-sender resolver refuses to act.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no name provided")]
    NoName,
    #[error("conversation {0} does not exist")]
    NotFound(i64),
    #[error("conversation {0} is a group conversation")]
    GroupConversation(i64),
    #[error("conversation {0} has messages from {1} unknown senders (ambiguous, cannot auto-resolve)")]
    Ambiguous(i64, usize),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

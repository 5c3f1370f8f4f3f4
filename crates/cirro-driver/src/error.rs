use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    /// Unrecoverable failure; the node fails.
    #[error("driver failure: {0}")]
    Fatal(String),

    /// The driver believes a retry could succeed. The engine performs no
    /// retries itself; this only informs reporting.
    #[error("transient driver failure: {0}")]
    Transient(String),

    /// The driver aborted because the operation's context was cancelled.
    #[error("driver call cancelled")]
    Cancelled,

    #[error("no driver registered under name '{0}'")]
    NotRegistered(String),

    #[error("invalid module source {path}: {reason}")]
    InvalidModule { path: String, reason: String },
}

impl DriverError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DriverError::Cancelled)
    }
}

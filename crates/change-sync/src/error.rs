use thiserror::Error;

/// Failures raised by a [`ChangeFeed`](crate::subscription::ChangeFeed)
/// implementation while opening or tearing down a channel.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to connect change feed: {0}")]
    Connect(String),
    #[error("change feed protocol error: {0}")]
    Protocol(String),
    #[error("change feed closed")]
    Closed,
    #[error("failed to release change feed channel: {0}")]
    Release(String),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot request failed: {0}")]
    Http(String),
    #[error("snapshot endpoint returned status {0}")]
    Status(u16),
    #[error("snapshot payload malformed: {0}")]
    Decode(String),
    #[error("view worker is no longer accepting snapshots")]
    Discarded,
}

/// Why a change record could not be turned into a row.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("record is missing field `{0}`")]
    MissingField(String),
    #[error("record field `{field}` is invalid: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("malformed record: {0}")]
    Malformed(String),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("sync engine already started")]
    AlreadyStarted,
    #[error("sync engine is not running")]
    NotRunning,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid binding `{input}`: {reason}")]
pub struct BindingParseError {
    pub input: String,
    pub reason: String,
}

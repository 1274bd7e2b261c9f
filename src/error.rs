use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    /// The backing store could not be reached or rejected the operation.
    /// Always propagated to the caller; an enqueue that hits this has NOT
    /// persisted anything.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    JobNotFound(crate::JobId),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::JobState,
        to: crate::JobState,
    },
}

pub type Result<T> = std::result::Result<T, QueueError>;

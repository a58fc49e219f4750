//! Error types for the change log.

/// Errors raised while appending to or reading from the change log.
#[derive(Debug, thiserror::Error)]
pub enum ChangeLogError {
    /// A database operation failed.
    #[error("change log database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A payload could not be serialized.
    #[error("change log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A change was submitted without the image its kind requires.
    #[error("change for {entity_id} has no {image} image")]
    MissingImage {
        entity_id: String,
        image: &'static str,
    },
}

/// A log row that cannot be normalized into a change record.
///
/// Malformed rows are discarded by consumers; they never stall a partition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed change record at partition {partition} position {position}: {reason}")]
pub struct DecodeError {
    pub partition: u32,
    pub position: i64,
    pub reason: String,
}

/// Errors that interrupt one consumer step. The cursor is not advanced.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// Could not check out a pooled connection.
    #[error("failed to get database connection: {0}")]
    Pool(#[from] r2d2::Error),

    /// Reading the partition or committing the cursor failed.
    #[error(transparent)]
    Log(#[from] ChangeLogError),

    /// The handler rejected the batch.
    #[error(transparent)]
    Handler(#[from] crate::consumer::HandlerError),

    /// The blocking step task panicked or was cancelled.
    #[error("consumer step task failed: {0}")]
    Join(String),
}

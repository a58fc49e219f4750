//! Error types for the search projection.

/// Errors raised by the search index and its queries.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// The index could not apply or read; the caller should retry.
    #[error("search index error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to get database connection: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("invalid search query: {0}")]
    InvalidQuery(String),
}

//! Wire shape of a change-log payload.
//!
//! The shape mirrors what log-based capture tools emit: an operation code,
//! optional row images, and a `source` block describing where the change
//! came from.

use serde::{Deserialize, Serialize};

/// Raw change payload as stored in `change_log.payload_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    /// `c`, `u`, `d`, or `r`.
    pub op: String,
    #[serde(default)]
    pub before: Option<serde_json::Value>,
    #[serde(default)]
    pub after: Option<serde_json::Value>,
    pub source: SourceInfo,
}

/// Origin metadata of a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Source table name (`documents` or `signatures`).
    pub table: String,
    pub transaction_id: String,
    /// Position assigned within the partition at append time.
    pub sequence: i64,
    /// Commit time in epoch milliseconds.
    pub ts_ms: i64,
}

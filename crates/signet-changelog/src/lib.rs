//! Change log for the Signet pipeline.
//!
//! Every committed mutation of a document or signature appends exactly one
//! row to the `change_log` table inside the same SQLite transaction as the
//! mutation. Rows are partitioned on a stable hash of the entity id, so all
//! records for one entity share a partition and carry strictly increasing
//! positions within it.
//!
//! Consumers read a partition from their committed cursor, decode each row
//! into a canonical [`ChangeRecord`](signet_types::ChangeRecord), hand the
//! batch to a [`ChangeHandler`], and only then advance the cursor.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`append`] | write side, called by the write coordinator |
//! | [`decode`] | pure payload normalization |
//! | [`spawn_consumer_group`] | one worker task per partition |
//! | [`LogHead`] | wakes idle consumers after a commit |

mod consumer;
mod decode;
mod error;
mod log;
mod payload;

pub use consumer::{
    spawn_consumer_group, ChangeHandler, ConsumerConfig, ConsumerGroupHandle, ConsumerStats,
    ConsumerStatsSnapshot, HandlerError,
};
pub use decode::decode;
pub use error::{ChangeLogError, ConsumeError, DecodeError};
pub use log::{
    append, commit_cursor, load_cursor, partition_for, partition_heads, read_partition,
    rewind_cursor, LogEntry, LogHead, NewChange,
};
pub use payload::{ChangePayload, SourceInfo};

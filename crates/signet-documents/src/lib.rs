//! Documents and signatures for the Signet platform.
//!
//! All mutations go through the [`WriteCoordinator`]: external content is
//! written to the [`ContentStore`] first, then a single SQLite transaction
//! commits the entity row together with exactly one change-log record. A
//! content write failure aborts before anything is committed.
//!
//! Reads (`get_document`, `list_documents`, ...) are plain queries against
//! a pooled connection and never touch the change log.

mod content;
mod coordinator;
mod error;
mod queries;

pub use content::{ContentError, ContentRef, ContentStore, FsContentStore};
pub use coordinator::{
    DocumentPatch, NewDocument, NewSignature, WriteCoordinator, WriteSettings,
};
pub use error::WriteError;
pub use queries::{
    get_document, get_signature, list_documents, list_signatures, list_signatures_for_document,
    DocumentFilter,
};

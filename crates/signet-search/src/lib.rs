//! Search projection for Signet documents.
//!
//! The [`Projector`] consumes decoded document change records and keeps a
//! denormalized [`ProjectionDocument`] per entity id in a [`SearchIndex`].
//! Applying the same record twice leaves the index unchanged: every write
//! is a keyed upsert or a keyed delete.
//!
//! Read-side queries ([`search`], [`suggest`], [`aggregate`]) run against
//! the SQLite-backed index.

mod error;
mod index;
mod projection;
mod projector;
mod query;

pub use error::SearchError;
pub use index::{IndexOp, SearchIndex, SqliteSearchIndex};
pub use projection::ProjectionDocument;
pub use projector::{Projector, ProjectorStats, ProjectorStatsSnapshot};
pub use query::{
    aggregate, search, suggest, AggregationBucket, AggregationField, SearchHit, SearchQuery,
    SearchResults,
};

#[cfg(test)]
mod tests;

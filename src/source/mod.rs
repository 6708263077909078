//! Read-only adapter over the source document database
//!
//! The indexing pipeline never talks to MongoDB directly; it goes through
//! the [`SourceAdapter`] trait so tests can substitute an in-memory source.
//! [`MongoSource`] is the production implementation on the official async
//! driver.

mod client;
mod document;
mod timestamp;

pub use client::MongoSource;
pub use document::{bson_to_json, normalize_document_id, stringify_id};
pub use timestamp::{objectid_after, parse_timestamp};

use async_trait::async_trait;
use bson::Document;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use std::pin::Pin;
use thiserror::Error;

/// Result type for source operations
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Stream of documents from a source cursor
pub type DocumentStream = Pin<Box<dyn Stream<Item = SourceResult<Document>> + Send>>;

/// Errors raised by the source adapter
#[derive(Debug, Error)]
pub enum SourceError {
    /// Connecting or pinging the source failed
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// A query against the source failed
    #[error("Source query failed: {0}")]
    QueryFailed(String),

    /// A timestamp value could not be normalized
    #[error("Unsupported timestamp encoding: {0}")]
    UnsupportedTimestamp(String),

    /// A document is missing its configured id field
    #[error("Document missing field: {0}")]
    MissingField(String),
}

impl From<mongodb::error::Error> for SourceError {
    fn from(err: mongodb::error::Error) -> Self {
        SourceError::QueryFailed(err.to_string())
    }
}

impl From<SourceError> for crate::error::AppError {
    fn from(err: SourceError) -> Self {
        crate::error::AppError::Source(err.to_string())
    }
}

/// Read-only view over the source database
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Iterate every document in a collection, tuned for bulk reads.
    async fn find_all(&self, collection: &str, limit: Option<i64>) -> SourceResult<DocumentStream>;

    /// Iterate documents with `timestamp_field > since`, ascending on that
    /// field. The `"_id"` sentinel orders by the intrinsic identifier and
    /// compares via its embedded creation timestamp.
    async fn find_since(
        &self,
        collection: &str,
        timestamp_field: &str,
        since: DateTime<Utc>,
        limit: Option<i64>,
    ) -> SourceResult<DocumentStream>;

    /// Highest timestamp currently present, or the epoch when empty.
    async fn max_timestamp(
        &self,
        collection: &str,
        timestamp_field: &str,
    ) -> SourceResult<DateTime<Utc>>;

    /// Exact document count.
    async fn count(&self, collection: &str) -> SourceResult<u64>;

    /// Whether any document in the collection contains the named field.
    async fn has_field(&self, collection: &str, field: &str) -> SourceResult<bool>;

    /// Set the field to the current timestamp on every document missing it.
    /// Returns the number of documents updated.
    async fn backfill_field(&self, collection: &str, field: &str) -> SourceResult<u64>;
}

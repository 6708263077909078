//! Full-text search engine facade powered by tantivy
//!
//! A logical index is backed by one or more physical shards, each its own
//! tantivy index directory. Writes route documents to shards by FNV-1a of
//! the document id; reads on sharded indexes scatter-gather across every
//! shard and merge by score. Atlas-style queries (`compound`, `text`,
//! `term`, `wildcard`, `match_all`) are lifted into a typed tree at the
//! boundary and compiled into tantivy queries per shard.

mod engine;
mod error;
mod mapping;
mod query;
mod shard;

pub use engine::{fnv1a_32, route_to_shard, IndexInfo, SearchEngine};
pub use error::{SearchError, SearchResult};
pub use mapping::{IndexSchema, MappedField, DYNAMIC_FIELD};
pub use query::{
    FacetBucket, FacetRequest, FacetResult, HighlightRequest, QuerySpec, SearchHit, SearchRequest,
    SearchResponse,
};
pub use shard::{DocumentBatch, ShardIndex};

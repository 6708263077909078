//! Self-hosted full-text search with an Atlas Search compatible API
//!
//! The service mirrors externally administered MongoDB collections into
//! tantivy indexes and answers Atlas-style search queries over HTTP. Three
//! subsystems cooperate: the indexing pipeline (bootstrap plus timestamp
//! polling with crash-safe cursors), the search engine facade (sharded
//! index lifecycle and scatter-gather reads), and the cluster coordinator
//! (raft-replicated shard placement with consistent-hash routing).

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod indexer;
pub mod router;
pub mod search;
pub mod source;
pub mod syncstate;

pub use config::Config;
pub use error::{AppError, Result};

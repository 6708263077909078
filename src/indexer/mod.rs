//! Indexing pipeline: initial bootstrap plus near-real-time polling
//!
//! Each configured index runs a pair of cooperating tasks: a one-shot
//! initial indexer that ingests every document present in the source, and a
//! poller that ingests documents newer than the persisted high-water mark.
//! Progress is checkpointed through the sync-state store so a restart
//! resumes where the previous run stopped.

mod service;

pub use service::{init_timestamp_fields, IndexerService};

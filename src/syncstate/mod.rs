//! Crash-safe manifest of per-collection polling cursors
//!
//! Every collection the pipeline mirrors has a [`CollectionSyncState`]
//! checkpoint: the high-water mark of observed documents, counters and the
//! current sync status. The manifest is one JSON document persisted with a
//! temp-file-and-rename so a torn write never leaves a corrupt file behind.

mod manager;

pub use manager::{CollectionSyncState, SyncStateManager, SyncStatus};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{AppError, Result};

/// Sync status of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    InProgress,
}

/// Checkpoint for a single mirrored collection
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSyncState {
    /// High-water mark: documents up to here are durably indexed
    #[serde(default)]
    pub last_poll_time: Option<DateTime<Utc>>,

    /// Wall-clock of the most recent poll completion
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub index_name: String,

    #[serde(default)]
    pub collection_key: String,

    #[serde(default)]
    pub timestamp_field: String,

    #[serde(default)]
    pub id_field: String,

    #[serde(default)]
    pub documents_indexed: u64,

    /// Best-effort snapshot count of the source collection
    #[serde(default)]
    pub total_documents: Option<u64>,

    #[serde(default)]
    pub sync_status: SyncStatus,

    /// "NN%", "100%" or "not_available"
    #[serde(default)]
    pub progress: String,
}

/// On-disk manifest shape
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    collections: HashMap<String, CollectionSyncState>,

    #[serde(default)]
    last_saved: Option<DateTime<Utc>>,
}

/// Owns the sync-state manifest and serializes all mutations
pub struct SyncStateManager {
    file_path: PathBuf,
    state: RwLock<Manifest>,
}

impl SyncStateManager {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            state: RwLock::new(Manifest::default()),
        }
    }

    /// Load the manifest from disk. A missing file is a cold start, not an error.
    pub fn load(&self) -> Result<()> {
        if !self.file_path.exists() {
            tracing::info!(path = %self.file_path.display(), "Sync state file not found, starting fresh");
            return Ok(());
        }

        let data = std::fs::read(&self.file_path)?;
        let manifest: Manifest = serde_json::from_slice(&data).map_err(|e| {
            AppError::Serialization(format!("failed to parse sync state file: {}", e))
        })?;

        tracing::info!(
            collections = manifest.collections.len(),
            path = %self.file_path.display(),
            "Loaded sync state"
        );

        *self.state.write() = manifest;
        Ok(())
    }

    /// Persist the manifest: write a sibling temp file, then rename atomically.
    pub fn save(&self) -> Result<()> {
        let data = {
            let mut state = self.state.write();
            state.last_saved = Some(Utc::now());
            serde_json::to_vec_pretty(&*state)?
        };

        let temp_path = self.file_path.with_extension("json.tmp");
        std::fs::write(&temp_path, &data)?;
        std::fs::rename(&temp_path, &self.file_path)?;

        Ok(())
    }

    /// Snapshot of one collection's state
    pub fn get(&self, collection_key: &str) -> Option<CollectionSyncState> {
        self.state.read().collections.get(collection_key).cloned()
    }

    /// Replace a collection's state wholesale
    pub fn update(&self, collection_key: &str, state: CollectionSyncState) {
        self.state
            .write()
            .collections
            .insert(collection_key.to_string(), state);
    }

    /// Remove a collection's state
    pub fn remove(&self, collection_key: &str) {
        self.state.write().collections.remove(collection_key);
    }

    /// Deep copy of every collection state
    pub fn snapshot_all(&self) -> HashMap<String, CollectionSyncState> {
        self.state.read().collections.clone()
    }

    pub fn set_last_poll_time(&self, collection_key: &str, t: DateTime<Utc>) {
        let mut state = self.state.write();
        let entry = entry_for(&mut state, collection_key);
        entry.last_poll_time = Some(t);
    }

    pub fn set_last_sync_time(&self, collection_key: &str, t: DateTime<Utc>) {
        let mut state = self.state.write();
        let entry = entry_for(&mut state, collection_key);
        entry.last_sync_time = Some(t);
    }

    pub fn set_sync_status(&self, collection_key: &str, status: SyncStatus) {
        let mut state = self.state.write();
        let entry = entry_for(&mut state, collection_key);
        entry.sync_status = status;
    }

    pub fn set_progress(&self, collection_key: &str, progress: &str) {
        let mut state = self.state.write();
        let entry = entry_for(&mut state, collection_key);
        entry.progress = progress.to_string();
    }

    pub fn set_total_documents(&self, collection_key: &str, total: u64) {
        let mut state = self.state.write();
        let entry = entry_for(&mut state, collection_key);
        entry.total_documents = Some(total);
        recompute_progress(entry);
    }

    pub fn increment_documents_indexed(&self, collection_key: &str, n: u64) {
        let mut state = self.state.write();
        let entry = entry_for(&mut state, collection_key);
        entry.documents_indexed += n;
        recompute_progress(entry);
    }

    /// Periodic saver: persists every `interval`, and once more on stop.
    pub async fn run_periodic_save(&self, interval: Duration, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.save() {
                        tracing::warn!(error = %e, "Failed to save sync state, retaining in-memory state");
                    }
                }
                _ = stop.changed() => {
                    if let Err(e) = self.save() {
                        tracing::warn!(error = %e, "Failed to save sync state on shutdown");
                    }
                    return;
                }
            }
        }
    }
}

fn entry_for<'a>(manifest: &'a mut Manifest, collection_key: &str) -> &'a mut CollectionSyncState {
    manifest
        .collections
        .entry(collection_key.to_string())
        .or_insert_with(|| CollectionSyncState {
            collection_key: collection_key.to_string(),
            ..Default::default()
        })
}

/// Recompute the progress string from the counters.
fn recompute_progress(entry: &mut CollectionSyncState) {
    match entry.total_documents {
        Some(total) if total > 0 => {
            let pct = (entry.documents_indexed * 100 / total).min(100);
            entry.progress = format!("{}%", pct);
        }
        Some(_) => entry.progress = "100%".to_string(),
        None => entry.progress = "not_available".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager_in(dir: &TempDir) -> SyncStateManager {
        SyncStateManager::new(dir.path().join("sync_state.json"))
    }

    #[test]
    fn test_load_missing_file_is_cold_start() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        assert!(manager.load().is_ok());
        assert!(manager.snapshot_all().is_empty());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);

        let now = Utc::now();
        manager.set_last_poll_time("app.products", now);
        manager.set_total_documents("app.products", 10);
        manager.increment_documents_indexed("app.products", 5);
        manager.save().unwrap();

        let reloaded = manager_in(&dir);
        reloaded.load().unwrap();
        let state = reloaded.get("app.products").unwrap();
        assert_eq!(state.last_poll_time.unwrap().timestamp(), now.timestamp());
        assert_eq!(state.documents_indexed, 5);
        assert_eq!(state.progress, "50%");
    }

    #[test]
    fn test_targeted_updates_create_entry() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);

        manager.set_sync_status("app.orders", SyncStatus::InProgress);
        let state = manager.get("app.orders").unwrap();
        assert_eq!(state.sync_status, SyncStatus::InProgress);
        assert_eq!(state.collection_key, "app.orders");
    }

    #[test]
    fn test_progress_not_available_without_total() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);

        manager.increment_documents_indexed("app.products", 3);
        assert_eq!(manager.get("app.products").unwrap().progress, "not_available");
    }

    #[test]
    fn test_progress_clamped_to_100() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);

        manager.set_total_documents("app.products", 4);
        manager.increment_documents_indexed("app.products", 9);
        assert_eq!(manager.get("app.products").unwrap().progress, "100%");
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        manager.set_last_sync_time("app.products", Utc::now());
        manager.save().unwrap();

        assert!(dir.path().join("sync_state.json").exists());
        assert!(!dir.path().join("sync_state.json.tmp").exists());
    }

    #[test]
    fn test_snapshot_is_deep_copy() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        manager.increment_documents_indexed("app.products", 1);

        let mut snapshot = manager.snapshot_all();
        snapshot.get_mut("app.products").unwrap().documents_indexed = 99;
        assert_eq!(manager.get("app.products").unwrap().documents_indexed, 1);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        manager.increment_documents_indexed("app.products", 1);
        manager.remove("app.products");
        assert!(manager.get("app.products").is_none());
    }
}

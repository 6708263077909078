use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{Config, IndexConfig};
use crate::error::{AppError, Result};
use crate::search::{route_to_shard, DocumentBatch, SearchEngine};
use crate::source::{bson_to_json, normalize_document_id, parse_timestamp, SourceAdapter};
use crate::syncstate::{CollectionSyncState, SyncStateManager, SyncStatus};

/// Interval of the background sync-state saver
const SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Orchestrates the source adapter, the engine and the sync-state store
pub struct IndexerService {
    source: Arc<dyn SourceAdapter>,
    engine: Arc<SearchEngine>,
    config: Arc<Config>,
    sync_state: Arc<SyncStateManager>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IndexerService {
    /// Create the service: load sync state, create engine indexes, validate
    /// timestamp fields, then sweep shards dropped from configuration.
    pub async fn new(
        source: Arc<dyn SourceAdapter>,
        engine: Arc<SearchEngine>,
        config: Arc<Config>,
    ) -> Result<Self> {
        let sync_state = Arc::new(SyncStateManager::new(&config.search.sync_state_path));
        sync_state.load()?;

        for index in &config.indexes {
            engine.create_index(index).await?;
        }

        validate_timestamp_fields(source.as_ref(), &config).await?;

        engine.cleanup(&config.indexes).await?;

        let (stop, _) = watch::channel(false);

        Ok(Self {
            source,
            engine,
            config,
            sync_state,
            stop,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Launch the per-index task pairs, the state saver and the flush loop.
    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting indexer service");

        let saver = self.sync_state.clone();
        let stop_rx = self.stop.subscribe();
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(async move {
            saver.run_periodic_save(SAVE_INTERVAL, stop_rx).await;
        }));

        for index in &self.config.indexes {
            let service = self.clone();
            let cfg = index.clone();
            tasks.push(tokio::spawn(async move {
                service.run_initial_indexing(cfg).await;
            }));

            let service = self.clone();
            let cfg = index.clone();
            tasks.push(tokio::spawn(async move {
                service.run_poll_loop(cfg).await;
            }));
        }

        let service = self.clone();
        tasks.push(tokio::spawn(async move {
            service.run_flush_loop().await;
        }));
    }

    /// Signal every task to finish its current item, wait for them, then
    /// persist the sync state one last time.
    pub async fn stop(&self) {
        tracing::info!("Stopping indexer service");
        let _ = self.stop.send(true);

        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        match self.sync_state.save() {
            Ok(()) => tracing::info!("Sync state saved"),
            Err(e) => tracing::warn!(error = %e, "Failed to save sync state during shutdown"),
        }

        tracing::info!("Indexer service stopped");
    }

    /// Snapshot of every collection's sync state
    pub fn sync_states(&self) -> HashMap<String, CollectionSyncState> {
        self.sync_state.snapshot_all()
    }

    fn stopping(&self) -> bool {
        *self.stop.subscribe().borrow()
    }

    /// One-shot ingestion of every document currently in the source.
    async fn run_initial_indexing(&self, cfg: IndexConfig) {
        let collection_key = cfg.collection_key(&self.config.mongodb.database);
        tracing::info!(collection = %collection_key, index = %cfg.name, "Starting initial indexing");

        self.sync_state
            .set_sync_status(&collection_key, SyncStatus::InProgress);
        self.sync_state.set_progress(&collection_key, "0%");

        match self.source.count(&cfg.collection).await {
            Ok(total) => self.sync_state.set_total_documents(&collection_key, total),
            Err(e) => {
                tracing::warn!(collection = %collection_key, error = %e, "Failed to count documents");
                self.sync_state.set_progress(&collection_key, "not_available");
            }
        }

        let mut stream = match self.source.find_all(&cfg.collection, None).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(collection = %collection_key, error = %e, "Failed to open initial cursor");
                self.sync_state
                    .set_sync_status(&collection_key, SyncStatus::Idle);
                return;
            }
        };

        let batch_size = self.config.search.batch_size;
        let mut batch: Vec<DocumentBatch> = Vec::with_capacity(batch_size);
        let mut count: u64 = 0;

        while let Some(item) = stream.next().await {
            if self.stopping() {
                return;
            }

            let mut doc = match item {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(collection = %collection_key, error = %e, "Failed to read document");
                    continue;
                }
            };

            let id = match normalize_document_id(&mut doc, &cfg.id_field) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(collection = %collection_key, error = %e, "Skipping unroutable document");
                    continue;
                }
            };

            batch.push(DocumentBatch {
                id,
                fields: bson_to_json(&doc),
            });

            if batch.len() >= batch_size {
                let written = batch.len() as u64;
                self.write_batch(&cfg, std::mem::take(&mut batch)).await;
                count += written;
                self.sync_state
                    .increment_documents_indexed(&collection_key, written);
            }
        }

        if !batch.is_empty() {
            let written = batch.len() as u64;
            self.write_batch(&cfg, batch).await;
            count += written;
            self.sync_state
                .increment_documents_indexed(&collection_key, written);
        }

        tracing::info!(
            collection = %collection_key,
            documents = count,
            "Initial indexing completed"
        );

        self.sync_state
            .set_sync_status(&collection_key, SyncStatus::Idle);
        self.sync_state.set_progress(&collection_key, "100%");

        let now = Utc::now();
        self.sync_state.set_last_sync_time(&collection_key, now);
        self.engine.update_last_sync(&cfg.name, now);
    }

    /// Steady-state polling at the configured interval.
    async fn run_poll_loop(&self, cfg: IndexConfig) {
        let collection_key = cfg.collection_key(&self.config.mongodb.database);

        match self.sync_state.get(&collection_key) {
            Some(CollectionSyncState {
                last_poll_time: Some(resume_from),
                ..
            }) => {
                tracing::info!(
                    collection = %collection_key,
                    "Restored collection state, resuming from {}",
                    resume_from.to_rfc3339()
                );
            }
            _ => {
                let start_from = match self
                    .source
                    .max_timestamp(&cfg.collection, &cfg.timestamp_field)
                    .await
                {
                    Ok(ts) => ts,
                    Err(e) => {
                        tracing::warn!(
                            collection = %collection_key,
                            error = %e,
                            "Failed to read newest source timestamp, starting from now"
                        );
                        Utc::now()
                    }
                };

                self.sync_state.update(
                    &collection_key,
                    CollectionSyncState {
                        last_poll_time: Some(start_from),
                        index_name: cfg.name.clone(),
                        collection_key: collection_key.clone(),
                        timestamp_field: cfg.timestamp_field.clone(),
                        id_field: cfg.id_field.clone(),
                        ..Default::default()
                    },
                );
                tracing::info!(
                    collection = %collection_key,
                    "Initialized collection state, starting from {}",
                    start_from.to_rfc3339()
                );
            }
        }

        let interval = cfg.effective_poll_interval(self.config.search.flush_interval);
        let mut ticker = tokio::time::interval(Duration::from_secs(interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stop_rx = self.stop.subscribe();

        tracing::info!(
            collection = %collection_key,
            interval_secs = interval,
            "Polling for changes"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.perform_poll(&cfg, &collection_key).await;
                }
                _ = stop_rx.changed() => {
                    return;
                }
            }
        }
    }

    /// One polling tick: read documents past the high-water mark, index
    /// them, and only then advance the mark.
    async fn perform_poll(&self, cfg: &IndexConfig, collection_key: &str) {
        let Some(state) = self.sync_state.get(collection_key) else {
            tracing::warn!(collection = %collection_key, "No collection state, skipping poll");
            return;
        };

        let last_poll = state
            .last_poll_time
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap_or_default());

        let mut stream = match self
            .source
            .find_since(
                &cfg.collection,
                &cfg.timestamp_field,
                last_poll,
                Some(self.config.search.batch_size as i64),
            )
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(collection = %collection_key, error = %e, "Poll failed, will retry next tick");
                return;
            }
        };

        let batch_size = self.config.search.batch_size;
        let mut batch: Vec<DocumentBatch> = Vec::with_capacity(batch_size);
        let mut newest_observed = last_poll;
        let mut count: u64 = 0;

        while let Some(item) = stream.next().await {
            if self.stopping() {
                return;
            }

            let mut doc = match item {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(collection = %collection_key, error = %e, "Failed to read document");
                    continue;
                }
            };

            match observe_timestamp(&doc, &cfg.timestamp_field) {
                Ok(ts) => {
                    if ts > newest_observed {
                        newest_observed = ts;
                    }
                }
                Err(e) => {
                    // The mark must not advance past this document; stop the
                    // tick here so it is retried until the source is fixed.
                    tracing::warn!(
                        collection = %collection_key,
                        error = %e,
                        "Document has unreadable timestamp; halting this poll tick"
                    );
                    break;
                }
            }

            let id = match normalize_document_id(&mut doc, &cfg.id_field) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(collection = %collection_key, error = %e, "Skipping unroutable document");
                    continue;
                }
            };

            batch.push(DocumentBatch {
                id,
                fields: bson_to_json(&doc),
            });
            count += 1;

            if batch.len() >= batch_size {
                self.write_batch(cfg, std::mem::take(&mut batch)).await;
            }
        }

        if !batch.is_empty() {
            self.write_batch(cfg, batch).await;
        }

        if count > 0 {
            self.sync_state
                .set_last_poll_time(collection_key, newest_observed);
            self.sync_state
                .increment_documents_indexed(collection_key, count);
            tracing::info!(
                collection = %collection_key,
                documents = count,
                timestamp_field = %cfg.timestamp_field,
                "Polled new documents"
            );
        }

        let now = Utc::now();
        self.sync_state.set_last_sync_time(collection_key, now);
        self.engine.update_last_sync(&cfg.name, now);
    }

    /// Write a batch, bulk per shard or document by document.
    async fn write_batch(&self, cfg: &IndexConfig, batch: Vec<DocumentBatch>) {
        if self.config.search.bulk_indexing {
            self.write_batch_bulk(cfg, batch).await;
        } else {
            self.write_batch_individual(cfg, batch).await;
        }
    }

    /// Group by physical shard and issue one batched write per shard. A
    /// failed shard batch falls back to per-document writes so one bad
    /// document does not drop the rest.
    async fn write_batch_bulk(&self, cfg: &IndexConfig, batch: Vec<DocumentBatch>) {
        let mut by_shard: HashMap<String, Vec<DocumentBatch>> = HashMap::new();
        for doc in batch {
            let shard = route_to_shard(&cfg.name, &doc.id, cfg.distribution.shards);
            by_shard.entry(shard).or_default().push(doc);
        }

        for (shard, docs) in by_shard {
            if let Err(e) = self.engine.index_documents(&shard, &docs).await {
                tracing::warn!(
                    shard = %shard,
                    documents = docs.len(),
                    error = %e,
                    "Bulk write failed, falling back to per-document writes"
                );
                self.write_batch_individual(cfg, docs).await;
            }
        }
    }

    async fn write_batch_individual(&self, cfg: &IndexConfig, batch: Vec<DocumentBatch>) {
        for doc in batch {
            if let Err(e) = self
                .engine
                .index_document(&cfg.name, &doc.id, doc.fields)
                .await
            {
                tracing::warn!(id = %doc.id, error = %e, "Failed to index document, skipping");
            }
        }
    }

    /// Periodic engine flush at the configured interval. The backing engine
    /// commits on write already; this provides explicit sync points.
    async fn run_flush_loop(&self) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.search.flush_interval.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stop_rx = self.stop.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.engine.flush_all().await {
                        tracing::warn!(error = %e, "Periodic flush failed");
                    } else {
                        tracing::debug!("Periodic flush completed");
                    }
                }
                _ = stop_rx.changed() => {
                    return;
                }
            }
        }
    }
}

/// Read the poll-ordering timestamp off a document.
fn observe_timestamp(
    doc: &bson::Document,
    timestamp_field: &str,
) -> std::result::Result<DateTime<Utc>, crate::source::SourceError> {
    if timestamp_field.is_empty() || timestamp_field == "_id" {
        match doc.get("_id") {
            Some(bson::Bson::ObjectId(oid)) => Ok(oid.timestamp().to_chrono()),
            Some(other) => Err(crate::source::SourceError::UnsupportedTimestamp(format!(
                "_id carries no timestamp: {:?}",
                other.element_type()
            ))),
            None => Err(crate::source::SourceError::MissingField("_id".to_string())),
        }
    } else {
        let value = doc
            .get(timestamp_field)
            .ok_or_else(|| crate::source::SourceError::MissingField(timestamp_field.to_string()))?;
        parse_timestamp(value)
    }
}

/// Fail fast when a configured timestamp field does not exist in its
/// collection; the backfill is an explicit operator action.
async fn validate_timestamp_fields(source: &dyn SourceAdapter, config: &Config) -> Result<()> {
    for index in &config.indexes {
        if index.timestamp_field.is_empty() || index.timestamp_field == "_id" {
            continue;
        }

        let exists = source
            .has_field(&index.collection, &index.timestamp_field)
            .await
            .map_err(AppError::from)?;

        if !exists {
            return Err(AppError::Configuration(format!(
                "timestamp field '{}' not found in collection '{}'; run `open-atlas-search init-timestamps` to backfill it, or set timestamp_field: \"_id\"",
                index.timestamp_field, index.collection
            )));
        }
    }

    Ok(())
}

/// Backfill missing timestamp fields across every configured index. Used by
/// the `init-timestamps` subcommand.
pub async fn init_timestamp_fields(source: &dyn SourceAdapter, config: &Config) -> Result<u64> {
    let mut updated = 0;

    for index in &config.indexes {
        if index.timestamp_field.is_empty() || index.timestamp_field == "_id" {
            continue;
        }

        let exists = source
            .has_field(&index.collection, &index.timestamp_field)
            .await
            .map_err(AppError::from)?;

        if !exists {
            let modified = source
                .backfill_field(&index.collection, &index.timestamp_field)
                .await
                .map_err(AppError::from)?;
            tracing::info!(
                collection = %index.collection,
                field = %index.timestamp_field,
                documents = modified,
                "Backfilled timestamp field"
            );
            updated += modified;
        }
    }

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_observe_timestamp_from_intrinsic_id() {
        let oid = bson::oid::ObjectId::new();
        let doc = doc! { "_id": oid };
        let observed = observe_timestamp(&doc, "_id").unwrap();
        assert_eq!(observed.timestamp(), oid.timestamp().to_chrono().timestamp());
    }

    #[test]
    fn test_observe_timestamp_from_custom_field() {
        let now = Utc::now();
        let doc = doc! { "_id": "a", "updated_at": bson::DateTime::from_chrono(now) };
        let observed = observe_timestamp(&doc, "updated_at").unwrap();
        assert_eq!(observed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_observe_timestamp_rejects_missing_field() {
        let doc = doc! { "_id": "a" };
        assert!(observe_timestamp(&doc, "updated_at").is_err());
    }

    #[test]
    fn test_observe_timestamp_rejects_non_objectid_intrinsic() {
        let doc = doc! { "_id": "plain-string" };
        assert!(observe_timestamp(&doc, "_id").is_err());
    }
}

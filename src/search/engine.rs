//! Per-node index manager: shard lifecycle, routed writes, scatter-gather reads

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::{IndexConfig, SearchSettings};
use crate::search::error::{SearchError, SearchResult};
use crate::search::mapping::IndexSchema;
use crate::search::query::{SearchRequest, SearchResponse};
use crate::search::shard::{DocumentBatch, ShardIndex};

/// Information about one physical shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,

    #[serde(rename = "docCount")]
    pub doc_count: u64,

    pub status: String,

    #[serde(rename = "lastSync", default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,

    #[serde(rename = "sync_progress", default, skip_serializing_if = "Option::is_none")]
    pub sync_progress: Option<String>,
}

/// Manages every shard index hosted on this node.
///
/// The shard map is guarded by one reader-writer lock; sync-time tracking
/// uses an independent lock so pollers publishing sync times never contend
/// with searches resolving shards.
pub struct SearchEngine {
    index_path: PathBuf,
    writer_heap: usize,
    shards: RwLock<HashMap<String, Arc<ShardIndex>>>,
    configs: RwLock<HashMap<String, IndexConfig>>,
    last_sync: parking_lot::RwLock<HashMap<String, DateTime<Utc>>>,
}

impl SearchEngine {
    pub fn new(settings: &SearchSettings) -> SearchResult<Self> {
        std::fs::create_dir_all(&settings.index_path).map_err(|e| {
            SearchError::IndexInitFailed(format!("failed to create index directory: {}", e))
        })?;

        Ok(Self {
            index_path: settings.index_path.clone(),
            writer_heap: settings.index_buffer_size,
            shards: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            last_sync: parking_lot::RwLock::new(HashMap::new()),
        })
    }

    /// Create or open every shard of an index. Idempotent.
    pub async fn create_index(&self, cfg: &IndexConfig) -> SearchResult<()> {
        let index_schema = IndexSchema::build(&cfg.definition.mappings)?;

        let mut shards = self.shards.write().await;
        for shard_name in cfg.shard_names() {
            if shards.contains_key(&shard_name) {
                continue;
            }

            let shard = ShardIndex::open_or_create(
                &self.index_path,
                &shard_name,
                index_schema.clone(),
                self.writer_heap,
            )?;
            shards.insert(shard_name, Arc::new(shard));
        }
        drop(shards);

        self.configs
            .write()
            .await
            .insert(cfg.name.clone(), cfg.clone());

        Ok(())
    }

    /// Close and delete every shard of an index, plus its sync tracking.
    pub async fn remove_index(&self, name: &str) -> SearchResult<()> {
        let shard_names = {
            let configs = self.configs.read().await;
            match configs.get(name) {
                Some(cfg) => cfg.shard_names(),
                None => vec![name.to_string()],
            }
        };

        let mut shards = self.shards.write().await;
        let mut removed = false;
        for shard_name in &shard_names {
            if shards.remove(shard_name).is_some() {
                removed = true;
            }

            let shard_path = self.index_path.join(shard_name);
            if shard_path.exists() {
                std::fs::remove_dir_all(&shard_path)?;
                removed = true;
            }
        }
        drop(shards);

        if !removed {
            return Err(SearchError::IndexNotFound(name.to_string()));
        }

        self.configs.write().await.remove(name);
        self.last_sync.write().remove(name);

        Ok(())
    }

    /// Startup sweep: destroy every on-disk shard directory that no
    /// configured index references.
    pub async fn cleanup(&self, configured: &[IndexConfig]) -> SearchResult<()> {
        let expected: HashSet<String> = configured
            .iter()
            .flat_map(|cfg| cfg.shard_names())
            .collect();

        let entries = std::fs::read_dir(&self.index_path)?;
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if expected.contains(&name) {
                continue;
            }

            tracing::info!(shard = %name, "Removing shard not present in configuration");
            self.shards.write().await.remove(&name);
            self.last_sync.write().remove(&name);
            std::fs::remove_dir_all(entry.path())?;
        }

        Ok(())
    }

    /// Per-shard infos. Names here are physical; callers aggregate logical views.
    pub async fn list_indexes(&self) -> Vec<IndexInfo> {
        let shards = self.shards.read().await;
        let last_sync = self.last_sync.read().clone();

        let mut infos: Vec<IndexInfo> = shards
            .values()
            .map(|shard| IndexInfo {
                name: shard.name().to_string(),
                doc_count: shard.doc_count(),
                status: "active".to_string(),
                last_sync: last_sync.get(shard.name()).copied(),
                sync_progress: None,
            })
            .collect();

        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Whether a logical index is configured on this node
    pub async fn has_index(&self, name: &str) -> bool {
        self.configs.read().await.contains_key(name)
    }

    /// Configuration of a logical index
    pub async fn index_config(&self, name: &str) -> Option<IndexConfig> {
        self.configs.read().await.get(name).cloned()
    }

    /// Route a document id to its physical shard name.
    pub async fn shard_for_document(&self, index_name: &str, doc_id: &str) -> String {
        let configs = self.configs.read().await;
        let shard_count = configs
            .get(index_name)
            .map(|cfg| cfg.distribution.shards)
            .unwrap_or(1);
        drop(configs);

        route_to_shard(index_name, doc_id, shard_count)
    }

    /// Index one document, routed to its shard. Durable on return.
    pub async fn index_document(
        &self,
        index_name: &str,
        doc_id: &str,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> SearchResult<()> {
        let shard_name = self.shard_for_document(index_name, doc_id).await;
        let shard = self.shard(&shard_name).await?;

        shard
            .index_documents(&[DocumentBatch {
                id: doc_id.to_string(),
                fields,
            }])
            .await?;
        Ok(())
    }

    /// Batched write to a single physical shard. The caller has already done
    /// the shard routing.
    pub async fn index_documents(
        &self,
        shard_name: &str,
        docs: &[DocumentBatch],
    ) -> SearchResult<usize> {
        let shard = self.shard(shard_name).await?;
        shard.index_documents(docs).await.map_err(|e| match e {
            SearchError::IndexingFailed(message) => SearchError::BulkWriteFailed {
                shard: shard_name.to_string(),
                message,
            },
            other => other,
        })
    }

    /// Shard-routed delete. Durable on return.
    pub async fn delete_document(&self, index_name: &str, doc_id: &str) -> SearchResult<()> {
        let shard_name = self.shard_for_document(index_name, doc_id).await;
        let shard = self.shard(&shard_name).await?;
        shard.delete_document(doc_id).await
    }

    /// Execute a search against a logical index, scatter-gathering across
    /// shards when the index is sharded.
    pub async fn search(&self, request: &SearchRequest) -> SearchResult<SearchResponse> {
        let cfg = self
            .index_config(&request.index)
            .await
            .ok_or_else(|| SearchError::IndexNotFound(request.index.clone()))?;

        if cfg.distribution.shards <= 1 {
            let shard = self.shard(&cfg.name).await?;
            return shard.search(request);
        }

        self.search_sharded(request, &cfg).await
    }

    /// Fan the request out to every shard, merge by descending score, then
    /// apply the page window. Failed shards are dropped from the merge and
    /// reported on the response.
    async fn search_sharded(
        &self,
        request: &SearchRequest,
        cfg: &IndexConfig,
    ) -> SearchResult<SearchResponse> {
        let size = if request.size == 0 { 10 } else { request.size };

        // Each shard returns enough hits to fill the window from offset zero.
        let mut shard_request = request.clone();
        shard_request.from = 0;
        shard_request.size = request.from + size;

        let shard_names = cfg.shard_names();
        let mut shard_handles = Vec::with_capacity(shard_names.len());
        for shard_name in &shard_names {
            shard_handles.push(self.shard(shard_name).await?);
        }

        let searches = shard_handles.iter().map(|shard| {
            let shard = Arc::clone(shard);
            let request = shard_request.clone();
            async move { (shard.name().to_string(), shard.search(&request)) }
        });

        let mut hits = Vec::new();
        let mut total = 0u64;
        let mut max_score: f32 = 0.0;
        let mut merged_facets: HashMap<String, HashMap<String, u64>> = HashMap::new();
        let mut failed_shards = Vec::new();

        for (shard_name, result) in join_all(searches).await {
            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(shard = %shard_name, error = %e, "Shard search failed, dropping its contribution");
                    failed_shards.push(shard_name);
                    continue;
                }
            };

            total += response.total;
            if response.max_score > max_score {
                max_score = response.max_score;
            }
            hits.extend(response.hits);

            if let Some(facets) = response.facets {
                for (name, facet) in facets {
                    let buckets = merged_facets.entry(name).or_default();
                    for bucket in facet.buckets {
                        *buckets.entry(bucket.key).or_insert(0) += bucket.count;
                    }
                }
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        let window: Vec<_> = hits
            .into_iter()
            .skip(request.from)
            .take(size)
            .collect();

        let facets = if merged_facets.is_empty() {
            None
        } else {
            Some(
                merged_facets
                    .into_iter()
                    .map(|(name, buckets)| {
                        let mut buckets: Vec<crate::search::query::FacetBucket> = buckets
                            .into_iter()
                            .map(|(key, count)| crate::search::query::FacetBucket { key, count })
                            .collect();
                        buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
                        (name, crate::search::query::FacetResult { buckets })
                    })
                    .collect(),
            )
        };

        Ok(SearchResponse {
            hits: window,
            total,
            facets,
            max_score,
            partial: !failed_shards.is_empty(),
            failed_shards,
        })
    }

    /// Publish the moment an index last synced from its source
    pub fn update_last_sync(&self, index_name: &str, sync_time: DateTime<Utc>) {
        self.last_sync
            .write()
            .insert(index_name.to_string(), sync_time);
    }

    pub fn last_sync(&self, index_name: &str) -> Option<DateTime<Utc>> {
        self.last_sync.read().get(index_name).copied()
    }

    /// Total documents across every shard of a logical index
    pub async fn doc_count(&self, index_name: &str) -> SearchResult<u64> {
        let cfg = self
            .index_config(index_name)
            .await
            .ok_or_else(|| SearchError::IndexNotFound(index_name.to_string()))?;

        let mut count = 0;
        for shard_name in cfg.shard_names() {
            count += self.shard(&shard_name).await?.doc_count();
        }
        Ok(count)
    }

    /// Commit buffered writes on every shard
    pub async fn flush_all(&self) -> SearchResult<()> {
        let shards: Vec<Arc<ShardIndex>> = self.shards.read().await.values().cloned().collect();
        for shard in shards {
            shard.flush().await?;
        }
        Ok(())
    }

    /// Flush and drop every shard
    pub async fn close(&self) -> SearchResult<()> {
        self.flush_all().await?;
        self.shards.write().await.clear();
        Ok(())
    }

    async fn shard(&self, shard_name: &str) -> SearchResult<Arc<ShardIndex>> {
        self.shards
            .read()
            .await
            .get(shard_name)
            .cloned()
            .ok_or_else(|| SearchError::IndexNotFound(shard_name.to_string()))
    }
}

/// FNV-1a 32-bit hash, the shard routing function
pub fn fnv1a_32(data: &str) -> u32 {
    const OFFSET: u32 = 2_166_136_261;
    const PRIME: u32 = 16_777_619;

    let mut hash = OFFSET;
    for byte in data.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Deterministic shard routing: FNV-1a of the id, modulo shard count
pub fn route_to_shard(index_name: &str, doc_id: &str, shard_count: u32) -> String {
    if shard_count <= 1 {
        return index_name.to_string();
    }
    let shard = fnv1a_32(doc_id) % shard_count;
    format!("{}_shard_{}", index_name, shard)
}

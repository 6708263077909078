//! Shared test fixtures: an in-memory source adapter and config builders

use async_trait::async_trait;
use bson::{Bson, Document};
use chrono::{DateTime, TimeZone, Utc};
use futures::stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use open_atlas_search::config::{
    ClusterConfig, Config, Distribution, FieldMapping, IndexConfig, IndexDefinition,
    IndexMappings, MongoConfig, SearchSettings, ServerConfig,
};
use open_atlas_search::source::{
    parse_timestamp, DocumentStream, SourceAdapter, SourceError, SourceResult,
};

/// In-memory source standing in for the document database
#[derive(Default)]
pub struct MemorySource {
    collections: Mutex<HashMap<String, Vec<Document>>>,
}

impl MemorySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, collection: &str, doc: Document) {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push(doc);
    }

    fn docs(&self, collection: &str) -> Vec<Document> {
        self.collections
            .lock()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    fn timestamp_of(doc: &Document, field: &str) -> Option<DateTime<Utc>> {
        if field.is_empty() || field == "_id" {
            match doc.get("_id") {
                Some(Bson::ObjectId(oid)) => Some(oid.timestamp().to_chrono()),
                _ => None,
            }
        } else {
            doc.get(field).and_then(|v| parse_timestamp(v).ok())
        }
    }
}

#[async_trait]
impl SourceAdapter for MemorySource {
    async fn find_all(&self, collection: &str, limit: Option<i64>) -> SourceResult<DocumentStream> {
        let mut docs = self.docs(collection);
        if let Some(limit) = limit {
            docs.truncate(limit as usize);
        }

        Ok(Box::pin(stream::iter(docs.into_iter().map(Ok))))
    }

    async fn find_since(
        &self,
        collection: &str,
        timestamp_field: &str,
        since: DateTime<Utc>,
        limit: Option<i64>,
    ) -> SourceResult<DocumentStream> {
        let mut docs: Vec<(DateTime<Utc>, Document)> = self
            .docs(collection)
            .into_iter()
            .filter_map(|doc| {
                Self::timestamp_of(&doc, timestamp_field)
                    .filter(|ts| *ts > since)
                    .map(|ts| (ts, doc))
            })
            .collect();

        docs.sort_by_key(|(ts, _)| *ts);
        if let Some(limit) = limit {
            docs.truncate(limit as usize);
        }

        Ok(Box::pin(stream::iter(
            docs.into_iter().map(|(_, doc)| Ok(doc)),
        )))
    }

    async fn max_timestamp(
        &self,
        collection: &str,
        timestamp_field: &str,
    ) -> SourceResult<DateTime<Utc>> {
        let newest = self
            .docs(collection)
            .iter()
            .filter_map(|doc| Self::timestamp_of(doc, timestamp_field))
            .max();

        Ok(newest.unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap()))
    }

    async fn count(&self, collection: &str) -> SourceResult<u64> {
        Ok(self.docs(collection).len() as u64)
    }

    async fn has_field(&self, collection: &str, field: &str) -> SourceResult<bool> {
        if field.is_empty() || field == "_id" {
            return Ok(true);
        }
        Ok(self
            .docs(collection)
            .iter()
            .any(|doc| doc.contains_key(field)))
    }

    async fn backfill_field(&self, collection: &str, field: &str) -> SourceResult<u64> {
        if field.is_empty() || field == "_id" {
            return Ok(0);
        }

        let mut collections = self.collections.lock();
        let docs = collections
            .get_mut(collection)
            .ok_or_else(|| SourceError::QueryFailed(format!("no collection {}", collection)))?;

        let mut updated = 0;
        for doc in docs.iter_mut() {
            if !doc.contains_key(field) {
                doc.insert(field, bson::DateTime::now());
                updated += 1;
            }
        }

        Ok(updated)
    }
}

/// Mapping for the `title: text` fixture corpus
pub fn title_mapping() -> IndexMappings {
    IndexMappings {
        dynamic: false,
        fields: vec![FieldMapping {
            name: "title".to_string(),
            field: String::new(),
            field_type: "text".to_string(),
            analyzer: None,
            facet: false,
        }],
    }
}

pub fn index_config(name: &str, collection: &str, shards: u32) -> IndexConfig {
    IndexConfig {
        name: name.to_string(),
        database: String::new(),
        collection: collection.to_string(),
        timestamp_field: "updated_at".to_string(),
        id_field: "_id".to_string(),
        poll_interval: 1,
        distribution: Distribution {
            replicas: 1,
            shards,
        },
        definition: IndexDefinition {
            mappings: title_mapping(),
        },
    }
}

/// Full config rooted in a temp directory
pub fn test_config(dir: &Path, indexes: Vec<IndexConfig>) -> Config {
    Config {
        server: ServerConfig::default(),
        mongodb: MongoConfig {
            uri: "mongodb://localhost:27017".to_string(),
            database: "app".to_string(),
            username: String::new(),
            password: String::new(),
            timeout: 30,
        },
        search: SearchSettings {
            index_path: dir.join("indexes"),
            sync_state_path: dir.join("sync_state.json"),
            batch_size: 1000,
            flush_interval: 30,
            ..Default::default()
        },
        cluster: ClusterConfig::default(),
        indexes,
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Source MongoDB configuration
    pub mongodb: MongoConfig,

    /// Search engine configuration
    #[serde(default)]
    pub search: SearchSettings,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Declared search indexes
    #[serde(default)]
    pub indexes: Vec<IndexConfig>,
}

impl Config {
    /// Load configuration from a YAML file and `OAS_*` environment overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(|p| p.to_string())
            .or_else(|| std::env::var("OAS_CONFIG").ok())
            .unwrap_or_else(|| "config.yaml".to_string());

        let cfg: Config = config::Config::builder()
            .add_source(config::File::new(&path, config::FileFormat::Yaml).required(true))
            .add_source(
                config::Environment::with_prefix("OAS")
                    .separator("_")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.indexes.is_empty() {
            return Err(AppError::Configuration(
                "at least one index must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for index in &self.indexes {
            if index.name.is_empty() {
                return Err(AppError::Configuration(
                    "index name must not be empty".to_string(),
                ));
            }
            if !seen.insert(index.name.clone()) {
                return Err(AppError::Configuration(format!(
                    "duplicate index name: {}",
                    index.name
                )));
            }
            if index.collection.is_empty() {
                return Err(AppError::Configuration(format!(
                    "index {} has no source collection",
                    index.name
                )));
            }
            if index.distribution.replicas == 0 {
                return Err(AppError::Configuration(format!(
                    "index {}: replicas must be >= 1",
                    index.name
                )));
            }
            if index.distribution.shards == 0 {
                return Err(AppError::Configuration(format!(
                    "index {}: shards must be >= 1",
                    index.name
                )));
            }
            for field in &index.definition.mappings.fields {
                if FieldType::parse(&field.field_type).is_none() {
                    return Err(AppError::Configuration(format!(
                        "index {}: field {} has unknown type {}",
                        index.name, field.name, field.field_type
                    )));
                }
            }
        }

        if self.cluster.enabled && self.cluster.bind_addr.is_empty() {
            return Err(AppError::Configuration(
                "cluster.bind_addr is required when cluster mode is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTP Basic auth username (auth disabled when empty)
    #[serde(default)]
    pub username: String,

    /// HTTP Basic auth password (auth disabled when empty)
    #[serde(default)]
    pub password: String,
}

impl ServerConfig {
    /// Whether HTTP Basic auth is enabled
    pub fn auth_enabled(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Source MongoDB connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoConfig {
    /// Connection URI; built from parts when empty
    #[serde(default)]
    pub uri: String,

    /// Database holding the source collections
    pub database: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Operation timeout in seconds
    #[serde(default = "default_mongo_timeout")]
    pub timeout: u64,
}

impl MongoConfig {
    /// Complete connection URI, assembled from parts when not given directly
    pub fn connection_uri(&self) -> String {
        if !self.uri.is_empty() {
            return self.uri.clone();
        }

        if !self.username.is_empty() && !self.password.is_empty() {
            format!("mongodb://{}:{}@localhost:27017", self.username, self.password)
        } else {
            "mongodb://localhost:27017".to_string()
        }
    }
}

/// Search engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    /// Directory holding the per-shard index directories
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,

    /// Documents per indexing batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush loop interval in seconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,

    /// Path of the sync-state manifest file
    #[serde(default = "default_sync_state_path")]
    pub sync_state_path: PathBuf,

    /// Indexing worker threads per shard writer
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Use batched shard writes instead of per-document writes
    #[serde(default = "default_true")]
    pub bulk_indexing: bool,

    /// Source cursor prefetch hint
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u32,

    /// Index writer heap size in bytes
    #[serde(default = "default_index_buffer_size")]
    pub index_buffer_size: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            index_path: default_index_path(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            sync_state_path: default_sync_state_path(),
            worker_count: default_worker_count(),
            bulk_indexing: true,
            prefetch_count: default_prefetch_count(),
            index_buffer_size: default_index_buffer_size(),
        }
    }
}

/// Cluster coordination settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterConfig {
    /// Enable cluster mode
    #[serde(default)]
    pub enabled: bool,

    /// Node identity; derived from hostname when empty
    #[serde(default)]
    pub node_id: String,

    /// Address the consensus transport binds and advertises
    #[serde(default)]
    pub bind_addr: String,

    /// Consensus port (used when bind_addr carries no port)
    #[serde(default = "default_raft_port")]
    pub raft_port: u16,

    /// Directory for the consensus log, vote state and snapshots
    #[serde(default = "default_raft_dir")]
    pub raft_dir: PathBuf,

    /// Directory for cluster-local data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seed a fresh cluster with this node as the initial voter
    #[serde(default)]
    pub bootstrap: bool,

    /// Addresses of existing members to join, tried in order
    #[serde(default)]
    pub join_addr: Vec<String>,
}

/// A declared search index over one source collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Logical index name, unique within the cluster
    pub name: String,

    /// Source database (falls back to mongodb.database when empty)
    #[serde(default)]
    pub database: String,

    /// Source collection
    pub collection: String,

    /// Field ordering documents for polling; "_id" means the intrinsic id
    #[serde(default = "default_id_field")]
    pub timestamp_field: String,

    /// Field used as the indexed document's primary key
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Per-index poll interval in seconds (derived from flush_interval when 0)
    #[serde(default)]
    pub poll_interval: u64,

    /// Replica/shard layout
    #[serde(default)]
    pub distribution: Distribution,

    /// Field mapping definition
    #[serde(default)]
    pub definition: IndexDefinition,
}

impl IndexConfig {
    /// Key identifying the source collection, `database.collection`
    pub fn collection_key(&self, default_db: &str) -> String {
        let db = if self.database.is_empty() {
            default_db
        } else {
            &self.database
        };
        format!("{}.{}", db, self.collection)
    }

    /// Effective poll interval, lower-bounded at one second
    pub fn effective_poll_interval(&self, flush_interval: u64) -> u64 {
        if self.poll_interval > 0 {
            return self.poll_interval;
        }
        (flush_interval / 2).max(1)
    }

    /// Physical shard names backing this index
    pub fn shard_names(&self) -> Vec<String> {
        if self.distribution.shards <= 1 {
            vec![self.name.clone()]
        } else {
            (0..self.distribution.shards)
                .map(|s| format!("{}_shard_{}", self.name, s))
                .collect()
        }
    }
}

/// Replica and shard counts for an index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    #[serde(default = "default_one")]
    pub replicas: u32,

    #[serde(default = "default_one")]
    pub shards: u32,
}

impl Default for Distribution {
    fn default() -> Self {
        Self { replicas: 1, shards: 1 }
    }
}

/// Atlas-style index definition
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndexDefinition {
    #[serde(default)]
    pub mappings: IndexMappings,
}

/// Field mappings for an index
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndexMappings {
    /// Index unmapped fields with default analysis
    #[serde(default)]
    pub dynamic: bool,

    #[serde(default)]
    pub fields: Vec<FieldMapping>,
}

/// Mapping of a single source field into the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Field name in the index
    pub name: String,

    /// Source document field (defaults to `name`)
    #[serde(default)]
    pub field: String,

    /// One of text, keyword, numeric, date, boolean
    #[serde(rename = "type")]
    pub field_type: String,

    /// Analyzer name for text fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<String>,

    /// Expose the field as a facet dimension
    #[serde(default)]
    pub facet: bool,
}

impl FieldMapping {
    /// Source field this mapping reads from
    pub fn source_field(&self) -> &str {
        if self.field.is_empty() {
            &self.name
        } else {
            &self.field
        }
    }
}

/// Recognized mapping field types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Keyword,
    Numeric,
    Date,
    Boolean,
}

impl FieldType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(FieldType::Text),
            "keyword" => Some(FieldType::Keyword),
            "numeric" => Some(FieldType::Numeric),
            "date" => Some(FieldType::Date),
            "boolean" => Some(FieldType::Boolean),
            _ => None,
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_mongo_timeout() -> u64 {
    30
}

fn default_index_path() -> PathBuf {
    PathBuf::from("./indexes")
}

fn default_batch_size() -> usize {
    1000
}

fn default_flush_interval() -> u64 {
    30
}

fn default_sync_state_path() -> PathBuf {
    PathBuf::from("./sync_state.json")
}

fn default_worker_count() -> usize {
    4
}

fn default_prefetch_count() -> u32 {
    1000
}

fn default_index_buffer_size() -> usize {
    50_000_000
}

fn default_raft_port() -> u16 {
    9300
}

fn default_raft_dir() -> PathBuf {
    PathBuf::from("./raft")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_id_field() -> String {
    "_id".to_string()
}

fn default_one() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config {
            server: ServerConfig::default(),
            mongodb: MongoConfig {
                uri: "mongodb://localhost:27017".to_string(),
                database: "app".to_string(),
                username: String::new(),
                password: String::new(),
                timeout: 30,
            },
            search: SearchSettings::default(),
            cluster: ClusterConfig::default(),
            indexes: vec![IndexConfig {
                name: "products".to_string(),
                database: String::new(),
                collection: "products".to_string(),
                timestamp_field: "_id".to_string(),
                id_field: "_id".to_string(),
                poll_interval: 0,
                distribution: Distribution::default(),
                definition: IndexDefinition::default(),
            }],
        }
    }

    #[test]
    fn test_defaults() {
        let settings = SearchSettings::default();
        assert_eq!(settings.batch_size, 1000);
        assert_eq!(settings.flush_interval, 30);
        assert!(settings.bulk_indexing);

        let server = ServerConfig::default();
        assert_eq!(server.port, 8080);
        assert!(!server.auth_enabled());
    }

    #[test]
    fn test_validate_requires_indexes() {
        let mut cfg = minimal_config();
        cfg.indexes.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut cfg = minimal_config();
        let dup = cfg.indexes[0].clone();
        cfg.indexes.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_shards() {
        let mut cfg = minimal_config();
        cfg.indexes[0].distribution.shards = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_field_type() {
        let mut cfg = minimal_config();
        cfg.indexes[0].definition.mappings.fields.push(FieldMapping {
            name: "title".to_string(),
            field: String::new(),
            field_type: "geo".to_string(),
            analyzer: None,
            facet: false,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_collection_key_uses_default_database() {
        let cfg = minimal_config();
        assert_eq!(cfg.indexes[0].collection_key("app"), "app.products");
    }

    #[test]
    fn test_effective_poll_interval() {
        let mut index = minimal_config().indexes[0].clone();
        assert_eq!(index.effective_poll_interval(30), 15);
        assert_eq!(index.effective_poll_interval(1), 1);
        index.poll_interval = 5;
        assert_eq!(index.effective_poll_interval(30), 5);
    }

    #[test]
    fn test_shard_names() {
        let mut index = minimal_config().indexes[0].clone();
        assert_eq!(index.shard_names(), vec!["products".to_string()]);
        index.distribution.shards = 3;
        assert_eq!(
            index.shard_names(),
            vec![
                "products_shard_0".to_string(),
                "products_shard_1".to_string(),
                "products_shard_2".to_string()
            ]
        );
    }

    #[test]
    fn test_auth_enabled_requires_both_credentials() {
        let mut server = ServerConfig::default();
        server.username = "admin".to_string();
        assert!(!server.auth_enabled());
        server.password = "secret".to_string();
        assert!(server.auth_enabled());
    }
}

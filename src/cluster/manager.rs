//! Cluster lifecycle: consensus startup, membership, leadership, routing

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use openraft::error::InitializeError;
use openraft::{Config as RaftConfig, Raft, SnapshotPolicy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::error::{ClusterError, ClusterResult};
use super::fsm::{
    NodeInfo, PlacementCommand, PlacementEntry, StateMachineStore, TypeConfig,
};
use super::network::{raft_router, HttpNetworkFactory};
use super::ring::HashRing;
use super::store::LogStore;
use super::raft_node_id;
use crate::config::{ClusterConfig, IndexConfig};

/// A logical shard owned by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardIdentity {
    pub index_name: String,
    pub shard: u32,
    pub replica: u32,
    pub node_id: String,
}

impl ShardIdentity {
    /// Ring and placement key: `{node}:{index}:r{replica}:s{shard}`
    pub fn shard_key(&self) -> String {
        format!(
            "{}:{}:r{}:s{}",
            self.node_id, self.index_name, self.replica, self.shard
        )
    }
}

/// Request from a node asking to join the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: String,
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStateResponse {
    pub node_ids: Vec<String>,
}

/// Coordinates this node's participation in the cluster
pub struct ClusterManager {
    node_id: String,
    raft_id: u64,
    advertise_addr: String,
    raft: Arc<Raft<TypeConfig>>,
    state_machine: Arc<StateMachineStore>,
    ring: parking_lot::RwLock<HashRing>,
    shards: HashMap<String, Vec<ShardIdentity>>,
    is_leader: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterManager {
    /// Bring up the coordinator: open stores, start consensus, bootstrap or
    /// join, build the local routing ring, and start the leadership watcher.
    pub async fn start(cfg: &ClusterConfig, indexes: &[IndexConfig]) -> ClusterResult<Arc<Self>> {
        if !cfg.enabled {
            return Err(ClusterError::NotEnabled);
        }

        std::fs::create_dir_all(&cfg.raft_dir)
            .map_err(|e| ClusterError::Storage(format!("failed to create raft dir: {}", e)))?;
        std::fs::create_dir_all(&cfg.data_dir)
            .map_err(|e| ClusterError::Storage(format!("failed to create data dir: {}", e)))?;

        let node_id = if cfg.node_id.is_empty() {
            generated_node_id()
        } else {
            cfg.node_id.clone()
        };
        let raft_id = raft_node_id(&node_id);
        let advertise_addr = advertise_addr(cfg);

        let log_store = LogStore::open(&cfg.raft_dir.join("raft-log"))
            .map_err(|e| ClusterError::Storage(format!("failed to open log store: {}", e)))?;
        let state_machine = StateMachineStore::new(cfg.raft_dir.join("snapshots"))
            .map_err(|e| ClusterError::Storage(format!("failed to open snapshot store: {}", e)))?;

        let raft_config = RaftConfig {
            cluster_name: "open-atlas-search".to_string(),
            heartbeat_interval: 500,
            election_timeout_min: 1500,
            election_timeout_max: 3000,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(500),
            ..Default::default()
        };
        let raft_config = Arc::new(
            raft_config
                .validate()
                .map_err(|e| ClusterError::ConsensusUnavailable(e.to_string()))?,
        );

        let raft = Raft::new(
            raft_id,
            raft_config,
            HttpNetworkFactory::new(),
            log_store,
            state_machine.clone(),
        )
        .await
        .map_err(|e| ClusterError::ConsensusUnavailable(e.to_string()))?;
        let raft = Arc::new(raft);

        let manager = Arc::new(Self {
            node_id: node_id.clone(),
            raft_id,
            advertise_addr: advertise_addr.clone(),
            raft: raft.clone(),
            state_machine,
            ring: parking_lot::RwLock::new(HashRing::default()),
            shards: local_shards(&node_id, indexes),
            is_leader: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        manager.clone().serve_cluster_rpc(&advertise_addr).await?;

        if cfg.bootstrap {
            let mut members = BTreeMap::new();
            members.insert(
                raft_id,
                NodeInfo {
                    name: node_id.clone(),
                    addr: advertise_addr.clone(),
                },
            );

            match raft.initialize(members).await {
                Ok(()) => {
                    tracing::info!(node = %node_id, "Bootstrapped cluster");
                }
                Err(openraft::error::RaftError::APIError(InitializeError::NotAllowed(_))) => {
                    tracing::info!(node = %node_id, "Cluster already initialized, resuming");
                }
                Err(e) => return Err(ClusterError::ConsensusUnavailable(e.to_string())),
            }
        } else if !cfg.join_addr.is_empty() {
            manager.join_existing(&cfg.join_addr).await?;
        }

        manager.rebuild_ring_from_config();
        manager.clone().spawn_leadership_watcher();

        tracing::info!(node = %node_id, addr = %advertise_addr, "Cluster manager started");

        Ok(manager)
    }

    /// Step down and stop background tasks.
    pub async fn stop(&self) {
        if let Err(e) = self.raft.shutdown().await {
            tracing::warn!(error = %e, "Raft shutdown reported an error");
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!(node = %self.node_id, "Cluster manager stopped");
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    /// The node owning the hash slot for `key` within `index`. Falls back to
    /// this node when no ring has been built (standalone mode).
    pub fn shard_node_for(&self, index: &str, key: &str) -> String {
        let ring = self.ring.read();
        ring.get_node(&format!("{}:{}", index, key))
            .map(|node| node.to_string())
            .unwrap_or_else(|| self.node_id.clone())
    }

    /// Whether this node owns the hash slot for `key` within `index`
    pub fn is_responsible(&self, index: &str, key: &str) -> bool {
        self.shard_node_for(index, key) == self.node_id
    }

    /// Shards of `index` owned by this node
    pub fn shards_for(&self, index: &str) -> Vec<ShardIdentity> {
        self.shards.get(index).cloned().unwrap_or_default()
    }

    /// Current cluster membership, by node name
    pub fn members(&self) -> Vec<String> {
        let metrics = self.raft.metrics().borrow().clone();
        metrics
            .membership_config
            .membership()
            .nodes()
            .map(|(_, node)| node.name.clone())
            .collect()
    }

    /// Applied placement state, for inspection
    pub async fn placement(&self) -> super::fsm::PlacementState {
        self.state_machine.placement().await
    }

    /// Add a node as a voter. Leader only; callers must redirect otherwise.
    pub async fn add_voter(&self, node_id: &str, bind_addr: &str) -> ClusterResult<()> {
        self.ensure_leader()?;

        let new_id = raft_node_id(node_id);
        let node = NodeInfo {
            name: node_id.to_string(),
            addr: bind_addr.to_string(),
        };

        self.raft
            .add_learner(new_id, node, true)
            .await
            .map_err(|e| ClusterError::ConsensusUnavailable(e.to_string()))?;

        let mut voters: BTreeSet<u64> = {
            let metrics = self.raft.metrics().borrow().clone();
            metrics.membership_config.membership().voter_ids().collect()
        };
        voters.insert(new_id);

        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| ClusterError::ConsensusUnavailable(e.to_string()))?;

        tracing::info!(node = %node_id, addr = %bind_addr, "Node added as voter");
        Ok(())
    }

    /// Remove a voter from the cluster. Leader only.
    pub async fn remove_voter(&self, node_id: &str) -> ClusterResult<()> {
        self.ensure_leader()?;

        let target = raft_node_id(node_id);
        let voters: BTreeSet<u64> = {
            let metrics = self.raft.metrics().borrow().clone();
            metrics
                .membership_config
                .membership()
                .voter_ids()
                .filter(|id| *id != target)
                .collect()
        };

        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| ClusterError::ConsensusUnavailable(e.to_string()))?;

        tracing::info!(node = %node_id, "Node removed from cluster");
        Ok(())
    }

    fn ensure_leader(&self) -> ClusterResult<()> {
        if self.is_leader() {
            return Ok(());
        }

        let metrics = self.raft.metrics().borrow().clone();
        let leader_addr = metrics.current_leader.and_then(|leader| {
            metrics
                .membership_config
                .membership()
                .nodes()
                .find(|(id, _)| **id == leader)
                .map(|(_, node)| node.addr.clone())
        });

        Err(ClusterError::NotLeader(leader_addr))
    }

    async fn join_existing(&self, join_addrs: &[String]) -> ClusterResult<()> {
        let client = reqwest::Client::new();
        let request = JoinRequest {
            node_id: self.node_id.clone(),
            bind_addr: self.advertise_addr.clone(),
        };

        for addr in join_addrs {
            let url = format!("http://{}/cluster/join", addr);
            match client.post(&url).json(&request).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(addr = %addr, "Joined cluster");
                    return Ok(());
                }
                Ok(response) => {
                    tracing::warn!(addr = %addr, status = %response.status(), "Join attempt rejected");
                }
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "Join attempt failed");
                }
            }
        }

        Err(ClusterError::JoinFailed(format!(
            "no join address accepted this node: {:?}",
            join_addrs
        )))
    }

    async fn serve_cluster_rpc(self: Arc<Self>, addr: &str) -> ClusterResult<()> {
        let router = raft_router(self.raft.clone()).merge(
            Router::new()
                .route("/cluster/join", post(handle_join))
                .route("/cluster/state", get(handle_state))
                .with_state(self.clone()),
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ClusterError::Storage(format!("failed to bind {}: {}", addr, e)))?;

        tracing::info!(addr = %addr, "Cluster RPC listening");

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, "Cluster RPC server stopped");
            }
        });
        self.tasks.lock().push(task);

        Ok(())
    }

    /// Poll leadership every 5 seconds and run the transition hooks.
    fn spawn_leadership_watcher(self: Arc<Self>) {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;

                let metrics = manager.raft.metrics().borrow().clone();
                let now_leader = metrics.current_leader == Some(manager.raft_id);
                let was_leader = manager.is_leader.swap(now_leader, Ordering::Relaxed);

                if now_leader && !was_leader {
                    tracing::info!(node = %manager.node_id, "Became cluster leader");
                    manager.on_become_leader().await;
                } else if !now_leader && was_leader {
                    tracing::info!(node = %manager.node_id, "Lost cluster leadership");
                }

                manager.refresh_ring_from_placement().await;
            }
        });
        self.tasks.lock().push(task);
    }

    /// On gaining leadership, publish this node's configured shard layout
    /// through the replicated log.
    async fn on_become_leader(&self) {
        for (index_name, shards) in &self.shards {
            let mut shard_keys = Vec::with_capacity(shards.len());

            for shard in shards {
                let shard_key = shard.shard_key();
                shard_keys.push(shard_key.clone());

                let command = PlacementCommand::AddShard {
                    shard_key,
                    entry: PlacementEntry {
                        index_name: shard.index_name.clone(),
                        shard: shard.shard,
                        replica: shard.replica,
                        node_id: shard.node_id.clone(),
                    },
                };

                if let Err(e) = self.raft.client_write(command).await {
                    tracing::warn!(index = %index_name, error = %e, "Failed to publish shard placement");
                    return;
                }
            }

            let command = PlacementCommand::IndexDistribution {
                index_name: index_name.clone(),
                shard_keys,
            };
            if let Err(e) = self.raft.client_write(command).await {
                tracing::warn!(index = %index_name, error = %e, "Failed to publish index distribution");
            }
        }
    }

    /// Build the routing ring from this node's configured shards.
    fn rebuild_ring_from_config(&self) {
        let keys: Vec<String> = self
            .shards
            .values()
            .flatten()
            .map(ShardIdentity::shard_key)
            .collect();

        *self.ring.write() = HashRing::new(keys);
    }

    /// Converge the ring onto the log-applied placement once entries exist.
    async fn refresh_ring_from_placement(&self) {
        let placement = self.state_machine.placement().await;
        if placement.placement.is_empty() {
            return;
        }

        let keys: Vec<String> = placement.placement.keys().cloned().collect();
        *self.ring.write() = HashRing::new(keys);
    }
}

async fn handle_join(
    State(manager): State<Arc<ClusterManager>>,
    Json(request): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, crate::error::AppError> {
    manager
        .add_voter(&request.node_id, &request.bind_addr)
        .await?;

    Ok(Json(JoinResponse {
        message: format!("node {} successfully joined the cluster", request.node_id),
    }))
}

async fn handle_state(
    State(manager): State<Arc<ClusterManager>>,
) -> Json<ClusterStateResponse> {
    Json(ClusterStateResponse {
        node_ids: manager.members(),
    })
}

/// This node's shards for every configured index
fn local_shards(node_id: &str, indexes: &[IndexConfig]) -> HashMap<String, Vec<ShardIdentity>> {
    let mut shards = HashMap::new();

    for index in indexes {
        let mut index_shards = Vec::new();
        for replica in 0..index.distribution.replicas.max(1) {
            for shard in 0..index.distribution.shards.max(1) {
                index_shards.push(ShardIdentity {
                    index_name: index.name.clone(),
                    shard,
                    replica,
                    node_id: node_id.to_string(),
                });
            }
        }
        shards.insert(index.name.clone(), index_shards);
    }

    shards
}

fn generated_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("node-{}-{}", host, uuid::Uuid::new_v4().simple())
}

fn advertise_addr(cfg: &ClusterConfig) -> String {
    if cfg.bind_addr.contains(':') {
        cfg.bind_addr.clone()
    } else {
        format!("{}:{}", cfg.bind_addr, cfg.raft_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Distribution;

    fn index(name: &str, replicas: u32, shards: u32) -> IndexConfig {
        IndexConfig {
            name: name.to_string(),
            database: String::new(),
            collection: name.to_string(),
            timestamp_field: "_id".to_string(),
            id_field: "_id".to_string(),
            poll_interval: 0,
            distribution: Distribution { replicas, shards },
            definition: Default::default(),
        }
    }

    #[test]
    fn test_shard_key_format() {
        let identity = ShardIdentity {
            index_name: "products".to_string(),
            shard: 2,
            replica: 1,
            node_id: "node-a".to_string(),
        };
        assert_eq!(identity.shard_key(), "node-a:products:r1:s2");
    }

    #[test]
    fn test_local_shards_covers_replicas_and_shards() {
        let shards = local_shards("node-a", &[index("products", 2, 3)]);
        let product_shards = &shards["products"];
        assert_eq!(product_shards.len(), 6);
        assert!(product_shards
            .iter()
            .any(|s| s.replica == 1 && s.shard == 2));
    }

    #[test]
    fn test_advertise_addr_appends_port_when_missing() {
        let mut cfg = ClusterConfig::default();
        cfg.bind_addr = "10.0.0.5".to_string();
        cfg.raft_port = 9301;
        assert_eq!(advertise_addr(&cfg), "10.0.0.5:9301");

        cfg.bind_addr = "10.0.0.5:7000".to_string();
        assert_eq!(advertise_addr(&cfg), "10.0.0.5:7000");
    }
}

//! Replicated placement state machine
//!
//! The consensus log carries [`PlacementCommand`]s; the applied state is the
//! authoritative `shard_key -> placement` map plus the canonical shard list
//! per index. Snapshots serialize the whole state as JSON and are kept on
//! disk, newest three retained.

use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{
    AnyError, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, RaftSnapshotBuilder,
    SnapshotMeta, StorageError, StorageIOError, StoredMembership,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A cluster member: stable name plus its cluster RPC address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub addr: String,
}

openraft::declare_raft_types!(
    /// Raft type configuration for the placement log
    pub TypeConfig:
        D = PlacementCommand,
        R = PlacementResponse,
        Node = NodeInfo,
);

pub type NodeId = u64;

/// One shard placement record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementEntry {
    pub index_name: String,
    pub shard: u32,
    pub replica: u32,
    pub node_id: String,
}

/// Commands applied through the replicated log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlacementCommand {
    AddShard {
        shard_key: String,
        entry: PlacementEntry,
    },
    RemoveShard {
        shard_key: String,
    },
    UpdateShard {
        shard_key: String,
        entry: PlacementEntry,
    },
    IndexDistribution {
        index_name: String,
        shard_keys: Vec<String>,
    },
}

/// Response returned after applying a command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementResponse {
    pub message: String,
}

/// The applied placement state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementState {
    pub placement: BTreeMap<String, PlacementEntry>,
    pub index_shards: BTreeMap<String, Vec<String>>,
}

impl PlacementState {
    pub fn apply(&mut self, command: &PlacementCommand) -> PlacementResponse {
        match command {
            PlacementCommand::AddShard { shard_key, entry } => {
                self.placement.insert(shard_key.clone(), entry.clone());
                PlacementResponse {
                    message: format!("shard {} added", shard_key),
                }
            }
            PlacementCommand::RemoveShard { shard_key } => {
                self.placement.remove(shard_key);
                PlacementResponse {
                    message: format!("shard {} removed", shard_key),
                }
            }
            PlacementCommand::UpdateShard { shard_key, entry } => {
                self.placement.insert(shard_key.clone(), entry.clone());
                PlacementResponse {
                    message: format!("shard {} updated", shard_key),
                }
            }
            PlacementCommand::IndexDistribution {
                index_name,
                shard_keys,
            } => {
                self.index_shards
                    .insert(index_name.clone(), shard_keys.clone());
                PlacementResponse {
                    message: format!("index {} distribution updated", index_name),
                }
            }
        }
    }
}

/// Serialized snapshot payload
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotPayload {
    state: PlacementState,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, NodeInfo>,
}

#[derive(Debug, Default)]
struct StateMachineData {
    state: PlacementState,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, NodeInfo>,
    snapshot_idx: u64,
    current_snapshot: Option<(SnapshotMeta<NodeId, NodeInfo>, Vec<u8>)>,
}

/// State machine store with file-backed snapshots
pub struct StateMachineStore {
    data: RwLock<StateMachineData>,
    snapshot_dir: PathBuf,
}

/// Number of snapshot files retained on disk
const SNAPSHOTS_TO_KEEP: usize = 3;

impl StateMachineStore {
    pub fn new(snapshot_dir: PathBuf) -> std::io::Result<Arc<Self>> {
        std::fs::create_dir_all(&snapshot_dir)?;
        Ok(Arc::new(Self {
            data: RwLock::new(StateMachineData::default()),
            snapshot_dir,
        }))
    }

    /// Deep copy of the applied placement state
    pub async fn placement(&self) -> PlacementState {
        self.data.read().await.state.clone()
    }

    fn snapshot_path(&self, snapshot_id: &str) -> PathBuf {
        self.snapshot_dir.join(format!("{}.json", snapshot_id))
    }

    /// Write a snapshot file and prune old ones, newest three retained.
    fn persist_snapshot(&self, snapshot_id: &str, data: &[u8]) -> std::io::Result<()> {
        std::fs::write(self.snapshot_path(snapshot_id), data)?;

        let mut files: Vec<_> = std::fs::read_dir(&self.snapshot_dir)?
            .flatten()
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort_by_key(|entry| {
            entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        });

        while files.len() > SNAPSHOTS_TO_KEEP {
            let oldest = files.remove(0);
            let _ = std::fs::remove_file(oldest.path());
        }

        Ok(())
    }
}

fn sm_err(verb: ErrorVerb, e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::new(ErrorSubject::StateMachine, verb, AnyError::new(&e)),
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<StateMachineStore> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let mut data = self.data.write().await;

        let payload = SnapshotPayload {
            state: data.state.clone(),
            last_applied: data.last_applied,
            last_membership: data.last_membership.clone(),
        };
        let bytes =
            serde_json::to_vec(&payload).map_err(|e| sm_err(ErrorVerb::Write, e))?;

        data.snapshot_idx += 1;
        let snapshot_id = match data.last_applied {
            Some(log_id) => format!("{}-{}-{}", log_id.leader_id, log_id.index, data.snapshot_idx),
            None => format!("none-{}", data.snapshot_idx),
        };

        let meta = SnapshotMeta {
            last_log_id: data.last_applied,
            last_membership: data.last_membership.clone(),
            snapshot_id: snapshot_id.clone(),
        };

        self.persist_snapshot(&snapshot_id, &bytes)
            .map_err(|e| sm_err(ErrorVerb::Write, e))?;

        data.current_snapshot = Some((meta.clone(), bytes.clone()));

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for Arc<StateMachineStore> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, NodeInfo>), StorageError<NodeId>>
    {
        let data = self.data.read().await;
        Ok((data.last_applied, data.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<PlacementResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let mut data = self.data.write().await;
        let mut responses = Vec::new();

        for entry in entries {
            data.last_applied = Some(entry.log_id);

            let response = match entry.payload {
                EntryPayload::Blank => PlacementResponse::default(),
                EntryPayload::Normal(ref command) => data.state.apply(command),
                EntryPayload::Membership(ref membership) => {
                    data.last_membership =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    PlacementResponse {
                        message: "membership updated".to_string(),
                    }
                }
            };

            responses.push(response);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, NodeInfo>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let bytes = snapshot.into_inner();
        let payload: SnapshotPayload =
            serde_json::from_slice(&bytes).map_err(|e| sm_err(ErrorVerb::Read, e))?;

        let mut data = self.data.write().await;
        data.state = payload.state;
        data.last_applied = meta.last_log_id;
        data.last_membership = meta.last_membership.clone();
        data.current_snapshot = Some((meta.clone(), bytes.clone()));
        drop(data);

        self.persist_snapshot(&meta.snapshot_id, &bytes)
            .map_err(|e| sm_err(ErrorVerb::Write, e))?;

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let data = self.data.read().await;
        Ok(data.current_snapshot.as_ref().map(|(meta, bytes)| Snapshot {
            meta: meta.clone(),
            snapshot: Box::new(Cursor::new(bytes.clone())),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u32) -> PlacementEntry {
        PlacementEntry {
            index_name: "products".to_string(),
            shard: index,
            replica: 0,
            node_id: "node-a".to_string(),
        }
    }

    #[test]
    fn test_add_and_remove_shard() {
        let mut state = PlacementState::default();

        state.apply(&PlacementCommand::AddShard {
            shard_key: "node-a:products:r0:s0".to_string(),
            entry: entry(0),
        });
        assert_eq!(state.placement.len(), 1);

        state.apply(&PlacementCommand::RemoveShard {
            shard_key: "node-a:products:r0:s0".to_string(),
        });
        assert!(state.placement.is_empty());
    }

    #[test]
    fn test_update_shard_overwrites() {
        let mut state = PlacementState::default();
        let key = "node-a:products:r0:s0".to_string();

        state.apply(&PlacementCommand::AddShard {
            shard_key: key.clone(),
            entry: entry(0),
        });

        let mut updated = entry(0);
        updated.node_id = "node-b".to_string();
        state.apply(&PlacementCommand::UpdateShard {
            shard_key: key.clone(),
            entry: updated,
        });

        assert_eq!(state.placement[&key].node_id, "node-b");
    }

    #[test]
    fn test_index_distribution() {
        let mut state = PlacementState::default();
        state.apply(&PlacementCommand::IndexDistribution {
            index_name: "products".to_string(),
            shard_keys: vec!["k0".to_string(), "k1".to_string()],
        });

        assert_eq!(state.index_shards["products"].len(), 2);
    }

    #[test]
    fn test_state_json_round_trip() {
        let mut state = PlacementState::default();
        state.apply(&PlacementCommand::AddShard {
            shard_key: "node-a:products:r0:s0".to_string(),
            entry: entry(0),
        });

        let json = serde_json::to_string(&state).unwrap();
        let restored: PlacementState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.placement, state.placement);
    }
}

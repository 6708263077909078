//! Cluster coordination: membership, replicated shard placement, routing ring
//!
//! A raft-replicated state machine owns the authoritative shard placement
//! map. Each node also derives a consistent-hash ring for fast local
//! routing of document ids to shard owners. Peers exchange raft RPCs and
//! join/state requests over HTTP on the cluster bind address.

mod error;
mod fsm;
mod manager;
mod network;
mod ring;
mod store;

pub use error::{ClusterError, ClusterResult};
pub use fsm::{
    NodeInfo, PlacementCommand, PlacementEntry, PlacementResponse, PlacementState,
    StateMachineStore, TypeConfig,
};
pub use manager::{
    ClusterManager, ClusterStateResponse, JoinRequest, JoinResponse, ShardIdentity,
};
pub use network::{raft_router, HttpNetworkFactory};
pub use ring::HashRing;
pub use store::LogStore;

/// Raft node id derived from the configured node name
pub fn raft_node_id(node_id: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in node_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

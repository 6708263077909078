//! Error types for cluster operations

use crate::error::AppError;

/// Result type for cluster operations
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Errors that can occur during cluster coordination
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The operation must run on the leader
    #[error("Not the cluster leader{}", leader_hint(.0))]
    NotLeader(Option<String>),

    /// Quorum lost or the consensus engine rejected the operation
    #[error("Consensus unavailable: {0}")]
    ConsensusUnavailable(String),

    /// Log, vote or snapshot persistence failed
    #[error("Cluster storage error: {0}")]
    Storage(String),

    /// Joining an existing cluster failed
    #[error("Failed to join cluster: {0}")]
    JoinFailed(String),

    /// Cluster mode is not enabled
    #[error("Cluster mode is not enabled")]
    NotEnabled,
}

fn leader_hint(leader: &Option<String>) -> String {
    match leader {
        Some(addr) => format!(", leader is at {}", addr),
        None => String::new(),
    }
}

impl From<ClusterError> for AppError {
    fn from(err: ClusterError) -> Self {
        AppError::ClusterUnavailable(err.to_string())
    }
}

//! Query router: validates requests and dispatches them to the engine
//!
//! Routing is local: a sharded index goes through the engine's
//! scatter-gather path, a single-shard index is searched directly. A
//! deployment fronts every node with a load balancer and each node serves
//! what it holds; cross-node forwarding is not required for correctness.

use std::sync::Arc;

use crate::cluster::ClusterManager;
use crate::error::{AppError, Result};
use crate::search::{SearchEngine, SearchRequest, SearchResponse};

/// Largest page size a single request may ask for
const MAX_SIZE: usize = 1000;

/// Cap on how deep a page window may reach
const MAX_WINDOW: usize = 10_000;

/// Default page size when the request omits one
const DEFAULT_SIZE: usize = 10;

/// Dispatches search requests to local shards
pub struct QueryRouter {
    engine: Arc<SearchEngine>,
    cluster: Option<Arc<ClusterManager>>,
}

impl QueryRouter {
    pub fn new(engine: Arc<SearchEngine>, cluster: Option<Arc<ClusterManager>>) -> Self {
        Self { engine, cluster }
    }

    /// Validate the page window, then execute the search.
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        validate_window(request.size, request.from)?;

        if !self.engine.has_index(&request.index).await {
            return Err(AppError::NotFound(format!("index {}", request.index)));
        }

        if let Some(cluster) = &self.cluster {
            let owned = cluster.shards_for(&request.index);
            tracing::debug!(
                index = %request.index,
                local_shards = owned.len(),
                "Routing search to local shards"
            );
        }

        let response = self.engine.search(&request).await?;
        Ok(response)
    }
}

fn validate_window(size: usize, from: usize) -> Result<()> {
    if size > MAX_SIZE {
        return Err(AppError::Validation(format!(
            "size must be at most {}",
            MAX_SIZE
        )));
    }

    let effective_size = if size == 0 { DEFAULT_SIZE } else { size };
    if from + effective_size > MAX_WINDOW {
        return Err(AppError::Validation(format!(
            "from + size must be at most {}",
            MAX_WINDOW
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_accepts_defaults() {
        assert!(validate_window(0, 0).is_ok());
        assert!(validate_window(10, 0).is_ok());
        assert!(validate_window(1000, 9000).is_ok());
    }

    #[test]
    fn test_window_rejects_oversized_page() {
        assert!(validate_window(1001, 0).is_err());
    }

    #[test]
    fn test_window_rejects_deep_pagination() {
        assert!(validate_window(1000, 9001).is_err());
        assert!(validate_window(0, 9995).is_err());
    }
}

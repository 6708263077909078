//! HTTP API surface: health probes, index inspection and search

mod auth;
mod handlers;
mod routes;

pub use routes::build_router;

use std::sync::Arc;

use crate::cluster::ClusterManager;
use crate::config::Config;
use crate::indexer::IndexerService;
use crate::router::QueryRouter;
use crate::search::SearchEngine;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<SearchEngine>,
    pub indexer: Arc<IndexerService>,
    pub router: Arc<QueryRouter>,
    pub cluster: Option<Arc<ClusterManager>>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        engine: Arc<SearchEngine>,
        indexer: Arc<IndexerService>,
        router: Arc<QueryRouter>,
        cluster: Option<Arc<ClusterManager>>,
    ) -> Self {
        Self {
            config,
            engine,
            indexer,
            router,
            cluster,
        }
    }
}

use clap::{Parser, Subcommand};
use open_atlas_search::{
    api::{build_router, AppState},
    cluster::ClusterManager,
    config::Config,
    indexer::{init_timestamp_fields, IndexerService},
    router::QueryRouter,
    search::SearchEngine,
    source::MongoSource,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "open-atlas-search", version, about = "Self-hosted Atlas Search compatible full-text search")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the search service (default)
    Serve,

    /// Backfill missing timestamp fields on the source collections
    InitTimestamps,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "open_atlas_search=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;
    let config = Arc::new(config);

    tracing::info!("Starting open-atlas-search v{}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::InitTimestamps => init_timestamps(config).await,
    }
}

async fn init_timestamps(config: Arc<Config>) -> Result<(), Box<dyn std::error::Error>> {
    let source = MongoSource::connect(&config.mongodb).await?;
    let updated = init_timestamp_fields(&source, &config).await?;
    tracing::info!(documents = updated, "Timestamp backfill complete");
    Ok(())
}

async fn serve(config: Arc<Config>) -> Result<(), Box<dyn std::error::Error>> {
    // Source database
    let source = Arc::new(MongoSource::connect(&config.mongodb).await?);

    // Search engine
    let engine = Arc::new(SearchEngine::new(&config.search)?);
    tracing::info!(path = %config.search.index_path.display(), "Search engine initialized");

    // Cluster coordination before any shard opens, so placement routing is
    // available once indexing starts
    let cluster = if config.cluster.enabled {
        let manager = ClusterManager::start(&config.cluster, &config.indexes).await?;
        tracing::info!(node = %manager.node_id(), "Cluster coordination enabled");
        Some(manager)
    } else {
        None
    };

    // Indexing pipeline
    let indexer = Arc::new(IndexerService::new(source, engine.clone(), config.clone()).await?);
    indexer.clone().start().await;
    tracing::info!("Indexer service started");

    // Query router and HTTP API
    let router = Arc::new(QueryRouter::new(engine.clone(), cluster.clone()));
    let state = AppState::new(
        config.clone(),
        engine.clone(),
        indexer.clone(),
        router,
        cluster.clone(),
    );
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop accepting work, then drain: pipeline, engine, cluster.
    tracing::info!("Shutting down");
    indexer.stop().await;
    engine.close().await?;
    if let Some(cluster) = cluster {
        cluster.stop().await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

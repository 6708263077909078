use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{auth, handlers, AppState};

/// Build the main API router. Probes stay open; everything else sits behind
/// Basic auth when the server config carries credentials.
pub fn build_router(state: AppState) -> Router {
    let probes = Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready));

    let mut protected = Router::new()
        .route("/indexes", get(handlers::list_indexes))
        .route("/indexes/:index/status", get(handlers::index_status))
        .route("/indexes/:index/mapping", get(handlers::index_mapping))
        .route("/indexes/:index/search", post(handlers::search));

    if state.config.server.auth_enabled() {
        protected = protected.layer(middleware::from_fn_with_state(
            state.clone(),
            auth::basic_auth,
        ));
    }

    probes
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

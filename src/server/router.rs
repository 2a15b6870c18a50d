use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use super::{AppState, chunks, relay};
use crate::webhooks;

/// Build the relay's router. A fresh router is assembled on every start so
/// routes from a previous configuration cannot leak across reloads.
pub fn create_router(state: AppState) -> Router {
    let config = state.config.current();

    let mut router = Router::new()
        // Uplink-shaped GraphQL polls from routers
        .route("/", post(relay::relay_handler))
        // Persisted-query chunk reads
        .route("/persisted-queries", get(chunks::missing_chunk_id))
        .route("/persisted-queries/*id", get(chunks::chunk_handler));

    if config.webhook.enabled {
        router = router.route(&config.webhook.path, post(webhooks::webhook_handler));
    }

    router.with_state(state).layer(TraceLayer::new_for_http())
}

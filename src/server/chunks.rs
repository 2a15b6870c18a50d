use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use super::AppState;
use crate::core::error::RelayError;
use crate::persisted_queries::{decompress_chunk, make_chunk_cache_key};

/// Serve `GET /persisted-queries/<id>?i=<index>`: look the compressed
/// chunk up, inflate it and stream the original bytes back.
pub async fn chunk_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    debug!(id, "received chunk request");

    if id.is_empty() {
        return RelayError::InvalidRequest("invalid path format".to_string()).into_response();
    }
    let Some(index) = params.get("i").filter(|index| !index.is_empty()) else {
        return RelayError::InvalidRequest("invalid path format".to_string()).into_response();
    };

    let cache_key = make_chunk_cache_key(&id, index);
    debug!(id, index, cache_key, "looking up chunk");
    let Some(content) = state.cache.get(&cache_key).await else {
        return RelayError::NotFound("manifest not found".to_string()).into_response();
    };

    match decompress_chunk(&content) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            error!(cache_key, %err, "failed to decompress chunk");
            RelayError::Internal("error reading content".to_string()).into_response()
        }
    }
}

/// A chunk request without an id.
pub async fn missing_chunk_id() -> Response {
    RelayError::InvalidRequest("invalid path format".to_string()).into_response()
}

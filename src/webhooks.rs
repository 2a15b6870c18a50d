//! Schema-change webhook: verifies the HMAC signature, fetches the
//! advertised schema and refreshes the cache for that graph.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{error, info};

use crate::core::error::RelayError;
use crate::schema::cache_schema;
use crate::server::AppState;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
pub struct SchemaChange {
    #[allow(dead_code)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    #[serde(rename = "eventType", default)]
    pub event_type: String,
    #[serde(rename = "eventID", default)]
    pub event_id: String,
    #[serde(default)]
    pub changes: Vec<SchemaChange>,
    #[serde(rename = "schemaURL")]
    pub schema_url: String,
    #[serde(rename = "schemaURLExpiresAt", default)]
    pub schema_url_expires_at: Option<DateTime<Utc>>,
    #[serde(rename = "graphID", default)]
    pub graph_id: String,
    /// Carries a full graph ref, not a bare variant name.
    #[serde(rename = "variantID")]
    pub variant_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

pub async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let config = state.config.current();

    let Some(signature) = headers
        .get("x-apollo-signature")
        .and_then(|value| value.to_str().ok())
    else {
        return RelayError::InvalidRequest("missing signature".to_string()).into_response();
    };
    let Some(("sha256", provided)) = signature.split_once('=') else {
        return RelayError::InvalidRequest("invalid signature".to_string()).into_response();
    };

    if config.webhook.secret.is_empty() {
        return RelayError::InvalidRequest("webhook secret not configured".to_string())
            .into_response();
    }

    let Ok(provided) = hex::decode(provided) else {
        return RelayError::InvalidRequest("invalid signature".to_string()).into_response();
    };
    let mut mac = match HmacSha256::new_from_slice(config.webhook.secret.as_bytes()) {
        Ok(mac) => mac,
        Err(err) => {
            error!(%err, "failed to initialize webhook verifier");
            return RelayError::Internal("signature verification failed".to_string())
                .into_response();
        }
    };
    mac.update(&body);
    if mac.verify_slice(&provided).is_err() {
        return RelayError::InvalidRequest("invalid signature".to_string()).into_response();
    }

    let data: WebhookData = match serde_json::from_slice(&body) {
        Ok(data) => data,
        Err(err) => return RelayError::InvalidRequest(err.to_string()).into_response(),
    };

    if config.find_supergraph(&data.variant_id).is_none() {
        return RelayError::InvalidRequest(format!(
            "variantID {} not found in the list of supergraphs",
            data.variant_id
        ))
        .into_response();
    }

    let schema = match state.http_client.get(&data.schema_url).send().await {
        Ok(response) => match response.text().await {
            Ok(schema) => schema,
            Err(err) => {
                return RelayError::Internal(format!("failed to read schema: {err}"))
                    .into_response();
            }
        },
        Err(err) => {
            return RelayError::Internal(format!("failed to fetch schema: {err}")).into_response();
        }
    };

    if config.cache.enabled {
        if let Err(err) = cache_schema(
            state.cache.as_ref(),
            &data.variant_id,
            &schema,
            Utc::now(),
            "",
            config.cache.duration,
        )
        .await
        {
            error!(%err, graph_ref = data.variant_id, "failed to cache webhook schema");
            return RelayError::Cache(err.to_string()).into_response();
        }
    } else {
        info!(graph_ref = data.variant_id, "cache is disabled, skipping cache update");
    }

    (StatusCode::OK, "Webhook processed successfully").into_response()
}

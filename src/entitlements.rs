//! Router license (entitlements) fetching and caching.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{
    Cache, CacheItem, conditional_args, format_rfc3339, make_cache_key, update_newest,
};
use crate::config::SharedConfig;
use crate::core::error::{RelayError, Result};
use crate::core::hash::hash_bytes;
use crate::pinning;
use crate::schema::parse_rfc3339;
use crate::uplink::{self, LICENSE_QUERY, RoundRobinSelector};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwt {
    pub jwt: String,
}

/// Union uplink returns for a `LicenseQuery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "__typename")]
pub enum RouterEntitlements {
    RouterEntitlementsResult {
        id: String,
        #[serde(rename = "minDelaySeconds")]
        min_delay_seconds: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entitlement: Option<Jwt>,
    },
    Unchanged {
        id: String,
        #[serde(rename = "minDelaySeconds")]
        min_delay_seconds: f64,
    },
    FetchError {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseResponse {
    pub data: LicenseData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseData {
    #[serde(rename = "routerEntitlements")]
    pub router_entitlements: RouterEntitlements,
}

pub const LICENSE_QUERY_DOCUMENT: &str = r#"query LicenseQuery($apiKey: String!, $graph_ref: String!, $ifAfterId: ID) {
    routerEntitlements(ifAfterId: $ifAfterId, apiKey: $apiKey, ref: $graph_ref) {
        __typename
        ... on RouterEntitlementsResult {
            id
            minDelaySeconds
            entitlement {
                jwt
            }
        }
        ... on Unchanged {
            id
            minDelaySeconds
        }
        ... on FetchError {
            code
            message
        }
    }
}"#;

/// Fetch the router license for a graph and cache it. Graphs with an
/// offline license are delegated to the pinning store.
pub async fn fetch_router_license(
    shared: &SharedConfig,
    cache: &dyn Cache,
    client: &reqwest::Client,
    selector: &RoundRobinSelector,
    graph_ref: &str,
) -> Result<()> {
    let config = shared.current();
    let supergraph = config
        .find_supergraph(graph_ref)
        .ok_or_else(|| RelayError::Config(format!("supergraph not found for {graph_ref}")))?;

    if !supergraph.offline_license.is_empty() {
        return pinning::pin_offline_license(
            &config,
            cache,
            &supergraph.offline_license,
            graph_ref,
        )
        .await;
    }

    let variables = serde_json::json!({
        "apiKey": supergraph.apollo_key,
        "graph_ref": graph_ref,
        "ifAfterId": "",
    });
    let body = uplink::uplink_request(
        client,
        selector,
        LICENSE_QUERY_DOCUMENT,
        variables,
        LICENSE_QUERY,
    )
    .await?;

    let response: LicenseResponse = serde_json::from_slice(&body)
        .map_err(|err| RelayError::Uplink(format!("failed to decode response body: {err}")))?;

    match response.data.router_entitlements {
        RouterEntitlements::RouterEntitlementsResult { id, entitlement, .. } => {
            let expiration = parse_rfc3339(&id)?;
            let jwt = entitlement.map(|entitlement| entitlement.jwt).unwrap_or_default();
            if config.cache.enabled {
                cache_license(cache, graph_ref, &jwt, expiration, config.cache.duration, "")
                    .await?;
            }
            Ok(())
        }
        RouterEntitlements::Unchanged { id, .. } => {
            let expiration = parse_rfc3339(&id)?;
            if config.cache.enabled {
                cache_license(cache, graph_ref, "", expiration, config.cache.duration, "").await?;
            }
            Ok(())
        }
        RouterEntitlements::FetchError { code, message } => {
            Err(RelayError::Uplink(format!("{code}: {message}")))
        }
    }
}

/// Write the license envelope under the conditional key. The entry's
/// expiration is the license expiration uplink reported, not the cache
/// duration.
pub async fn cache_license(
    cache: &dyn Cache,
    graph_ref: &str,
    entitlement_jwt: &str,
    id: DateTime<Utc>,
    duration: i64,
    if_after_id: &str,
) -> Result<()> {
    let item = CacheItem {
        id: format_rfc3339(id),
        content: entitlement_jwt.as_bytes().to_vec(),
        hash: hash_bytes(entitlement_jwt.as_bytes()),
        last_modified: Utc::now(),
        expiration: id,
    };

    if let Err(err) = update_newest(cache, graph_ref, LICENSE_QUERY, &item).await {
        warn!(graph_ref, %err, "failed to promote license to the default key");
    }

    let cache_key = make_cache_key(
        graph_ref,
        LICENSE_QUERY,
        Some(&conditional_args(graph_ref, if_after_id)),
    );
    debug!(graph_ref, cache_key, "caching entitlement");
    let serialized = serde_json::to_vec(&item)?;
    cache.set(&cache_key, &serialized, duration).await
}

//! The relay proxy handler: parse a router's uplink-shaped request, serve
//! it from the cache or a pinned entry, or reverse-proxy it to the next
//! uplink URL and cache the intercepted response.

use std::collections::BTreeMap;
use std::io::Read;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::cache::{CacheItem, format_rfc3339, make_cache_key};
use crate::config::Config;
use crate::core::error::{RelayError, Result};
use crate::core::graph_ref::GraphRef;
use crate::entitlements::{Jwt, LicenseData, LicenseResponse, RouterEntitlements, cache_license};
use crate::persisted_queries::{self, PersistedQueries, PersistedQueriesResponse, decode_id};
use crate::pinning;
use crate::schema::{
    RouterConfig, SupergraphSdlData, SupergraphSdlResponse, cache_schema, parse_rfc3339,
};
use crate::uplink::{
    LICENSE_QUERY, OperationKind, PERSISTED_QUERIES_QUERY, RelayRequest, SUPERGRAPH_QUERY,
};

pub async fn relay_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let config = state.config.current();

    let mut relay_request: RelayRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            error!(%err, "failed to parse request body");
            return RelayError::InvalidRequest("malformed request body".to_string())
                .into_response();
        }
    };
    debug!(
        operation_name = relay_request.operation_name,
        "received relay request"
    );

    let Some(graph_ref) = relay_request
        .variables
        .get("graph_ref")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        error!("missing graph_ref in request body");
        return RelayError::InvalidRequest("missing graph_ref".to_string()).into_response();
    };
    if graph_ref.parse::<GraphRef>().is_err() {
        error!(graph_ref, "failed to parse graph_ref from request body");
        return RelayError::InvalidGraphRef(graph_ref).into_response();
    }

    let operation_name = relay_request.operation_name.clone();

    // The router signs its poll with an API key that polling never sees;
    // strip it so both hash to the same cache slot, and pin a missing or
    // null ifAfterId to the empty string for the same reason.
    relay_request.variables.remove("apiKey");
    let if_after_id = relay_request
        .variables
        .get("ifAfterId")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    relay_request.variables.insert(
        "ifAfterId".to_string(),
        Value::String(if_after_id.clone()),
    );

    let extra_args: BTreeMap<String, Value> = relay_request
        .variables
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let cache_key = make_cache_key(&graph_ref, &operation_name, Some(&extra_args));

    if config.cache.enabled {
        if let Some(content) = state.cache.get(&cache_key).await {
            debug!(cache_key, operation_name, "cache hit");
            match serde_json::from_slice::<CacheItem>(&content) {
                Ok(item) => {
                    return render_cached(
                        &item,
                        &operation_name,
                        config.cache.duration,
                        &if_after_id,
                        false,
                    );
                }
                Err(err) => {
                    error!(%err, "failed to decode cache content");
                    return RelayError::Serialization(err.to_string()).into_response();
                }
            }
        }

        if let Some(supergraph) = config.find_supergraph(&graph_ref) {
            let pinned = match OperationKind::from_operation_name(&operation_name) {
                Some(OperationKind::Schema) => !supergraph.launch_id.is_empty(),
                Some(OperationKind::License) => !supergraph.offline_license.is_empty(),
                Some(OperationKind::PersistedQueries) => {
                    !supergraph.persisted_query_version.is_empty()
                }
                None => false,
            };
            if pinned {
                match pinning::handle_pinned_entry(
                    state.cache.as_ref(),
                    &graph_ref,
                    &operation_name,
                    &if_after_id,
                )
                .await
                {
                    Ok(Some(item)) => {
                        return render_cached(
                            &item,
                            &operation_name,
                            config.cache.duration,
                            &if_after_id,
                            true,
                        );
                    }
                    Ok(None) => {
                        error!(operation_name, "no pinned entry to serve");
                        return RelayError::Pinning("pinned entry missing".to_string())
                            .into_response();
                    }
                    Err(err) => {
                        error!(operation_name, %err, "failed to handle pinned entry");
                        return err.into_response();
                    }
                }
            }
        }
    }

    debug!(cache_key, "cache miss");
    for attempt in 0..=config.uplink.retry_count {
        match proxy_to_uplink(&state, &config, &headers, &body, &cache_key, &relay_request).await {
            Ok(response) => {
                info!(cache_key, "successfully proxied request");
                return response;
            }
            Err(RelayError::NoUplinkAvailable) => {
                error!("no uplink URL is available");
                return RelayError::NoUplinkAvailable.into_response();
            }
            Err(err) => {
                error!(attempt, %err, "request to uplink failed");
                if attempt < config.uplink.retry_count {
                    warn!(operation_name, "retrying request");
                }
            }
        }
    }

    error!(
        operation_name,
        attempts = config.uplink.retry_count,
        "failed to proxy request"
    );
    RelayError::Uplink("failed to proxy request".to_string()).into_response()
}

/// Forward the router's request unchanged to the next uplink URL and run
/// the caching interceptor over the response before it goes back out.
async fn proxy_to_uplink(
    state: &AppState,
    config: &Config,
    headers: &HeaderMap,
    body: &Bytes,
    cache_key: &str,
    relay_request: &RelayRequest,
) -> Result<Response> {
    let target = state.selector.next();
    if target.is_empty() {
        return Err(RelayError::NoUplinkAvailable);
    }

    let mut builder = state.http_client.post(&target).body(body.clone());
    for (name, value) in headers.iter() {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }

    let upstream = builder
        .send()
        .await
        .map_err(|err| RelayError::Uplink(err.to_string()))?;
    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    let raw_body = upstream
        .bytes()
        .await
        .map_err(|err| RelayError::Uplink(err.to_string()))?;

    let is_gzip = response_headers
        .get(header::CONTENT_ENCODING)
        .map(|encoding| encoding.as_bytes() == b"gzip")
        .unwrap_or(false);
    let response_body = if is_gzip {
        debug!("decompressing response body");
        let mut decoder = GzDecoder::new(raw_body.as_ref());
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).map_err(|err| {
            RelayError::Uplink(format!("failed to decompress response body: {err}"))
        })?;
        response_headers.remove(header::CONTENT_ENCODING);
        decoded
    } else {
        raw_body.to_vec()
    };

    let final_body = intercept_response(state, config, cache_key, relay_request, response_body)
        .await?;

    // The body may have been inflated or rewritten.
    response_headers.remove(header::TRANSFER_ENCODING);
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(final_body.len()));

    let mut response = Response::new(Body::from(final_body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Parse the uplink response according to the operation and write the
/// matching cache entry; persisted-query manifests additionally get their
/// chunk URLs rewritten, which changes the bytes the router receives.
async fn intercept_response(
    state: &AppState,
    config: &Config,
    cache_key: &str,
    relay_request: &RelayRequest,
    body: Vec<u8>,
) -> Result<Vec<u8>> {
    let graph_ref = relay_request
        .variables
        .get("graph_ref")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let if_after_id = relay_request
        .variables
        .get("ifAfterId")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    match relay_request.operation_name.as_str() {
        SUPERGRAPH_QUERY => {
            let response: SupergraphSdlResponse = match serde_json::from_slice(&body) {
                Ok(response) => response,
                Err(err) => {
                    error!(%err, "failed to decode uplink response body");
                    return Ok(body);
                }
            };
            match response.data.router_config {
                RouterConfig::RouterConfigResult {
                    id, supergraph_sdl, ..
                } => {
                    let id = parse_rfc3339(&id)?;
                    if config.cache.enabled {
                        debug!(cache_key, "caching schema");
                        cache_schema(
                            state.cache.as_ref(),
                            &graph_ref,
                            &supergraph_sdl,
                            id,
                            &if_after_id,
                            config.cache.duration,
                        )
                        .await?;
                    }
                }
                RouterConfig::Unchanged { id, .. } => {
                    let id = parse_rfc3339(&id)?;
                    if config.cache.enabled {
                        cache_schema(
                            state.cache.as_ref(),
                            &graph_ref,
                            "",
                            id,
                            &if_after_id,
                            config.cache.duration,
                        )
                        .await?;
                    }
                }
                RouterConfig::FetchError { code, message } => {
                    warn!(code, message, "uplink returned a fetch error");
                }
            }
            Ok(body)
        }
        LICENSE_QUERY => {
            let response: LicenseResponse = match serde_json::from_slice(&body) {
                Ok(response) => response,
                Err(err) => {
                    error!(%err, "failed to decode uplink response body");
                    return Ok(body);
                }
            };
            match response.data.router_entitlements {
                RouterEntitlements::RouterEntitlementsResult { id, entitlement, .. } => {
                    let expiration = parse_rfc3339(&id)?;
                    let jwt = entitlement
                        .map(|entitlement| entitlement.jwt)
                        .unwrap_or_default();
                    if config.cache.enabled {
                        debug!(cache_key, "caching JWT");
                        if let Err(err) = cache_license(
                            state.cache.as_ref(),
                            &graph_ref,
                            &jwt,
                            expiration,
                            config.cache.duration,
                            &if_after_id,
                        )
                        .await
                        {
                            // The router still gets the license it asked for.
                            error!(%err, "failed to cache license");
                        }
                    }
                }
                RouterEntitlements::Unchanged { id, .. } => {
                    let expiration = parse_rfc3339(&id)?;
                    if config.cache.enabled {
                        if let Err(err) = cache_license(
                            state.cache.as_ref(),
                            &graph_ref,
                            "",
                            expiration,
                            config.cache.duration,
                            &if_after_id,
                        )
                        .await
                        {
                            error!(%err, "failed to cache license");
                        }
                    }
                }
                RouterEntitlements::FetchError { code, message } => {
                    warn!(code, message, "uplink returned a fetch error");
                }
            }
            Ok(body)
        }
        PERSISTED_QUERIES_QUERY => {
            let mut response: PersistedQueriesResponse = match serde_json::from_slice(&body) {
                Ok(response) => response,
                Err(err) => {
                    error!(%err, "failed to decode uplink response body");
                    return Ok(body);
                }
            };
            if !config.cache.enabled {
                return Ok(body);
            }

            match response.data.persisted_queries {
                PersistedQueries::PersistedQueriesResult {
                    id,
                    min_delay_seconds,
                    chunks,
                } => {
                    let chunks = persisted_queries::cache_chunk_data(
                        config,
                        state.cache.as_ref(),
                        &state.http_client,
                        chunks,
                    )
                    .await?;
                    response.data.persisted_queries = PersistedQueries::PersistedQueriesResult {
                        id: id.clone(),
                        min_delay_seconds,
                        chunks,
                    };
                    let rewritten = serde_json::to_vec(&response)?;

                    debug!(cache_key, "caching persisted query manifest");
                    let item = CacheItem::new(id, rewritten.clone(), config.cache.duration);
                    let serialized = serde_json::to_vec(&item)?;
                    if let Err(err) =
                        state.cache.set(cache_key, &serialized, config.cache.duration).await
                    {
                        error!(%err, "failed to cache response");
                    }
                    if let Err(err) = crate::cache::update_newest(
                        state.cache.as_ref(),
                        &graph_ref,
                        PERSISTED_QUERIES_QUERY,
                        &item,
                    )
                    .await
                    {
                        error!(%err, "failed to promote manifest to the default key");
                    }
                    Ok(rewritten)
                }
                PersistedQueries::Unchanged { ref id, .. } => {
                    // Cached under the conditional key only; an Unchanged
                    // envelope must not replace the default slot.
                    let item = CacheItem::new(id.clone(), body.clone(), config.cache.duration);
                    let serialized = serde_json::to_vec(&item)?;
                    if let Err(err) =
                        state.cache.set(cache_key, &serialized, config.cache.duration).await
                    {
                        error!(%err, "failed to cache response");
                    }
                    Ok(body)
                }
                PersistedQueries::FetchError { ref code, ref message } => {
                    warn!(code, message, "uplink returned a fetch error");
                    Ok(body)
                }
            }
        }
        other => {
            warn!(operation_name = other, "unknown operation name");
            Ok(body)
        }
    }
}

/// Current time floored to the cache duration, so colocated routers
/// converge on the same conditional token.
fn rounded_timestamp(duration: i64) -> String {
    let now = Utc::now();
    if duration > 0 {
        let floored = now.timestamp() - now.timestamp().rem_euclid(duration);
        if let Some(instant) = DateTime::<Utc>::from_timestamp(floored, 0) {
            return format_rfc3339(instant);
        }
    }
    format_rfc3339(now)
}

/// Synthesize an uplink-shaped response from a cached envelope. Pinned
/// schema entries report their launch completion time as the id; live
/// entries report the rounded current time.
fn render_cached(
    item: &CacheItem,
    operation_name: &str,
    duration: i64,
    if_after_id: &str,
    pinned: bool,
) -> Response {
    let payload = match operation_name {
        SUPERGRAPH_QUERY => {
            let timestamp = if pinned {
                format_rfc3339(item.last_modified)
            } else {
                rounded_timestamp(duration)
            };
            let router_config = if item.content.is_empty() {
                RouterConfig::Unchanged {
                    id: timestamp,
                    min_delay_seconds: 30.0,
                }
            } else {
                RouterConfig::RouterConfigResult {
                    id: timestamp,
                    supergraph_sdl: String::from_utf8_lossy(&item.content).into_owned(),
                    min_delay_seconds: 30.0,
                }
            };
            serde_json::to_value(SupergraphSdlResponse {
                data: SupergraphSdlData { router_config },
            })
        }
        LICENSE_QUERY => {
            let router_entitlements = if item.content.is_empty() {
                RouterEntitlements::Unchanged {
                    id: item.id.clone(),
                    min_delay_seconds: 60.0,
                }
            } else {
                RouterEntitlements::RouterEntitlementsResult {
                    id: item.id.clone(),
                    min_delay_seconds: 60.0,
                    entitlement: Some(Jwt {
                        jwt: String::from_utf8_lossy(&item.content).into_owned(),
                    }),
                }
            };
            serde_json::to_value(LicenseResponse {
                data: LicenseData {
                    router_entitlements,
                },
            })
        }
        PERSISTED_QUERIES_QUERY => {
            if item.content.is_empty() {
                serde_json::to_value(unchanged_manifest(&item.id))
            } else {
                let mut cached: PersistedQueriesResponse =
                    match serde_json::from_slice(&item.content) {
                        Ok(cached) => cached,
                        Err(err) => {
                            error!(%err, "failed to decode cached manifest");
                            return RelayError::Serialization(err.to_string()).into_response();
                        }
                    };
                let unchanged_id = match &cached.data.persisted_queries {
                    PersistedQueries::PersistedQueriesResult { id, .. } => {
                        let (cached_id, cached_version) = decode_id(id);
                        let (after_id, after_version) = decode_id(if_after_id);
                        debug!(
                            cached_id,
                            cached_version, after_id, after_version, "comparing manifest versions"
                        );
                        // The router already holds this manifest (or a
                        // later one); confirm without re-sending chunks.
                        (cached_id == after_id && after_version >= cached_version)
                            .then(|| id.clone())
                    }
                    _ => None,
                };
                if let Some(id) = unchanged_id {
                    cached.data.persisted_queries = PersistedQueries::Unchanged {
                        id,
                        min_delay_seconds: 60.0,
                    };
                }
                serde_json::to_value(cached)
            }
        }
        other => {
            error!(operation_name = other, "no cached rendering for operation");
            return RelayError::Internal(format!("unknown operation {other}")).into_response();
        }
    };

    let payload = match payload {
        Ok(payload) => payload,
        Err(err) => {
            error!(%err, "failed to serialize cached response");
            return RelayError::Serialization(err.to_string()).into_response();
        }
    };

    let mut response = axum::Json(payload).into_response();
    response
        .headers_mut()
        .insert("X-Cache-Hit", HeaderValue::from_static("true"));
    response
}

fn unchanged_manifest(id: &str) -> PersistedQueriesResponse {
    PersistedQueriesResponse {
        data: persisted_queries::PersistedQueriesData {
            persisted_queries: PersistedQueries::Unchanged {
                id: id.to_string(),
                min_delay_seconds: 60.0,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::never_expires;
    use crate::core::hash::hash_bytes;

    fn schema_item(content: &[u8]) -> CacheItem {
        CacheItem {
            content: content.to_vec(),
            expiration: never_expires(),
            hash: hash_bytes(content),
            last_modified: Utc::now(),
            id: "2024-10-03T12:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_rounded_timestamp_floors_to_duration() {
        let rendered = rounded_timestamp(3600);
        let parsed = DateTime::parse_from_rfc3339(&rendered).unwrap();
        assert_eq!(parsed.timestamp() % 3600, 0);
        assert!(parsed.timestamp() <= Utc::now().timestamp());
    }

    #[test]
    fn test_rounded_timestamp_without_duration() {
        let rendered = rounded_timestamp(-1);
        assert!(DateTime::parse_from_rfc3339(&rendered).is_ok());
    }

    #[test]
    fn test_render_cached_schema_hit() {
        let response = render_cached(&schema_item(b"SDL"), SUPERGRAPH_QUERY, 60, "", false);
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        assert_eq!(
            response.headers().get("X-Cache-Hit").unwrap(),
            &HeaderValue::from_static("true")
        );
    }

    #[test]
    fn test_render_pinned_schema_reports_completion_time() {
        let item = schema_item(b"SDL");
        let response = render_cached(&item, SUPERGRAPH_QUERY, 60, "", true);
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[test]
    fn test_unchanged_variant_serializes_typename() {
        let payload = SupergraphSdlResponse {
            data: SupergraphSdlData {
                router_config: RouterConfig::Unchanged {
                    id: "2024-10-03T12:00:00Z".to_string(),
                    min_delay_seconds: 30.0,
                },
            },
        };
        let encoded = serde_json::to_string(&payload).unwrap();
        assert!(encoded.contains(r#""__typename":"Unchanged""#));
        assert!(!encoded.contains("supergraphSdl"));
    }
}

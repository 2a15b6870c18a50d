use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{LICENSE_PINNED, insert_pinned_entry};
use crate::cache::{Cache, format_rfc3339, make_cache_key};
use crate::config::Config;
use crate::core::error::{RelayError, Result};

/// Only `warnAt` matters here; the rest of the claims stay untouched.
#[derive(Debug, Deserialize)]
struct LicenseClaims {
    #[serde(rename = "warnAt")]
    warn_at: i64,
}

/// Pin an offline license. The entry's timestamps derive from the JWT's
/// `warnAt` minus 30 days, so every relay replica produces an identical
/// entry for the same license input.
pub async fn pin_offline_license(
    config: &Config,
    cache: &dyn Cache,
    license: &str,
    graph_ref: &str,
) -> Result<()> {
    debug!(graph_ref, "pinning license");

    let claims = decode_claims(license)?;
    let warn_at = DateTime::<Utc>::from_timestamp(claims.warn_at, 0)
        .ok_or_else(|| RelayError::Pinning(format!("warnAt out of range: {}", claims.warn_at)))?;
    let modified = warn_at - Duration::days(30);

    if config.cache.enabled {
        let cache_key = make_cache_key(graph_ref, LICENSE_PINNED, None);
        insert_pinned_entry(
            cache,
            &cache_key,
            license.as_bytes().to_vec(),
            &format_rfc3339(modified),
            modified,
            modified,
        )
        .await;
    }
    Ok(())
}

/// Decode the JWT payload without verifying the signature; entitlement
/// enforcement belongs to the router, the relay only needs `warnAt`.
fn decode_claims(license: &str) -> Result<LicenseClaims> {
    let payload = license
        .split('.')
        .nth(1)
        .ok_or_else(|| RelayError::Pinning("malformed license JWT".to_string()))?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .map_err(|err| RelayError::Pinning(format!("failed to decode license payload: {err}")))?;
    serde_json::from_slice(&decoded)
        .map_err(|err| RelayError::Pinning(format!("failed to decode license claims: {err}")))
}

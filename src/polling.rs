//! Background polling: refreshes every configured graph's artifacts on a
//! fixed interval or on cron schedules, until cancelled.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::config::SharedConfig;
use crate::entitlements;
use crate::persisted_queries;
use crate::schema;
use crate::uplink::RoundRobinSelector;

/// Run the polling loop. Returns when the stop channel fires or, for cron
/// scheduling, when no expression has a future fire time. Validation
/// guarantees the interval and cron branches are mutually exclusive.
pub async fn start_polling(
    shared: SharedConfig,
    cache: Arc<dyn Cache>,
    client: reqwest::Client,
    selector: Arc<RoundRobinSelector>,
    mut stop: mpsc::Receiver<bool>,
) {
    let config = shared.current();
    if !config.polling.enabled {
        debug!("polling is disabled");
        return;
    }
    info!("polling started");

    poll_for_updates(&shared, cache.as_ref(), &client, &selector).await;

    if config.polling.interval > 0 {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.polling.interval));
        // The interval's immediate first tick is covered by the pass above.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.recv() => {
                    debug!("polling stopped");
                    return;
                }
                _ = ticker.tick() => {
                    poll_for_updates(&shared, cache.as_ref(), &client, &selector).await;
                }
            }
        }
    } else if !config.polling.cron_expressions.is_empty() {
        let mut schedules = Vec::with_capacity(config.polling.cron_expressions.len());
        for expression in &config.polling.cron_expressions {
            match cron::Schedule::from_str(expression) {
                Ok(schedule) => schedules.push(schedule),
                Err(err) => {
                    error!(expression, %err, "failed to parse cron expression");
                    return;
                }
            }
        }
        loop {
            let now = Utc::now();
            let next = schedules
                .iter()
                .filter_map(|schedule| schedule.after(&now).next())
                .min();
            let Some(next) = next else {
                warn!("no cron expression has a future fire time");
                return;
            };
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = stop.recv() => {
                    debug!("polling stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {
                    poll_for_updates(&shared, cache.as_ref(), &client, &selector).await;
                }
            }
        }
    }
}

/// One polling pass: graphs in configuration order; per graph schema,
/// then license, then persisted queries, skipping pinned artifacts. A
/// failed pass for one graph never stops the others.
pub async fn poll_for_updates(
    shared: &SharedConfig,
    cache: &dyn Cache,
    client: &reqwest::Client,
    selector: &RoundRobinSelector,
) {
    let config = shared.current();
    if !config.polling.enabled {
        debug!("polling is disabled");
        return;
    }
    if !config.polling.supergraph && !config.polling.entitlements && !config.polling.persisted_queries
    {
        warn!("polling is disabled for all artifacts");
        return;
    }

    for supergraph in &config.supergraphs {
        let graph_ref = supergraph.graph_ref.as_str();
        let mut success = false;

        'attempts: for attempt in 0..config.polling.retry_count {
            debug!(graph_ref, attempt, "polling for graph");

            if config.polling.supergraph && supergraph.launch_id.is_empty() {
                if let Err(err) =
                    schema::fetch_schema(shared, cache, client, selector, graph_ref).await
                {
                    error!(graph_ref, %err, "failed to fetch schema");
                    continue 'attempts;
                }
            }

            if config.polling.entitlements && supergraph.offline_license.is_empty() {
                if let Err(err) =
                    entitlements::fetch_router_license(shared, cache, client, selector, graph_ref)
                        .await
                {
                    error!(graph_ref, %err, "failed to fetch router license");
                    continue 'attempts;
                }
            }

            if config.polling.persisted_queries && supergraph.persisted_query_version.is_empty() {
                if let Err(err) = persisted_queries::fetch_pq_manifest(
                    shared, cache, client, selector, graph_ref, "",
                )
                .await
                {
                    error!(graph_ref, %err, "failed to fetch persisted query manifest");
                    continue 'attempts;
                }
            }

            success = true;
            break;
        }

        if success {
            info!(graph_ref, "successfully polled for graph");
        } else {
            error!(
                graph_ref,
                retries = config.polling.retry_count,
                "failed to poll uplink for graph"
            );
        }
    }
}

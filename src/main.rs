use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uplink_relay::cache::TieredCache;
use uplink_relay::polling::start_polling;
use uplink_relay::{
    AppState, Cache, Config, FilesystemCache, MemoryCache, RedisCache, RoundRobinSelector,
    SharedConfig, create_router,
};

#[derive(Parser, Debug)]
#[command(name = "uplink-relay")]
#[command(about = "Caching reverse proxy between graph routers and uplink", version)]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Print the JSON schema for the configuration file and exit
    #[arg(long)]
    config_schema: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if args.debug { "debug" } else { "info" })
            }),
        )
        .init();

    if args.config_schema {
        println!("{}", uplink_relay::config::config_json_schema()?);
        return Ok(());
    }

    let config = Config::load(&args.config).context("could not load configuration")?;
    config.validate().context("invalid configuration")?;

    let mut cache = build_cache(&config).await?;
    let shared = SharedConfig::new(config);

    let (mut stop_polling, stop_receiver) = mpsc::channel::<bool>(1);
    let mut server = startup(&shared, Arc::clone(&cache), stop_receiver).await?;

    let mut reload = signal(SignalKind::hangup()).context("failed to register signal handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to register signal handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to register signal handler")?;

    loop {
        tokio::select! {
            _ = reload.recv() => {
                info!("reloading configuration");
                server.shutdown().await;
                // Non-blocking: the scheduler drains the channel and exits.
                let _ = stop_polling.try_send(true);

                let new_config = Config::load(&args.config).context("could not load configuration")?;
                new_config.validate().context("invalid configuration")?;
                cache = build_cache(&new_config).await?;
                shared.store(new_config);

                let (sender, receiver) = mpsc::channel::<bool>(1);
                stop_polling = sender;
                server = startup(&shared, Arc::clone(&cache), receiver).await?;
            }
            _ = terminate.recv() => break,
            _ = interrupt.recv() => break,
        }
    }

    server.shutdown().await;
    Ok(())
}

/// Assemble the cache stack from the configuration: memory, filesystem and
/// redis layers in that order, composed as a tiered cache when more than
/// one is enabled.
async fn build_cache(config: &Config) -> Result<Arc<dyn Cache>> {
    let mut layers: Vec<Arc<dyn Cache>> = Vec::new();

    if config.cache.enabled {
        layers.push(Arc::new(MemoryCache::new(config.cache.max_size)));
    }
    if config.filesystem.enabled {
        info!(directory = config.filesystem.directory, "using filesystem cache");
        layers.push(Arc::new(
            FilesystemCache::new(&config.filesystem.directory)
                .context("failed to create filesystem cache")?,
        ));
    }
    if config.redis.enabled {
        info!(address = config.redis.address, "using redis cache");
        layers.push(Arc::new(
            RedisCache::connect(
                &config.redis.address,
                &config.redis.password,
                config.redis.database,
            )
            .await
            .context("failed to connect to redis")?,
        ));
    }

    match layers.len() {
        0 => bail!("no cache configured"),
        1 => Ok(layers.remove(0)),
        _ => Ok(Arc::new(TieredCache::new(layers, config.cache.duration))),
    }
}

struct ServerHandle {
    handle: axum_server::Handle,
    task: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    /// Gracefully drain in-flight requests, dropping any still open after
    /// five seconds.
    async fn shutdown(&mut self) {
        self.handle
            .graceful_shutdown(Some(Duration::from_secs(5)));
        match (&mut self.task).await {
            Ok(Ok(())) => info!("uplink relay shut down properly"),
            Ok(Err(err)) => error!(%err, "uplink relay shutdown"),
            Err(err) => error!(%err, "uplink relay server task failed"),
        }
    }
}

/// Bring the relay up from the current configuration: install pinned
/// artifacts, start polling, and serve a freshly built router.
async fn startup(
    shared: &SharedConfig,
    cache: Arc<dyn Cache>,
    stop_polling: mpsc::Receiver<bool>,
) -> Result<ServerHandle> {
    let config = shared.current();

    let selector = Arc::new(RoundRobinSelector::new(config.uplink.urls.clone()));
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.uplink.timeout))
        .build()
        .context("failed to build HTTP client")?;

    // Startup pinning failures leave the previous state untouched.
    for supergraph in &config.supergraphs {
        if !supergraph.launch_id.is_empty() {
            if let Err(err) = uplink_relay::pinning::pin_launch_id(
                shared,
                cache.as_ref(),
                &http_client,
                &supergraph.launch_id,
                &supergraph.graph_ref,
            )
            .await
            {
                error!(
                    graph_ref = supergraph.graph_ref,
                    launch_id = supergraph.launch_id,
                    %err,
                    "failed to pin launch ID"
                );
            }
        }
        if !supergraph.offline_license.is_empty() {
            if let Err(err) = uplink_relay::pinning::pin_offline_license(
                &config,
                cache.as_ref(),
                &supergraph.offline_license,
                &supergraph.graph_ref,
            )
            .await
            {
                error!(graph_ref = supergraph.graph_ref, %err, "failed to pin offline license");
            }
        }
        if !supergraph.persisted_query_version.is_empty() {
            if let Err(err) = uplink_relay::pinning::pin_persisted_queries(
                shared,
                cache.as_ref(),
                &http_client,
                &supergraph.graph_ref,
                &supergraph.persisted_query_version,
            )
            .await
            {
                error!(
                    graph_ref = supergraph.graph_ref,
                    version = supergraph.persisted_query_version,
                    %err,
                    "failed to pin persisted queries"
                );
            }
        }
    }

    if config.polling.enabled {
        tokio::spawn(start_polling(
            shared.clone(),
            Arc::clone(&cache),
            http_client.clone(),
            Arc::clone(&selector),
            stop_polling,
        ));
    }

    let state = AppState {
        config: shared.clone(),
        cache,
        selector,
        http_client,
    };
    let app = create_router(state);

    let address = tokio::net::lookup_host(&config.relay.address)
        .await
        .context("could not resolve relay address")?
        .next()
        .context("could not resolve relay address")?;
    info!(address = config.relay.address, "starting uplink relay 🛰");

    let handle = axum_server::Handle::new();
    let task = if !config.relay.tls.cert.is_empty() && !config.relay.tls.key.is_empty() {
        let tls = RustlsConfig::from_pem_file(&config.relay.tls.cert, &config.relay.tls.key)
            .await
            .context("failed to load TLS certificate")?;
        tokio::spawn(
            axum_server::bind_rustls(address, tls)
                .handle(handle.clone())
                .serve(app.into_make_service()),
        )
    } else {
        tokio::spawn(
            axum_server::bind(address)
                .handle(handle.clone())
                .serve(app.into_make_service()),
        )
    };

    Ok(ServerHandle { handle, task })
}

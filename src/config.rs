use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::error::{RelayError, Result};

/// Top-level relay configuration, loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Settings for the listener routers connect to.
    pub relay: RelayConfig,
    /// Settings for the upstream uplink endpoints.
    pub uplink: UplinkConfig,
    /// In-memory cache settings.
    pub cache: CacheConfig,
    /// Redis cache layer settings.
    pub redis: RedisConfig,
    /// Filesystem cache layer settings.
    pub filesystem: FilesystemConfig,
    /// Per-graph credentials and pin selectors.
    pub supergraphs: Vec<SupergraphConfig>,
    /// Schema-change webhook settings.
    pub webhook: WebhookConfig,
    /// Background polling settings.
    pub polling: PollingConfig,
    /// Management API settings (recognized but no surface is mounted).
    #[serde(rename = "managementAPI")]
    pub management_api: ManagementApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind the relay server on, e.g. `0.0.0.0:8000`.
    pub address: String,
    pub tls: RelayTlsConfig,
    /// Public URL advertised in rewritten persisted-query chunk URLs.
    #[serde(rename = "publicURL")]
    pub public_url: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8080".to_string(),
            tls: RelayTlsConfig::default(),
            public_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RelayTlsConfig {
    /// Path to the certificate file.
    pub cert: String,
    /// Path to the key file.
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct UplinkConfig {
    /// Uplink URLs, rotated round-robin.
    pub urls: Vec<String>,
    /// Timeout for uplink requests, in seconds.
    pub timeout: u64,
    /// Number of retries after a failed uplink request.
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
    /// URL for the studio API, used for pinning.
    #[serde(rename = "studioAPIURL")]
    pub studio_api_url: String,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            urls: vec!["http://localhost:8081".to_string()],
            timeout: 30,
            retry_count: 1,
            studio_api_url: "https://graphql.api.apollographql.com/api/graphql".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether in-memory caching is enabled.
    pub enabled: bool,
    /// Duration to keep cached content, in seconds; -1 means forever.
    pub duration: i64,
    /// Maximum number of items in the in-memory cache.
    #[serde(rename = "maxSize")]
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duration: -1,
            max_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    /// Address of the Redis server, e.g. `localhost:6379`.
    pub address: String,
    pub password: String,
    pub database: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct FilesystemConfig {
    pub enabled: bool,
    /// Directory holding the cache files.
    pub directory: String,
}

/// Per-graph record with API credentials and optional pin selectors. A
/// non-empty pin selector means "serve pinned, do not poll live".
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SupergraphConfig {
    #[serde(rename = "graphRef")]
    pub graph_ref: String,
    #[serde(rename = "apolloKey")]
    pub apollo_key: String,
    #[serde(rename = "launchID")]
    pub launch_id: String,
    #[serde(rename = "persistedQueryVersion")]
    pub persisted_query_version: String,
    #[serde(rename = "offlineLicense")]
    pub offline_license: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    /// Path to bind the webhook handler on.
    pub path: String,
    /// Secret for verifying webhook signatures.
    pub secret: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/webhook".to_string(),
            secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PollingConfig {
    pub enabled: bool,
    /// Polling interval in seconds. Mutually exclusive with
    /// `cronExpressions`.
    pub interval: u64,
    /// Cron expressions to poll on. Mutually exclusive with `interval`.
    #[serde(rename = "cronExpressions")]
    pub cron_expressions: Vec<String>,
    /// Attempts per graph per polling pass.
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
    /// Whether to poll for entitlements.
    pub entitlements: bool,
    /// Whether to poll for the supergraph schema.
    pub supergraph: bool,
    /// Whether to poll for persisted queries.
    #[serde(rename = "persistedQueries")]
    pub persisted_queries: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 0,
            cron_expressions: Vec::new(),
            retry_count: 1,
            entitlements: true,
            supergraph: true,
            persisted_queries: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ManagementApiConfig {
    pub enabled: bool,
    pub path: String,
    pub secret: String,
}

impl Default for ManagementApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/graphql".to_string(),
            secret: String::new(),
        }
    }
}

impl Config {
    /// Load a YAML configuration file, expanding environment variables in
    /// every string field before anything reads them.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        expand_env_vars(&mut config);
        Ok(config)
    }

    pub fn find_supergraph(&self, graph_ref: &str) -> Option<&SupergraphConfig> {
        self.supergraphs
            .iter()
            .find(|supergraph| supergraph.graph_ref == graph_ref)
    }

    /// Validate the configuration. Called once at startup and again on
    /// every reload; failures are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.relay.address.is_empty() {
            return Err(RelayError::Config(
                "relay address cannot be empty".to_string(),
            ));
        }

        if !self.relay.public_url.is_empty() {
            let parsed = url::Url::parse(&self.relay.public_url)
                .map_err(|err| RelayError::Config(format!("invalid publicURL: {err}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(RelayError::Config(format!(
                    "invalid publicURL scheme \"{}\"; must be one of \"http\" or \"https\"",
                    parsed.scheme()
                )));
            }
            if parsed.host_str().is_none() {
                return Err(RelayError::Config(format!(
                    "invalid publicURL: {}",
                    self.relay.public_url
                )));
            }
        }

        if self.uplink.urls.is_empty() {
            return Err(RelayError::Config(
                "uplink URLs cannot be empty".to_string(),
            ));
        }
        if self.uplink.retry_count < 1 {
            return Err(RelayError::Config(
                "uplink retryCount must be at least 1".to_string(),
            ));
        }

        if self.cache.duration <= 0 && self.cache.duration != -1 {
            return Err(RelayError::Config(
                "cache duration must be positive".to_string(),
            ));
        }
        if self.cache.max_size == 0 {
            return Err(RelayError::Config(
                "cache maxSize must be positive".to_string(),
            ));
        }

        if self.webhook.enabled && !self.webhook.path.starts_with('/') {
            return Err(RelayError::Config(
                "webhook path must start with '/' when webhook is enabled".to_string(),
            ));
        }

        if self.polling.enabled {
            if !self.polling.cron_expressions.is_empty() {
                if self.polling.interval > 0 {
                    return Err(RelayError::Config(
                        "cannot use both interval and cronExpressions for polling".to_string(),
                    ));
                }
                for expression in &self.polling.cron_expressions {
                    cron::Schedule::from_str(expression).map_err(|err| {
                        RelayError::Config(format!("invalid cron expression: {err}"))
                    })?;
                }
            } else if self.polling.interval == 0 {
                return Err(RelayError::Config(
                    "polling interval must be positive".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Atomically replaceable handle to the active configuration. Readers that
/// captured the previous pointer finish their request with it; new reads
/// observe the replacement.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.inner.read().clone()
    }

    pub fn store(&self, config: Config) {
        *self.inner.write() = Arc::new(config);
    }

    /// Record a newly pinned selector on the named graph.
    pub fn update_supergraph(
        &self,
        graph_ref: &str,
        update: impl FnOnce(&mut SupergraphConfig),
    ) {
        let mut guard = self.inner.write();
        let mut config = (**guard).clone();
        if let Some(supergraph) = config
            .supergraphs
            .iter_mut()
            .find(|supergraph| supergraph.graph_ref == graph_ref)
        {
            update(supergraph);
        }
        *guard = Arc::new(config);
    }
}

/// Pretty-printed JSON schema for the configuration file.
pub fn config_json_schema() -> Result<String> {
    let schema = schemars::schema_for!(Config);
    serde_json::to_string_pretty(&schema).map_err(|err| RelayError::Serialization(err.to_string()))
}

/// Expand `$VAR` and `${VAR}` in every string field of the configuration.
/// The walk is explicit so a new field has to be added here to opt in.
fn expand_env_vars(config: &mut Config) {
    expand(&mut config.relay.address);
    expand(&mut config.relay.tls.cert);
    expand(&mut config.relay.tls.key);
    expand(&mut config.relay.public_url);
    for uplink_url in &mut config.uplink.urls {
        expand(uplink_url);
    }
    expand(&mut config.uplink.studio_api_url);
    expand(&mut config.redis.address);
    expand(&mut config.redis.password);
    expand(&mut config.filesystem.directory);
    for supergraph in &mut config.supergraphs {
        expand(&mut supergraph.graph_ref);
        expand(&mut supergraph.apollo_key);
        expand(&mut supergraph.launch_id);
        expand(&mut supergraph.persisted_query_version);
        expand(&mut supergraph.offline_license);
    }
    expand(&mut config.webhook.path);
    expand(&mut config.webhook.secret);
    for expression in &mut config.polling.cron_expressions {
        expand(expression);
    }
    expand(&mut config.management_api.path);
    expand(&mut config.management_api.secret);
}

fn expand(value: &mut String) {
    if value.contains('$') {
        *value = expand_env(value);
    }
}

fn is_var_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `$VAR` / `${VAR}` expansion against the process environment; unknown
/// variables expand to the empty string.
fn expand_env(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            output.push(c);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    output.push_str(&std::env::var(&name).unwrap_or_default());
                } else {
                    output.push_str("${");
                    output.push_str(&name);
                }
            }
            Some(&c) if is_var_char(c) => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_var_char(c) {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
                output.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => output.push('$'),
        }
    }
    output
}

pub mod chunks;
pub mod relay;
pub mod router;

use std::sync::Arc;

use crate::cache::Cache;
use crate::config::SharedConfig;
use crate::uplink::RoundRobinSelector;

pub use router::create_router;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub cache: Arc<dyn Cache>,
    pub selector: Arc<RoundRobinSelector>,
    pub http_client: reqwest::Client,
}

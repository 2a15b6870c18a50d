pub mod cache;
pub mod config;
pub mod core;
pub mod entitlements;
pub mod persisted_queries;
pub mod pinning;
pub mod polling;
pub mod schema;
pub mod server;
pub mod uplink;
pub mod webhooks;

// Re-export commonly used types
pub use crate::cache::{Cache, CacheItem, FilesystemCache, MemoryCache, RedisCache, TieredCache};
pub use crate::config::{Config, SharedConfig, SupergraphConfig};
pub use crate::core::{GraphRef, RelayError};
pub use crate::server::{AppState, create_router};
pub use crate::uplink::RoundRobinSelector;

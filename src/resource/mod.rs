//! Resource fetching and segment caching
//!
//! - [`ResourceFetcher`]: host-supplied HTTP-like primitive
//! - [`AssetCache`]: coalescing LRU over segment bytes plus the idle-clip preload set
//! - [`ThroughputTracker`]: bandwidth estimate driving prefetch depth
//! - [`Signer`] and [`SessionService`]: signed session start/stop calls

mod asset_cache;
mod service;
mod signing;
mod throughput;

pub use asset_cache::{AssetCache, AssetCacheConfig};
pub use service::SessionService;
pub use signing::{SignedHeaders, Signer, canonical_json};
pub use throughput::ThroughputTracker;

use bytes::Bytes;
use serde_json::Value;

use crate::Result;

/// Download progress callback: `(received, total)`.
pub type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Network primitives the host provides.
#[async_trait::async_trait]
pub trait ResourceFetcher: Send + Sync + 'static {
    /// Download a blob.
    async fn fetch_bytes(&self, url: &str, progress: Option<&ProgressFn>) -> Result<Bytes>;

    /// POST a JSON body with extra headers and return the JSON response.
    async fn post_json(
        &self,
        url: &str,
        body: Value,
        headers: &[(String, String)],
    ) -> Result<Value>;
}

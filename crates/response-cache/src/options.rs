use std::time::Duration;

/// Tunables consumed by the orchestrator, the key provider and the body buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Largest body that will be buffered for caching. Bigger bodies still stream to the
    /// client, they just aren't stored.
    pub maximum_body_size: u64,
    /// Size of each body shard in bytes.
    pub shard_size: usize,
    /// Whether `/Path` and `/path` are distinct resources.
    pub case_sensitive_paths: bool,
    /// Lifetime of entries whose response declares no freshness information.
    pub default_ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            maximum_body_size: 1024 * 1024,
            shard_size: 64 * 1024,
            case_sensitive_paths: false,
            default_ttl: Duration::from_secs(10),
        }
    }
}

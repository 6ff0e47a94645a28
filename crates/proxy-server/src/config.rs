use crate::cache_layer::{CacheState, Caching};
use arc_swap::ArcSwap;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use response_cache::distributed::{MemoryBlobStore, ShardedResponseStore};
use response_cache::memory::MemoryResponseStore;
use response_cache::{CacheOptions, ResponseCacheStore, ResponseCaching};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Where cached entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Entries held as values.
    Memory,
    /// Entries serialized into a byte store, one value per body shard.
    Sharded,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_backend")]
    pub backend: Backend,
    #[serde(default = "default_ttl")]
    pub default_ttl_seconds: u64,
    #[serde(default = "default_max_body_size")]
    pub max_body_size_bytes: u64,
    #[serde(default = "default_shard_size")]
    pub shard_size_bytes: usize,
    #[serde(default)]
    pub case_sensitive_paths: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// A missing or broken file is logged and replaced by the defaults.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Self::default_config();
        }
        match Self::load(path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "config loaded");
                config
            }
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "invalid config, using defaults"
                );
                Self::default_config()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = toml::from_str(contents)?;
        if config.cache.capacity == 0 {
            return Err("cache.capacity must be > 0".into());
        }
        if config.cache.shard_size_bytes == 0 {
            return Err("cache.shard_size_bytes must be > 0".into());
        }
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                url: "http://127.0.0.1:3000".to_string(),
                timeout_ms: default_timeout_ms(),
            },
            cache: CacheConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn options(&self) -> CacheOptions {
        CacheOptions {
            maximum_body_size: self.max_body_size_bytes,
            shard_size: self.shard_size_bytes,
            case_sensitive_paths: self.case_sensitive_paths,
            default_ttl: Duration::from_secs(self.default_ttl_seconds),
        }
    }

    pub fn build_store(&self) -> Arc<dyn ResponseCacheStore> {
        match self.backend {
            Backend::Memory => Arc::new(MemoryResponseStore::new(self.capacity)),
            Backend::Sharded => {
                Arc::new(ShardedResponseStore::new(MemoryBlobStore::new(self.capacity)))
            }
        }
    }

    pub fn build_caching(&self) -> Caching {
        ResponseCaching::new(self.build_store(), self.options())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            backend: default_backend(),
            default_ttl_seconds: default_ttl(),
            max_body_size_bytes: default_max_body_size(),
            shard_size_bytes: default_shard_size(),
            case_sensitive_paths: false,
        }
    }
}

/// Compare old and new config and apply what can change at runtime.
///
/// - TTL, body limit, shard size, path case sensitivity: orchestrator rebuilt over the
///   same store, nothing cached is lost
/// - capacity or backend: WARN log, ignored until restart
pub fn diff_and_apply(old: &Config, new: &Config, caching: &ArcSwap<Caching>) {
    if old.cache.capacity != new.cache.capacity {
        tracing::warn!(
            old = old.cache.capacity,
            new = new.cache.capacity,
            "capacity change detected, ignoring. Restart to resize the cache"
        );
    }
    if old.cache.backend != new.cache.backend {
        tracing::warn!(
            old = ?old.cache.backend,
            new = ?new.cache.backend,
            "backend change detected, ignoring. Restart to switch backends"
        );
    }

    let options = new.cache.options();
    let current = caching.load();
    if *current.options() == options {
        return;
    }

    let rebuilt = ResponseCaching::new(Arc::clone(current.store()), options.clone());
    caching.store(Arc::new(rebuilt));
    tracing::info!(
        default_ttl_secs = options.default_ttl.as_secs(),
        max_body_size = options.maximum_body_size,
        shard_size = options.shard_size,
        case_sensitive_paths = options.case_sensitive_paths,
        "config reloaded: cache options changed"
    );
}

/// Reapply `path` whenever it changes on disk. The returned watcher must be kept alive.
pub fn watch(path: PathBuf, initial: Config, cache: Arc<CacheState>) -> Option<RecommendedWatcher> {
    let applied = Mutex::new(initial);
    let reload_path = path.clone();
    let handler = move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "config watch error");
                return;
            }
        };
        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            return;
        }
        match Config::load(&reload_path) {
            Ok(next) => {
                let mut current = applied.lock();
                diff_and_apply(&current, &next, &cache.caching);
                *current = next;
            }
            Err(e) => tracing::error!(
                path = %reload_path.display(),
                error = %e,
                "config reload rejected"
            ),
        }
    };

    let mut watcher = match notify::recommended_watcher(handler) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "config watcher unavailable, hot reload disabled");
            return None;
        }
    };
    if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "cannot watch config file, hot reload disabled"
        );
        return None;
    }
    tracing::info!(path = %path.display(), "watching config for changes");
    Some(watcher)
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_capacity() -> usize {
    10000
}
fn default_backend() -> Backend {
    Backend::Memory
}
fn default_ttl() -> u64 {
    10
}
fn default_max_body_size() -> u64 {
    1_048_576
}
fn default_shard_size() -> usize {
    64 * 1024
}

//! KS-008: Recipe cache with TTL eviction.
//!
//! Parsed recipes are kept in memory keyed by path plus source fingerprint.
//! Expired entries are evicted lazily on lookup and by a background sweep
//! while a tokio runtime is available. A disabled cache stores nothing.
//! Cache problems never fail a run: the loader falls back to parsing.

use super::config::CacheConfig;
use super::hasher;
use super::parser;
use super::types::Recipe;
use crate::error::EngineError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct CacheEntry {
    recipe: Arc<Recipe>,
    inserted: Instant,
}

type Entries = Arc<Mutex<HashMap<String, CacheEntry>>>;

/// Time-bounded in-memory cache of parsed recipes.
pub struct RecipeCache {
    entries: Entries,
    ttl: Duration,
    enabled: bool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn expired(entry: &CacheEntry, ttl: Duration, now: Instant) -> bool {
    now.saturating_duration_since(entry.inserted) > ttl
}

fn sweep(entries: &Entries, ttl: Duration) -> usize {
    let now = Instant::now();
    let mut map = lock(entries);
    let before = map.len();
    map.retain(|_, e| !expired(e, ttl, now));
    before - map.len()
}

impl RecipeCache {
    /// Enabled cache without a background sweeper.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            enabled: true,
            sweeper: Mutex::new(None),
        }
    }

    /// A cache where every operation is a no-op.
    pub fn disabled() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::ZERO,
            enabled: false,
            sweeper: Mutex::new(None),
        }
    }

    /// Build from configuration, starting the sweeper when possible.
    pub fn from_config(cfg: &CacheConfig) -> Self {
        if !cfg.enabled {
            return Self::disabled();
        }
        let cache = Self::new(Duration::from_secs(cfg.ttl_secs));
        if cfg.sweep_interval_secs > 0 {
            cache.start_sweeper(Duration::from_secs(cfg.sweep_interval_secs));
        }
        cache
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a recipe. Expired entries are removed and reported absent.
    pub fn get(&self, key: &str) -> Option<Arc<Recipe>> {
        if !self.enabled {
            return None;
        }
        let mut map = lock(&self.entries);
        let now = Instant::now();
        match map.get(key) {
            Some(entry) if !expired(entry, self.ttl, now) => Some(Arc::clone(&entry.recipe)),
            Some(_) => {
                map.remove(key);
                tracing::debug!(key, "recipe cache entry expired");
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, recipe: Arc<Recipe>) {
        if !self.enabled {
            return;
        }
        lock(&self.entries).insert(
            key.to_string(),
            CacheEntry {
                recipe,
                inserted: Instant::now(),
            },
        );
    }

    /// Evict every expired entry. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        if !self.enabled {
            return 0;
        }
        sweep(&self.entries, self.ttl)
    }

    /// Stop the sweeper and drop all entries.
    pub fn destroy(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_sweeper(&self) -> bool {
        self.sweeper
            .lock()
            .map(|s| s.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Spawn the periodic sweep on the current tokio runtime, if any.
    pub fn start_sweeper(&self, interval: Duration) {
        if !self.enabled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no tokio runtime; recipe cache relies on lazy eviction");
            return;
        };
        let entries = Arc::clone(&self.entries);
        let ttl = self.ttl;
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = sweep(&entries, ttl);
                if removed > 0 {
                    tracing::debug!(removed, "recipe cache sweep");
                }
            }
        });
        let previous = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl Drop for RecipeCache {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Loads recipe files through the cache.
pub struct RecipeLoader {
    cache: RecipeCache,
}

impl RecipeLoader {
    pub fn new(cache: RecipeCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &RecipeCache {
        &self.cache
    }

    /// Read, fingerprint, and parse a recipe, reusing a cached parse when the
    /// source is unchanged.
    pub fn load(&self, path: &Path) -> Result<Arc<Recipe>, EngineError> {
        let source = std::fs::read_to_string(path).map_err(|e| EngineError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let key = hasher::recipe_key(path, &source);
        if let Some(recipe) = self.cache.get(&key) {
            tracing::debug!(path = %path.display(), "recipe cache hit");
            return Ok(recipe);
        }

        let mut recipe = parser::parse_recipe(&source).map_err(|message| EngineError::Load {
            path: path.to_path_buf(),
            message,
        })?;
        recipe.source_dir = path.parent().map(Path::to_path_buf);
        let recipe = Arc::new(recipe);
        self.cache.set(&key, Arc::clone(&recipe));
        Ok(recipe)
    }
}

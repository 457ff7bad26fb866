//! Process-scoped pack cache.
//!
//! Loaded packs (body + index) are expensive to build, so they are cached
//! per pack path. The cache is constructed once and passed by reference to
//! every object store; population is single-flight per key, so two requests
//! racing on the same uncached pack perform one build between them.

use crate::packfile::LoadedPack;
use crate::{Result, StorageError};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::ThreadId;

type PackCell = Arc<OnceCell<Arc<LoadedPack>>>;

/// Read-mostly shared cache of loaded packs, keyed by pack path.
#[derive(Debug, Default)]
pub struct PackCache {
    packs: Mutex<HashMap<String, PackCell>>,
    /// Keys whose load is in flight, per thread. A load that circles back
    /// to its own key would block on its own cell forever; it errors
    /// instead.
    loading: Mutex<HashSet<(ThreadId, String)>>,
}

impl PackCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached pack for `key`, loading it with `load` on first
    /// access. Concurrent callers for the same key block on one load; a
    /// failed load caches nothing, so a later call retries. A re-entrant
    /// load of the same key on the same thread is a `Corruption` error.
    pub fn get_or_load(
        &self,
        key: &str,
        load: impl FnOnce() -> Result<LoadedPack>,
    ) -> Result<Arc<LoadedPack>> {
        let cell = {
            let mut packs = self.packs.lock();
            packs.entry(key.to_string()).or_default().clone()
        };
        if let Some(pack) = cell.get() {
            return Ok(pack.clone());
        }

        let me = std::thread::current().id();
        if !self.loading.lock().insert((me, key.to_string())) {
            return Err(StorageError::Corruption(format!(
                "recursive load of pack {}",
                key
            )));
        }
        let result = cell
            .get_or_try_init(|| {
                tracing::debug!(pack = key, "loading pack");
                load().map(Arc::new)
            })
            .cloned();
        self.loading.lock().remove(&(me, key.to_string()));
        result
    }

    /// Whether the current thread is mid-load of `key`.
    pub fn loading(&self, key: &str) -> bool {
        let me = std::thread::current().id();
        self.loading.lock().contains(&(me, key.to_string()))
    }

    /// Number of cached packs.
    pub fn len(&self) -> usize {
        self.packs.lock().values().filter(|c| c.get().is_some()).count()
    }

    /// Whether the cache holds no loaded packs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

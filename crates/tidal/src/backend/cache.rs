use crate::backend::{compile, CompileError, Executable, ProxyRegistry};
use crate::ir::Function;
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tidal_types::config::{BackendKind, CompilerConfig};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<u64, Arc<dyn Executable>>,
    /// Insertion order, oldest first
    order: VecDeque<u64>,
}

/// Compiled stages keyed by the shape of what was compiled.
///
/// The key is the xxh3 hash of a serialized description of the stage along
/// with the backend, so identical pipelines deployed twice share one
/// executable. Entries are evicted in insertion order once `capacity` is
/// reached.
pub struct CompilationCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CompilationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Hashes any serializable stage description together with `backend`.
    pub fn key<T>(description: &T, backend: BackendKind) -> Result<u64, CompileError>
    where
        T: Serialize + ?Sized,
    {
        let mut bytes = serde_json::to_vec(description).map_err(|error| {
            CompileError::Codegen(format!("failed to serialize stage description: {error}"))
        })?;
        bytes.extend_from_slice(backend.to_string().as_bytes());
        Ok(xxh3_64(&bytes))
    }

    pub fn get(&self, key: u64) -> Option<Arc<dyn Executable>> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let found = inner.entries.get(&key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn insert(&self, key: u64, executable: Arc<dyn Executable>) {
        if self.capacity == 0 {
            return;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.entries.insert(key, executable).is_none() {
            inner.order.push_back(key);
        }
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
            debug!("evicted compiled stage {oldest:#018x} from the compilation cache");
        }
    }

    /// Returns the cached executable for `key`, compiling `function` on a
    /// miss. The lock is not held while compiling, two threads missing on
    /// the same key may both compile it.
    pub fn get_or_compile(
        &self,
        key: u64,
        function: impl FnOnce() -> Result<Function, CompileError>,
        config: &CompilerConfig,
        registry: &ProxyRegistry,
    ) -> Result<Arc<dyn Executable>, CompileError> {
        if let Some(executable) = self.get(key) {
            debug!("compilation cache hit for {key:#018x}");
            return Ok(executable);
        }

        let executable = compile(function()?, config, registry)?;
        self.insert(key, executable.clone());
        Ok(executable)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries
            .len();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

impl Default for CompilationCache {
    fn default() -> Self {
        Self::new(tidal_types::config::default_cache_capacity())
    }
}

//! Engine configuration.
//!
//! [`EngineConfig`] is the root of the configuration tree. Every field has a
//! default so that a partial (or empty) JSON document deserializes into a
//! usable configuration.

use serde::{Deserialize, Serialize};
use std::{fmt, num::NonZeroUsize, path::PathBuf, thread, time::Duration};

/// Default size in bytes of a pooled tuple buffer.
pub const fn default_buffer_size() -> usize {
    4096
}

/// Default number of buffers in the global buffer pool.
pub const fn default_num_buffers() -> usize {
    1024
}

/// Default time to wait for a free buffer before reporting exhaustion.
pub const fn default_acquire_timeout_ms() -> u64 {
    1_000
}

/// Default upper bound on tasks admitted into the engine at once.
pub const fn default_task_queue_capacity() -> usize {
    1024
}

/// Default number of times a pipeline body may be re-executed while
/// exploring its control flow during tracing.
pub const fn default_max_trace_iterations() -> usize {
    4096
}

/// Default number of compiled stages kept in the compilation cache.
pub const fn default_cache_capacity() -> usize {
    128
}

pub const fn default_hash_map_buckets() -> usize {
    1024
}

pub const fn default_hash_map_page_size() -> usize {
    64 * 1024
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn default_cc() -> PathBuf {
    PathBuf::from("cc")
}

/// Top level configuration of a node engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads executing pipeline stages.
    pub workers: usize,
    pub buffer_pool: BufferPoolConfig,
    pub compiler: CompilerConfig,
    pub slice_store: SliceStoreConfig,
    /// Maximum number of source tasks in flight before sources are throttled.
    pub task_queue_capacity: usize,
    /// Memory layout used for pipeline outputs unless the plan swaps it.
    pub layout: MemoryLayoutKind,
}

impl EngineConfig {
    /// Parses a configuration from a JSON document, filling in defaults for
    /// any missing fields.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Returns the configuration with the given number of workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.compiler.backend = backend;
        self
    }

    pub fn with_buffer_pool(mut self, buffer_size: usize, num_buffers: usize) -> Self {
        self.buffer_pool.buffer_size = buffer_size;
        self.buffer_pool.num_buffers = num_buffers;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            buffer_pool: BufferPoolConfig::default(),
            compiler: CompilerConfig::default(),
            slice_store: SliceStoreConfig::default(),
            task_queue_capacity: default_task_queue_capacity(),
            layout: MemoryLayoutKind::default(),
        }
    }
}

/// Sizing of the global tuple buffer pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Capacity in bytes of every pooled buffer. Rounded up to a multiple of
    /// eight.
    pub buffer_size: usize,
    pub num_buffers: usize,
    /// How long an allocation may block on an exhausted pool.
    pub acquire_timeout_ms: u64,
}

impl BufferPoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            num_buffers: default_num_buffers(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

/// Which compilation backend lowers traced pipelines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Native code through Cranelift.
    #[default]
    Cranelift,
    /// Direct IR walking, no code generation.
    Interpreter,
    /// C source emitted and built with the system compiler.
    SourceGen,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cranelift => "cranelift",
            Self::Interpreter => "interpreter",
            Self::SourceGen => "source_gen",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub backend: BackendKind,
    /// Emit runtime checks in generated code where the backend supports it.
    pub debug_assertions: bool,
    pub max_trace_iterations: usize,
    /// Log the optimized IR of every compiled stage at `debug` level.
    pub dump_ir: bool,
    pub cache_capacity: usize,
    /// C compiler used by the source generation backend.
    pub cc: PathBuf,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            debug_assertions: cfg!(debug_assertions),
            max_trace_iterations: default_max_trace_iterations(),
            dump_ir: false,
            cache_capacity: default_cache_capacity(),
            cc: default_cc(),
        }
    }
}

/// Watermark predictor used to schedule speculative trigger checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkPredictorKind {
    None,
    #[default]
    Kalman,
    Regression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceStoreConfig {
    pub predictor: WatermarkPredictorKind,
    /// Initial number of buckets in every slice hash map.
    pub hash_map_buckets: usize,
    /// Size in bytes of the pages backing hash map entries.
    pub hash_map_page_size: usize,
}

impl Default for SliceStoreConfig {
    fn default() -> Self {
        Self {
            predictor: WatermarkPredictorKind::default(),
            hash_map_buckets: default_hash_map_buckets(),
            hash_map_page_size: default_hash_map_page_size(),
        }
    }
}

/// How records are laid out inside a tuple buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLayoutKind {
    /// All fields of a record are contiguous.
    #[default]
    Row,
    /// Every field occupies its own contiguous column.
    Columnar,
}

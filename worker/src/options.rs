use partitioncache_query::VariantGenOptions;
use partitioncache_rewrite::Method;
use std::path::PathBuf;
use std::time::Duration;

/// Options of the external fill worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Bound of the executor pool
    pub max_processes: usize,
    /// Exit once both queues are empty and no jobs are in flight
    pub close_when_done: bool,
    /// Statement timeout for fragment execution; zero disables it
    pub statement_timeout: Duration,
    /// Tombstone fragments whose result exceeds this row count
    pub limit: Option<usize>,
    /// Interval between idle status lines
    pub status_log_interval: Duration,
    /// Re-evaluate fragments already present in the cache
    pub force_recalculate: bool,
    /// Replace blocking pops with plain polling
    pub disable_optimized_polling: bool,
    /// Append `<hash>,<seconds>` lines to this CSV file
    pub log_query_times: Option<PathBuf>,
    /// Never stream results inside the cache DBMS, always execute + fetch
    pub disable_lazy_insertion: bool,
    /// Rewrite fragments with already-cached entries before executing them
    pub enable_cache_optimization: bool,
    pub cache_optimization_method: Method,
    /// Minimum hits before the eager optimization path rewrites
    pub min_cache_hits: usize,
    /// Prefer the lazy optimization path when the backend supports it
    pub prefer_lazy_optimization: bool,
    /// Variant generation settings shared with the apply path
    pub variants: VariantGenOptions,
    /// Connection string of the DBMS fragments are evaluated against
    pub target_db_uri: String,
    /// Bitsize override for bit backends
    pub bitsize: Option<i64>,
}

impl WorkerOptions {
    pub fn new(target_db_uri: impl Into<String>) -> Self {
        Self {
            max_processes: 12,
            close_when_done: false,
            statement_timeout: Duration::ZERO,
            limit: None,
            status_log_interval: Duration::from_secs(10),
            force_recalculate: false,
            disable_optimized_polling: false,
            log_query_times: None,
            disable_lazy_insertion: false,
            enable_cache_optimization: true,
            cache_optimization_method: Method::In,
            min_cache_hits: 1,
            prefer_lazy_optimization: true,
            variants: VariantGenOptions::default(),
            target_db_uri: target_db_uri.into(),
            bitsize: None,
        }
    }
}

//! External fill worker: monitors the queues and populates the cache as
//! queries arrive.

mod exit;

use anyhow::Result;
use clap::Parser;
use partitioncache_cache::ConfigError;
use partitioncache_cache::handler::make_cache_handler;
use partitioncache_queue::connect_queue_handler;
use partitioncache_rewrite::Method;
use partitioncache_worker::{WorkerOptions, run_worker};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[clap(name = "pcache-monitor")]
#[clap(about = "Monitor the cache queues and evaluate fragments as they arrive", version)]
struct Cli {
    /// Exit once both queues are empty and no jobs are in flight
    #[clap(long, default_value_t = false)]
    close: bool,

    /// Bound of the executor pool
    #[clap(long, default_value_t = 12)]
    max_processes: usize,

    /// Statement timeout in seconds for fragment execution; 0 disables it
    #[clap(long, default_value_t = 0)]
    long_running_query_timeout: u64,

    /// Tombstone fragments returning at least this many partition keys
    #[clap(long)]
    limit: Option<usize>,

    /// Seconds between idle status lines
    #[clap(long, default_value_t = 10)]
    status_log_interval: u64,

    /// Use plain polling instead of blocking pops
    #[clap(long, default_value_t = false)]
    disable_optimized_polling: bool,

    /// Re-evaluate fragments already present in the cache
    #[clap(long, default_value_t = false)]
    force_recalculate: bool,

    /// Append per-fragment wall times to this CSV file
    #[clap(long)]
    log_query_times: Option<PathBuf>,

    /// Always execute + fetch instead of streaming inside the cache DBMS
    #[clap(long, default_value_t = false)]
    disable_lazy_insertion: bool,

    /// Disable cache-aware rewriting of fragments before execution
    #[clap(long, default_value_t = false)]
    disable_cache_optimization: bool,

    /// Splice method for cache-aware fragment optimization
    #[clap(long, default_value = "IN")]
    cache_optimization_method: String,

    /// Minimum cache hits before the eager optimization path rewrites
    #[clap(long, default_value_t = 1)]
    min_cache_hits: usize,

    /// Do not prefer the lazy optimization path
    #[clap(long, default_value_t = false)]
    no_prefer_lazy_optimization: bool,

    /// Cache backend (defaults to CACHE_BACKEND)
    #[clap(long)]
    cache_backend: Option<String>,

    /// Bitsize for bit cache backends
    #[clap(long)]
    bitsize: Option<i64>,

    /// Minimum number of tables per generated fragment
    #[clap(long, default_value_t = 1)]
    min_component_size: usize,

    /// Maximum number of tables per generated fragment
    #[clap(long, default_value_t = 15)]
    max_component_size: usize,

    /// Enumerate all table combinations instead of connected subgraphs
    #[clap(long, default_value_t = false)]
    no_follow_graph: bool,

    /// Bucket size for distance-literal quantisation; <= 0 disables it
    #[clap(long, default_value_t = 1.0)]
    bucket_steps: f64,

    /// Explicit partition-join table (alias or name)
    #[clap(long)]
    partition_join_table: Option<String>,

    /// Disable partition-join auto-detection
    #[clap(long, default_value_t = false)]
    no_auto_detect_partition_join: bool,
}

fn target_db_uri() -> Result<String> {
    let mut missing = vec![];
    let mut get = |name: &str| match std::env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => {
            missing.push(name.to_string());
            String::new()
        }
    };
    let host = get("DB_HOST");
    let port = get("DB_PORT");
    let user = get("DB_USER");
    let password = get("DB_PASSWORD");
    let database = get("DB_NAME");
    if !missing.is_empty() {
        return Err(ConfigError::MissingEnv(missing).into());
    }
    Ok(format!("postgres://{user}:{password}@{host}:{port}/{database}"))
}

fn worker_options(cli: &Cli) -> Result<WorkerOptions> {
    let mut options = WorkerOptions::new(target_db_uri()?);
    options.max_processes = cli.max_processes;
    options.close_when_done = cli.close;
    options.statement_timeout = Duration::from_secs(cli.long_running_query_timeout);
    options.limit = cli.limit;
    options.status_log_interval = Duration::from_secs(cli.status_log_interval);
    options.force_recalculate = cli.force_recalculate;
    options.disable_optimized_polling = cli.disable_optimized_polling;
    options.log_query_times = cli.log_query_times.clone();
    options.disable_lazy_insertion = cli.disable_lazy_insertion;
    options.enable_cache_optimization = !cli.disable_cache_optimization;
    options.cache_optimization_method = Method::from_str(&cli.cache_optimization_method)?;
    options.min_cache_hits = cli.min_cache_hits;
    options.prefer_lazy_optimization = !cli.no_prefer_lazy_optimization;
    options.bitsize = cli.bitsize;
    options.variants.min_component_size = cli.min_component_size;
    options.variants.max_component_size = cli.max_component_size;
    options.variants.follow_graph = !cli.no_follow_graph;
    options.variants.bucket_steps = cli.bucket_steps;
    options.variants.partition_join_table = cli.partition_join_table.clone();
    options.variants.auto_detect_partition_join = !cli.no_auto_detect_partition_join;
    Ok(options)
}

async fn run(cli: Cli) -> Result<()> {
    let options = worker_options(&cli)?;
    let backend = cli
        .cache_backend
        .clone()
        .or_else(|| std::env::var("CACHE_BACKEND").ok())
        .unwrap_or_else(|| "postgresql_bit".to_string());

    let queue = connect_queue_handler().await?;
    let cache = make_cache_handler(&backend).await?;
    info!(
        "starting fill worker: backend={backend}, max_processes={}",
        options.max_processes
    );
    run_worker(options, queue.clone(), cache.clone()).await?;
    cache.close().await;
    queue.close().await;
    Ok(())
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return exit::runtime_failure();
        }
    };
    exit::from_result(runtime.block_on(run(cli)))
}

//! PartitionCache administration CLI: setup, status, cache management,
//! queue management, maintenance and the in-DBMS processor.
//!
//! Exit codes: 0 on success, 1 on configuration errors, 2 on runtime
//! failures.

mod exit;
mod pools;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use partitioncache_cache::export::{ExportRecord, export_all, export_partition, import_records};
use partitioncache_cache::handler::make_cache_handler;
use partitioncache_cache::{CacheEnv, EvictionStrategy};
use partitioncache_queue::{QueueEnv, connect_queue_handler, validate_queue_configuration};
use partitioncache_worker::processor::{self, ConfigUpdate, ProcessorConfig};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

#[derive(Parser, Debug)]
#[clap(name = "pcache-admin")]
#[clap(about = "Administer PartitionCache caches, queues and processors", version)]
#[clap(arg_required_else_help(true))]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create tables, triggers and functions
    Setup {
        #[clap(subcommand)]
        target: SetupTarget,
    },
    /// Inspect configuration and table state
    Status {
        #[clap(subcommand)]
        scope: Option<StatusScope>,
    },
    /// Cache operations
    Cache {
        #[clap(subcommand)]
        operation: CacheOperation,
    },
    /// Queue operations
    Queue {
        #[clap(subcommand)]
        operation: QueueOperation,
    },
    /// Maintenance operations
    Maintenance {
        #[clap(subcommand)]
        operation: MaintenanceOperation,
    },
    /// In-DBMS processor management
    Processor {
        #[clap(subcommand)]
        operation: ProcessorOperation,
    },
}

#[derive(Subcommand, Debug)]
enum SetupTarget {
    /// Set up queue and cache tables (recommended for new projects)
    All {
        #[clap(long)]
        cache: Option<String>,
    },
    /// Set up queue tables only
    Queue,
    /// Set up cache metadata tables only
    Cache {
        #[clap(long)]
        cache: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum StatusScope {
    /// Comprehensive overview (default)
    All,
    /// Validate environment configuration
    Env,
    /// Check table state and accessibility
    Tables,
}

#[derive(Subcommand, Debug)]
enum CacheOperation {
    /// Count cache entries
    Count {
        #[clap(long)]
        partition_key: Option<String>,
        #[clap(long = "type")]
        cache_type: Option<String>,
    },
    /// Show a per-partition overview
    Overview {
        #[clap(long = "type")]
        cache_type: Option<String>,
    },
    /// Copy entries between two backends
    Copy {
        #[clap(long)]
        from: String,
        #[clap(long)]
        to: String,
        #[clap(long)]
        partition_key: Option<String>,
    },
    /// Export entries to a JSON-lines file
    Export {
        #[clap(long)]
        file: PathBuf,
        #[clap(long = "type")]
        cache_type: Option<String>,
        #[clap(long)]
        partition_key: Option<String>,
    },
    /// Import entries from a JSON-lines file
    Import {
        #[clap(long)]
        file: PathBuf,
        #[clap(long = "type")]
        cache_type: Option<String>,
        #[clap(long)]
        partition_key: Option<String>,
    },
    /// Delete a partition, or the whole cache when no partition is given
    Delete {
        #[clap(long = "type")]
        cache_type: Option<String>,
        #[clap(long)]
        partition_key: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum QueueOperation {
    /// Count entries in both queues
    Count,
    /// Clear queues
    Clear {
        #[clap(long)]
        original: bool,
        #[clap(long)]
        fragment: bool,
    },
}

#[derive(Subcommand, Debug)]
enum MaintenanceOperation {
    /// Remove queries (and payloads) not seen for N days
    Prune {
        #[clap(long)]
        days: i64,
    },
    /// Shrink partitions above a size threshold
    Evict {
        #[clap(long)]
        strategy: String,
        #[clap(long)]
        threshold: i64,
        #[clap(long)]
        partition_key: Option<String>,
    },
    /// Remove tombstoned or oversized entries
    Cleanup {
        #[clap(long)]
        remove_termination: bool,
        #[clap(long)]
        remove_large: Option<i64>,
    },
    /// Partition management
    Partition {
        /// Delete this partition including its metadata
        #[clap(long)]
        delete: String,
    },
}

#[derive(Subcommand, Debug)]
enum ProcessorOperation {
    /// Install processor objects and the config row
    Setup {
        #[clap(long, default_value_t = 60)]
        frequency: i32,
        #[clap(long, default_value_t = 1800)]
        timeout: i32,
        #[clap(long, default_value_t = 2)]
        max_parallel_jobs: i32,
        #[clap(long)]
        enable_after_setup: bool,
        #[clap(long)]
        default_bitsize: Option<i64>,
    },
    Enable,
    Disable,
    Remove,
    UpdateConfig {
        #[clap(long)]
        frequency: Option<i32>,
        #[clap(long)]
        timeout: Option<i32>,
        #[clap(long)]
        max_parallel_jobs: Option<i32>,
        #[clap(long)]
        default_bitsize: Option<i64>,
    },
    Status,
    StatusDetailed,
    QueueInfo,
    Logs {
        #[clap(long, default_value_t = 20)]
        limit: i64,
    },
    ManualProcess {
        #[clap(long, default_value_t = 1)]
        count: i32,
    },
    CheckPermissions,
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

fn resolve_backend(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var("CACHE_BACKEND").ok())
        .unwrap_or_else(|| "postgresql_bit".to_string())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Setup { target } => run_setup(target).await,
        Commands::Status { scope } => run_status(scope.unwrap_or(StatusScope::All)).await,
        Commands::Cache { operation } => run_cache(operation).await,
        Commands::Queue { operation } => run_queue(operation).await,
        Commands::Maintenance { operation } => run_maintenance(operation).await,
        Commands::Processor { operation } => run_processor(operation).await,
    }
}

async fn run_setup(target: SetupTarget) -> Result<()> {
    match target {
        SetupTarget::All { cache } => {
            let queue = connect_queue_handler().await?;
            queue.close().await;
            let handler = make_cache_handler(&resolve_backend(cache)).await?;
            handler.close().await;
            println!("queue and cache tables are set up");
        }
        SetupTarget::Queue => {
            let queue = connect_queue_handler().await?;
            queue.close().await;
            println!("queue tables are set up");
        }
        SetupTarget::Cache { cache } => {
            let handler = make_cache_handler(&resolve_backend(cache)).await?;
            handler.close().await;
            println!("cache metadata tables are set up");
        }
    }
    Ok(())
}

async fn run_status(scope: StatusScope) -> Result<()> {
    match scope {
        StatusScope::Env => {
            CacheEnv::from_env()?;
            validate_queue_configuration()?;
            println!("environment configuration is valid");
        }
        StatusScope::Tables => {
            status_tables().await?;
        }
        StatusScope::All => {
            match CacheEnv::from_env() {
                Ok(env) => println!("cache backend: {} (prefix {})", env.backend, env.table_prefix),
                Err(e) => println!("cache environment: {e}"),
            }
            match QueueEnv::from_env() {
                Ok(env) => println!("queue provider: {}", env.provider),
                Err(e) => println!("queue environment: {e}"),
            }
            status_tables().await?;
        }
    }
    Ok(())
}

async fn status_tables() -> Result<()> {
    let handler = make_cache_handler(&resolve_backend(None)).await?;
    let partitions = handler.get_partition_keys().await?;
    println!("registered partitions: {}", partitions.len());
    for (partition_key, datatype) in &partitions {
        let entries = handler.entry_count(partition_key).await?;
        println!("  {partition_key} ({datatype}): {entries} entries");
    }
    handler.close().await;
    let queue = connect_queue_handler().await?;
    let lengths = queue.get_queue_lengths().await?;
    println!(
        "queues: {} original queries, {} fragments",
        lengths.original_query_queue, lengths.query_fragment_queue
    );
    queue.close().await;
    Ok(())
}

async fn run_cache(operation: CacheOperation) -> Result<()> {
    match operation {
        CacheOperation::Count {
            partition_key,
            cache_type,
        } => {
            let handler = make_cache_handler(&resolve_backend(cache_type)).await?;
            match partition_key {
                Some(partition_key) => {
                    println!(
                        "{partition_key}: {} entries",
                        handler.entry_count(&partition_key).await?
                    );
                }
                None => {
                    let mut total = 0;
                    for (partition_key, _) in handler.get_partition_keys().await? {
                        let count = handler.entry_count(&partition_key).await?;
                        println!("{partition_key}: {count} entries");
                        total += count;
                    }
                    println!("total: {total} entries");
                }
            }
            handler.close().await;
        }
        CacheOperation::Overview { cache_type } => {
            let handler = make_cache_handler(&resolve_backend(cache_type)).await?;
            for (partition_key, datatype) in handler.get_partition_keys().await? {
                let entries = handler.entry_count(&partition_key).await?;
                let queries = handler.get_all_queries(&partition_key).await?;
                let tombstones = queries.iter().filter(|q| q.status.is_tombstone()).count();
                println!(
                    "{partition_key}: datatype={datatype}, entries={entries}, \
                     queries={}, tombstones={tombstones}",
                    queries.len()
                );
            }
            handler.close().await;
        }
        CacheOperation::Copy {
            from,
            to,
            partition_key,
        } => {
            let source = make_cache_handler(&from).await?;
            let records = match &partition_key {
                Some(partition_key) => export_partition(source.as_ref(), partition_key).await?,
                None => export_all(source.as_ref()).await?,
            };
            source.close().await;
            let target = make_cache_handler(&to).await?;
            let imported = import_records(target.as_ref(), &records, None).await?;
            target.close().await;
            println!("copied {imported} entries from {from} to {to}");
        }
        CacheOperation::Export {
            file,
            cache_type,
            partition_key,
        } => {
            let handler = make_cache_handler(&resolve_backend(cache_type)).await?;
            let records = match &partition_key {
                Some(partition_key) => export_partition(handler.as_ref(), partition_key).await?,
                None => export_all(handler.as_ref()).await?,
            };
            handler.close().await;
            let mut output = std::fs::File::create(&file)
                .with_context(|| format!("creating {}", file.display()))?;
            for record in &records {
                serde_json::to_writer(&mut output, record)?;
                output.write_all(b"\n")?;
            }
            println!("exported {} entries to {}", records.len(), file.display());
        }
        CacheOperation::Import {
            file,
            cache_type,
            partition_key,
        } => {
            let input = std::fs::File::open(&file)
                .with_context(|| format!("opening {}", file.display()))?;
            let mut records: Vec<ExportRecord> = vec![];
            for line in std::io::BufReader::new(input).lines() {
                let line = line?;
                if !line.trim().is_empty() {
                    records.push(serde_json::from_str(&line)?);
                }
            }
            let handler = make_cache_handler(&resolve_backend(cache_type)).await?;
            let imported =
                import_records(handler.as_ref(), &records, partition_key.as_deref()).await?;
            handler.close().await;
            println!("imported {imported} entries from {}", file.display());
        }
        CacheOperation::Delete {
            cache_type,
            partition_key,
        } => {
            let handler = make_cache_handler(&resolve_backend(cache_type)).await?;
            match partition_key {
                Some(partition_key) => {
                    handler.delete_partition(&partition_key).await?;
                    println!("deleted partition {partition_key}");
                }
                None => {
                    let partitions = handler.get_partition_keys().await?;
                    for (partition_key, _) in &partitions {
                        handler.delete_partition(partition_key).await?;
                    }
                    println!("deleted {} partitions", partitions.len());
                }
            }
            handler.close().await;
        }
    }
    Ok(())
}

async fn run_queue(operation: QueueOperation) -> Result<()> {
    let queue = connect_queue_handler().await?;
    match operation {
        QueueOperation::Count => {
            let lengths = queue.get_queue_lengths().await?;
            println!("original query queue: {}", lengths.original_query_queue);
            println!("query fragment queue: {}", lengths.query_fragment_queue);
        }
        QueueOperation::Clear { original, fragment } => {
            // with no flag both queues are cleared
            let both = !original && !fragment;
            if original || both {
                let cleared = queue.clear_original_query_queue().await?;
                println!("cleared {cleared} original queries");
            }
            if fragment || both {
                let cleared = queue.clear_query_fragment_queue().await?;
                println!("cleared {cleared} query fragments");
            }
        }
    }
    queue.close().await;
    Ok(())
}

async fn run_maintenance(operation: MaintenanceOperation) -> Result<()> {
    let handler = make_cache_handler(&resolve_backend(None)).await?;
    match operation {
        MaintenanceOperation::Prune { days } => {
            let removed = handler.prune_old_queries(days).await?;
            println!("pruned {removed} queries older than {days} days");
        }
        MaintenanceOperation::Evict {
            strategy,
            threshold,
            partition_key,
        } => {
            let strategy = EvictionStrategy::from_str(&strategy)?;
            let partitions = match partition_key {
                Some(partition_key) => vec![partition_key],
                None => handler
                    .get_partition_keys()
                    .await?
                    .into_iter()
                    .map(|(partition_key, _)| partition_key)
                    .collect(),
            };
            for partition_key in partitions {
                let removed = handler.evict(&partition_key, strategy, threshold).await?;
                println!("evicted {removed} entries from {partition_key}");
            }
        }
        MaintenanceOperation::Cleanup {
            remove_termination,
            remove_large,
        } => {
            for (partition_key, _) in handler.get_partition_keys().await? {
                if remove_termination {
                    let removed = handler.remove_tombstones(&partition_key).await?;
                    println!("removed {removed} tombstoned entries from {partition_key}");
                }
                if let Some(max_count) = remove_large {
                    let removed = handler
                        .remove_large_entries(&partition_key, max_count)
                        .await?;
                    println!("removed {removed} oversized entries from {partition_key}");
                }
            }
        }
        MaintenanceOperation::Partition { delete } => {
            handler.delete_partition(&delete).await?;
            println!("deleted partition {delete}");
        }
    }
    handler.close().await;
    Ok(())
}

async fn run_processor(operation: ProcessorOperation) -> Result<()> {
    let cache_env = CacheEnv::from_env()?;
    let queue_env = QueueEnv::from_env()?;
    let (work_pool, cron_pool, cron_is_work_db) = pools::processor_pools(&cache_env).await?;
    let queue_prefix = queue_env.table_prefix.clone();

    match operation {
        ProcessorOperation::Setup {
            frequency,
            timeout,
            max_parallel_jobs,
            enable_after_setup,
            default_bitsize,
        } => {
            let config = ProcessorConfig {
                enabled: enable_after_setup,
                frequency_seconds: frequency,
                timeout_seconds: timeout,
                max_parallel_jobs,
                table_prefix: cache_env.table_prefix.clone(),
                queue_prefix: queue_prefix.clone(),
                cache_backend: cache_env.backend.clone(),
                target_database: cache_env.database.clone(),
                default_bitsize: default_bitsize.or(Some(cache_env.bitsize)),
            };
            processor::setup(&work_pool, &cron_pool, cron_is_work_db, &config).await?;
            println!("processor set up (job {})", config.job_name());
        }
        ProcessorOperation::Enable => {
            processor::set_enabled(&cron_pool, &queue_prefix, true).await?;
            println!("processor enabled");
        }
        ProcessorOperation::Disable => {
            processor::set_enabled(&cron_pool, &queue_prefix, false).await?;
            println!("processor disabled");
        }
        ProcessorOperation::Remove => {
            processor::remove(&work_pool, &cron_pool, &queue_prefix).await?;
            println!("processor removed");
        }
        ProcessorOperation::UpdateConfig {
            frequency,
            timeout,
            max_parallel_jobs,
            default_bitsize,
        } => {
            let update = ConfigUpdate {
                enabled: None,
                frequency_seconds: frequency,
                timeout_seconds: timeout,
                max_parallel_jobs,
                default_bitsize,
            };
            let updated = processor::update_config(&cron_pool, &queue_prefix, &update).await?;
            println!("updated {updated} processor config rows");
        }
        ProcessorOperation::Status => match processor::get_status(&cron_pool, &queue_prefix).await? {
            Some(status) => {
                println!(
                    "job {}: enabled={}, every {}s, timeout {}s, max_parallel_jobs={}",
                    status.config.job_name(),
                    status.config.enabled,
                    status.config.frequency_seconds,
                    status.config.timeout_seconds,
                    status.config.max_parallel_jobs
                );
                match (status.cron_schedule, status.cron_active) {
                    (Some(schedule), active) => {
                        println!("cron job: schedule '{schedule}', active={active:?}");
                    }
                    _ => println!("cron job: not scheduled"),
                }
            }
            None => println!("no processor configured"),
        },
        ProcessorOperation::StatusDetailed => {
            match processor::get_status(&cron_pool, &queue_prefix).await? {
                Some(status) => {
                    println!(
                        "job {}: enabled={}, every {}s",
                        status.config.job_name(),
                        status.config.enabled,
                        status.config.frequency_seconds
                    );
                    let counters = processor::get_counters(&work_pool, &queue_prefix).await?;
                    println!(
                        "active jobs: {}, last 24h: {} succeeded, {} timed out, {} failed",
                        counters.active_jobs,
                        counters.recent_successes,
                        counters.recent_timeouts,
                        counters.recent_failures
                    );
                }
                None => println!("no processor configured"),
            }
        }
        ProcessorOperation::QueueInfo => {
            let queue = connect_queue_handler().await?;
            let lengths = queue.get_queue_lengths().await?;
            println!(
                "original query queue: {}, query fragment queue: {}",
                lengths.original_query_queue, lengths.query_fragment_queue
            );
            queue.close().await;
        }
        ProcessorOperation::Logs { limit } => {
            for entry in processor::get_logs(&work_pool, &queue_prefix, limit).await? {
                println!(
                    "{} [{}] {} {} {}",
                    entry.created_at,
                    entry.status,
                    entry.query_hash.unwrap_or_default(),
                    entry.partition_key.unwrap_or_default(),
                    entry.error_message.unwrap_or_default()
                );
            }
        }
        ProcessorOperation::ManualProcess { count } => {
            let processed = processor::manual_process(&work_pool, &queue_prefix, count).await?;
            println!("processed {processed} fragments");
        }
        ProcessorOperation::CheckPermissions => {
            for message in processor::check_permissions(&cron_pool).await? {
                println!("{message}");
            }
        }
    }
    info!("processor command completed");
    Ok(())
}

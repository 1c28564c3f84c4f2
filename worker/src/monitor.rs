use crate::db;
use crate::options::WorkerOptions;
use crate::timing::QueryTimeLog;
use anyhow::Result;
use chrono::Utc;
use partitioncache_cache::{CacheHandler, Datatype, QueryStatus, RegisterOptions};
use partitioncache_query::generate_all_query_hash_pairs;
use partitioncache_queue::{FragmentQueueEntry, QueueHandler, QueueLengths};
use partitioncache_rewrite::{
    ExtendOptions, Method, extend_query_with_partition_keys, extend_query_with_partition_keys_lazy,
    get_partition_keys, get_partition_keys_lazy,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Run the external fill worker until the queues drain (with
/// `close_when_done`), the error budget is exhausted, or an interrupt
/// arrives. Two cooperating tasks share an exit signal: a fragment
/// generator feeding the fragment queue and an executor pool draining it.
pub async fn run_worker(
    options: WorkerOptions,
    queue: Arc<dyn QueueHandler>,
    cache: Arc<dyn CacheHandler>,
) -> Result<()> {
    let (exit_tx, exit_rx) = watch::channel(false);
    let exit_for_signal = exit_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt signal - initiating graceful shutdown");
            let _ = exit_for_signal.send(true);
        }
    });

    let timing = Arc::new(QueryTimeLog::open(options.log_query_times.as_deref())?);
    let options = Arc::new(options);
    info!(
        "starting two-task queue monitoring: fragment generation and execution, \
         max_processes={}",
        options.max_processes
    );

    let generator = tokio::spawn(fragment_generator(
        options.clone(),
        queue.clone(),
        exit_rx.clone(),
    ));
    let executor_result =
        fragment_executor(options, queue, cache, timing, exit_tx.clone(), exit_rx).await;
    let _ = exit_tx.send(true);
    if let Err(e) = generator.await {
        error!("fragment generator task failed: {e}");
    }
    info!("fill worker shutting down");
    executor_result
}

/// T1: pop original queries, fragment them, push the pairs.
async fn fragment_generator(
    options: Arc<WorkerOptions>,
    queue: Arc<dyn QueueHandler>,
    mut exit_rx: watch::Receiver<bool>,
) {
    info!("starting query fragment generator task");
    while !*exit_rx.borrow() {
        let popped = if options.disable_optimized_polling {
            queue.pop_from_original_query_queue().await
        } else {
            tokio::select! {
                _ = exit_rx.changed() => break,
                result = queue.pop_from_original_query_queue_blocking(Duration::from_secs(60)) => {
                    result
                }
            }
        };
        let entry = match popped {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                if options.disable_optimized_polling {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                continue;
            }
            Err(e) => {
                error!("error popping from the original query queue: {e:#}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        debug!(
            "fragmenting original query for partition_key {} (datatype {:?})",
            entry.partition_key, entry.datatype
        );
        let mut variants = options.variants.clone();
        if entry.datatype == Some(Datatype::Geometry) {
            variants.skip_partition_key_joins = true;
            if variants.geometry_column.is_none() {
                variants.geometry_column = Some("geom".to_string());
            }
        }
        match generate_all_query_hash_pairs(&entry.query, &entry.partition_key, &variants) {
            Ok(pairs) => {
                debug!("generated {} fragments from original query", pairs.len());
                if let Err(e) = queue
                    .push_to_query_fragment_queue(&pairs, &entry.partition_key, entry.datatype, None)
                    .await
                {
                    error!("error pushing fragments to the fragment queue: {e:#}");
                }
            }
            Err(e) => warn!("failed to fragment original query: {e:#}"),
        }
    }
    info!("query fragment generator exiting");
}

fn status_reason(active: usize, max_processes: usize, fragment_count: i64) -> &'static str {
    if active >= max_processes {
        "waiting for thread capacity"
    } else if fragment_count == 0 {
        "waiting for work"
    } else {
        "normal processing"
    }
}

fn log_status(active: usize, lengths: &QueueLengths, reason: &str) {
    info!(
        "Active: {active}, Fragment Queue: {}, Original Queue: {} - {reason}",
        lengths.query_fragment_queue, lengths.original_query_queue
    );
}

fn error_backoff(consecutive_errors: u32) -> Duration {
    Duration::from_secs_f64((0.5 * 2f64.powi(consecutive_errors as i32)).min(5.0))
}

/// T2: bounded executor pool over the fragment queue.
async fn fragment_executor(
    options: Arc<WorkerOptions>,
    queue: Arc<dyn QueueHandler>,
    cache: Arc<dyn CacheHandler>,
    timing: Arc<QueryTimeLog>,
    exit_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut jobs: JoinSet<(String, bool)> = JoinSet::new();
    let mut active_hashes: HashSet<String> = HashSet::new();
    let mut consecutive_errors: u32 = 0;
    let mut last_status_log: Option<Instant> = None;
    let mut previous_fragment_count: Option<i64> = None;

    info!(
        "starting fragment executor pool -- configuration: max_processes={}",
        options.max_processes
    );

    while !*exit_rx.borrow() {
        let iteration = executor_iteration(
            &options,
            queue.as_ref(),
            &cache,
            &timing,
            &exit_tx,
            &exit_rx,
            &mut jobs,
            &mut active_hashes,
            &mut last_status_log,
            &mut previous_fragment_count,
        )
        .await;
        match iteration {
            Ok(()) => {
                consecutive_errors = 0;
                // short sleep so completed jobs are collected promptly
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => {
                consecutive_errors += 1;
                error!(
                    "error in fragment executor (consecutive errors: {consecutive_errors}): {e:#}"
                );
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!("too many consecutive errors, shutting down");
                    let _ = exit_tx.send(true);
                    break;
                }
                let backoff = error_backoff(consecutive_errors);
                info!("retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
            }
        }
    }

    // stop accepting work, await in-flight jobs
    let in_flight = jobs.len();
    if in_flight > 0 {
        info!("waiting for {in_flight} active jobs to complete");
    }
    while let Some(joined) = jobs.join_next().await {
        collect_result(joined, &mut active_hashes);
    }
    info!("fragment executor exiting");
    Ok(())
}

fn collect_result(
    joined: Result<(String, bool), tokio::task::JoinError>,
    active_hashes: &mut HashSet<String>,
) {
    match joined {
        Ok((hash, true)) => {
            info!("fragment {hash} completed successfully");
            active_hashes.remove(&hash);
        }
        Ok((hash, false)) => {
            warn!("fragment {hash} completed with failure");
            active_hashes.remove(&hash);
        }
        Err(e) => error!("fragment job panicked: {e}"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn executor_iteration(
    options: &Arc<WorkerOptions>,
    queue: &dyn QueueHandler,
    cache: &Arc<dyn CacheHandler>,
    timing: &Arc<QueryTimeLog>,
    exit_tx: &watch::Sender<bool>,
    exit_rx: &watch::Receiver<bool>,
    jobs: &mut JoinSet<(String, bool)>,
    active_hashes: &mut HashSet<String>,
    last_status_log: &mut Option<Instant>,
    previous_fragment_count: &mut Option<i64>,
) -> Result<()> {
    while let Some(joined) = jobs.try_join_next() {
        collect_result(joined, active_hashes);
    }
    let active = jobs.len();

    let lengths = queue.get_queue_lengths().await?;
    let fragment_count = lengths.query_fragment_queue;
    let became_empty = previous_fragment_count.is_some_and(|p| p > 0) && fragment_count == 0;
    if became_empty {
        info!("fragment queue has become empty - waiting for work");
    }
    *previous_fragment_count = Some(fragment_count);

    let interval_elapsed =
        last_status_log.is_none_or(|last| last.elapsed() >= options.status_log_interval);
    if interval_elapsed || (active == 0 && became_empty) {
        log_status(
            active,
            &lengths,
            status_reason(active, options.max_processes, fragment_count),
        );
        *last_status_log = Some(Instant::now());
    }

    if options.close_when_done
        && active == 0
        && fragment_count == 0
        && lengths.original_query_queue == 0
    {
        info!("closing worker at {}", Utc::now());
        let _ = exit_tx.send(true);
        return Ok(());
    }

    while jobs.len() < options.max_processes && !*exit_rx.borrow() {
        // blocking pop only while jobs are running; an idle worker polls so
        // status lines stay responsive
        let popped = if !options.disable_optimized_polling && !jobs.is_empty() {
            queue
                .pop_from_query_fragment_queue_blocking(Duration::from_secs(2))
                .await?
        } else {
            queue.pop_from_query_fragment_queue().await?
        };
        let Some(entry) = popped else {
            break;
        };
        debug!("found fragment in fragment queue: {}", entry.hash);

        let already_cached = cache
            .exists(&entry.hash, &entry.partition_key, false)
            .await?;
        if already_cached && !options.force_recalculate {
            debug!("fragment {} already in cache", entry.hash);
            cache
                .set_query(&entry.hash, &entry.query, &entry.partition_key)
                .await?;
            timing.record(&format!("{}_cache_hit", entry.hash), 0.0);
            continue;
        }
        if already_cached {
            info!(
                "fragment {} exists in cache but force-recalculate is enabled",
                entry.hash
            );
        }
        if active_hashes.contains(&entry.hash) {
            debug!("fragment {} already in process", entry.hash);
            continue;
        }

        active_hashes.insert(entry.hash.clone());
        let job_cache = cache.clone();
        let job_options = options.clone();
        let job_timing = timing.clone();
        let hash = entry.hash.clone();
        jobs.spawn(async move {
            let success =
                run_and_store_fragment(entry, job_cache, job_options, job_timing).await;
            (hash, success)
        });
        info!("submitted fragment to the executor pool (active: {})", jobs.len());
    }
    Ok(())
}

async fn run_and_store_fragment(
    entry: FragmentQueueEntry,
    cache: Arc<dyn CacheHandler>,
    options: Arc<WorkerOptions>,
    timing: Arc<QueryTimeLog>,
) -> bool {
    match process_fragment(&entry, cache.as_ref(), &options, &timing).await {
        Ok(success) => success,
        Err(e) => {
            error!("worker job failed for {}: {e:#}", entry.hash);
            false
        }
    }
}

fn lookup_variants(options: &WorkerOptions) -> partitioncache_query::VariantGenOptions {
    partitioncache_query::VariantGenOptions {
        keep_all_attributes: false,
        ..options.variants.clone()
    }
}

/// Rewrite a fragment with the cache entries already populated by earlier
/// fills; a fragment restricted to a pre-filtered slice evaluates faster.
async fn optimize_fragment(
    entry: &FragmentQueueEntry,
    cache: &dyn CacheHandler,
    options: &WorkerOptions,
) -> Result<String> {
    let extend_options = ExtendOptions::new();
    let variants = lookup_variants(options);

    if options.prefer_lazy_optimization && cache.lazy().is_some() {
        let (subquery, total, hits) =
            get_partition_keys_lazy(&entry.query, cache, &entry.partition_key, &variants).await?;
        if hits > 0 {
            if let Some(subquery) = subquery {
                let optimized = extend_query_with_partition_keys_lazy(
                    &entry.query,
                    &subquery,
                    &entry.partition_key,
                    Method::InSubquery,
                    &extend_options,
                )?;
                info!(
                    "applied lazy cache optimization to {}: {hits}/{total} cache hits",
                    entry.hash
                );
                return Ok(optimized);
            }
        }
        return Ok(entry.query.clone());
    }

    let (keys, total, hits) =
        get_partition_keys(&entry.query, cache, &entry.partition_key, &variants).await?;
    if hits >= options.min_cache_hits {
        if let Some(keys) = keys.filter(|set| !set.is_empty()) {
            // temp-table methods need a multi-statement round-trip the
            // executor does not perform; splice an IN-list instead
            let method = match options.cache_optimization_method {
                Method::In | Method::Values => options.cache_optimization_method,
                _ => Method::In,
            };
            let optimized = extend_query_with_partition_keys(
                &entry.query,
                &keys,
                &entry.partition_key,
                method,
                &extend_options,
            )?;
            info!(
                "applied cache optimization to {}: {hits}/{total} cache hits, {} keys",
                entry.hash,
                keys.len()
            );
            return Ok(optimized);
        }
    }
    Ok(entry.query.clone())
}

async fn process_fragment(
    entry: &FragmentQueueEntry,
    cache: &dyn CacheHandler,
    options: &WorkerOptions,
    timing: &QueryTimeLog,
) -> Result<bool> {
    let datatype = entry.datatype.unwrap_or(Datatype::Integer);
    cache
        .register_partition_key(
            &entry.partition_key,
            datatype,
            &RegisterOptions {
                bitsize: options.bitsize,
            },
        )
        .await?;

    let query_to_execute = if options.enable_cache_optimization {
        match optimize_fragment(entry, cache, options).await {
            Ok(optimized) => optimized,
            Err(e) => {
                warn!("failed to apply cache optimization to {}: {e:#}", entry.hash);
                entry.query.clone()
            }
        }
    } else {
        entry.query.clone()
    };

    let use_lazy = cache.lazy().is_some()
        && !options.force_recalculate
        && options.statement_timeout.is_zero()
        && !options.disable_lazy_insertion;
    if use_lazy {
        let lazy = cache.lazy().expect("capability checked above");
        let started = Instant::now();
        match lazy
            .set_cache_lazy(&entry.hash, &query_to_execute, &entry.query, &entry.partition_key)
            .await
        {
            Ok(()) => {
                let elapsed = started.elapsed().as_secs_f64();
                timing.record(&entry.hash, elapsed);
                info!("lazily stored {} in cache in {elapsed:.3}s", entry.hash);
                return Ok(true);
            }
            Err(e) if db::is_timeout_error(&e) => {
                timing.record(
                    &format!("{}_timeout", entry.hash),
                    started.elapsed().as_secs_f64(),
                );
                info!("fragment {} is a long running query", entry.hash);
                cache
                    .set_query_status(&entry.hash, &entry.partition_key, QueryStatus::Timeout)
                    .await?;
                return Ok(true);
            }
            Err(e) => {
                timing.record(
                    &format!("{}_lazy_failed", entry.hash),
                    started.elapsed().as_secs_f64(),
                );
                warn!(
                    "lazy insertion failed for {}: {e:#}, falling back to execution",
                    entry.hash
                );
            }
        }
    }

    if datatype == Datatype::Geometry {
        // spatial results never materialise in the client
        error!(
            "geometry partition '{}' requires lazy insertion for fragment {}",
            entry.partition_key, entry.hash
        );
        cache
            .set_query_status(&entry.hash, &entry.partition_key, QueryStatus::Failed)
            .await?;
        return Ok(false);
    }

    let started = Instant::now();
    match db::execute_fragment(
        &options.target_db_uri,
        &query_to_execute,
        &entry.partition_key,
        datatype,
        options.statement_timeout,
    )
    .await
    {
        Ok(values) => {
            let elapsed = started.elapsed().as_secs_f64();
            timing.record(&entry.hash, elapsed);
            info!(
                "fragment {} returned {} values in {elapsed:.3}s",
                entry.hash,
                values.len()
            );
            if let Some(limit) = options.limit {
                if values.len() >= limit {
                    info!("fragment {} limited to {limit} partition keys", entry.hash);
                    cache
                        .set_query_status(&entry.hash, &entry.partition_key, QueryStatus::Failed)
                        .await?;
                    return Ok(true);
                }
            }
            cache.set_cache(&entry.hash, &values, &entry.partition_key).await?;
            cache.set_query(&entry.hash, &entry.query, &entry.partition_key).await?;
            Ok(true)
        }
        Err(e) if db::is_timeout_error(&e) => {
            timing.record(
                &format!("{}_timeout", entry.hash),
                started.elapsed().as_secs_f64(),
            );
            warn!("fragment {} was cancelled by the statement timeout", entry.hash);
            cache
                .set_query_status(&entry.hash, &entry.partition_key, QueryStatus::Timeout)
                .await?;
            Ok(true)
        }
        Err(e) => {
            timing.record(
                &format!("{}_error", entry.hash),
                started.elapsed().as_secs_f64(),
            );
            error!("failed to execute fragment {}: {e:#}", entry.hash);
            cache
                .set_query_status(&entry.hash, &entry.partition_key, QueryStatus::Failed)
                .await?;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_saturates() {
        assert_eq!(error_backoff(1), Duration::from_secs_f64(1.0));
        assert_eq!(error_backoff(2), Duration::from_secs_f64(2.0));
        assert_eq!(error_backoff(3), Duration::from_secs_f64(4.0));
        assert_eq!(error_backoff(4), Duration::from_secs_f64(5.0));
        assert_eq!(error_backoff(10), Duration::from_secs_f64(5.0));
    }

    #[test]
    fn status_reasons_follow_the_pool_state() {
        assert_eq!(status_reason(12, 12, 5), "waiting for thread capacity");
        assert_eq!(status_reason(0, 12, 0), "waiting for work");
        assert_eq!(status_reason(3, 12, 5), "normal processing");
    }
}

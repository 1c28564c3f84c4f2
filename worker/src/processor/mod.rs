//! In-DBMS fill worker: the same consume-evaluate-store loop as the
//! external worker, executed entirely inside PostgreSQL and driven by
//! pg_cron. A config row per logical processor controls scheduling through
//! a trigger; an active-jobs table bounds parallel cron invocations.

pub mod sql;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use partitioncache_cache::ConfigError;
use partitioncache_cache::identifiers::validate_identifier;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

/// One logical processor's configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub enabled: bool,
    pub frequency_seconds: i32,
    pub timeout_seconds: i32,
    pub max_parallel_jobs: i32,
    /// Cache table prefix in the target database
    pub table_prefix: String,
    /// Queue table prefix
    pub queue_prefix: String,
    pub cache_backend: String,
    pub target_database: String,
    pub default_bitsize: Option<i64>,
}

/// Backends whose payload the processing function can build in SQL. The
/// roaring backend packs its bitmap client-side, so it only fills through
/// the external worker.
const IN_DATABASE_BACKENDS: &[&str] = &["postgresql_array", "postgresql_bit"];

impl ProcessorConfig {
    /// Deterministic pg_cron job name for this processor.
    pub fn job_name(&self) -> String {
        format!(
            "partitioncache_process_{}_{}",
            self.target_database, self.table_prefix
        )
    }

    fn validate(&self) -> Result<()> {
        validate_identifier(&self.table_prefix, "table prefix")?;
        validate_identifier(&self.queue_prefix, "queue table prefix")?;
        if !IN_DATABASE_BACKENDS.contains(&self.cache_backend.as_str()) {
            return Err(ConfigError::Other(format!(
                "cache backend '{}' is not supported by the in-database processor; \
                 use 'postgresql_array' or 'postgresql_bit', or run the external worker",
                self.cache_backend
            ))
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorStatus {
    pub config: ProcessorConfig,
    pub cron_schedule: Option<String>,
    pub cron_active: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProcessorLogEntry {
    pub job_id: Option<String>,
    pub query_hash: Option<String>,
    pub partition_key: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Whether pg_cron is installed; attempts the extension creation once when
/// it is merely not yet installed.
pub async fn check_pg_cron_installed(cron_pool: &PgPool) -> bool {
    let installed = sqlx::query("SELECT 1 FROM pg_extension WHERE extname = 'pg_cron'")
        .fetch_optional(cron_pool)
        .await;
    match installed {
        Ok(Some(_)) => true,
        Ok(None) => sqlx::query("CREATE EXTENSION IF NOT EXISTS pg_cron")
            .execute(cron_pool)
            .await
            .is_ok(),
        Err(e) => {
            warn!("pg_cron extension not available: {e}");
            false
        }
    }
}

/// Install the worker objects into the database holding the queues and
/// cache tables.
pub async fn install_worker_objects(work_pool: &PgPool, queue_prefix: &str) -> Result<()> {
    validate_identifier(queue_prefix, "queue table prefix")?;
    sqlx::raw_sql(&sql::config_tables(queue_prefix))
        .execute(work_pool)
        .await
        .with_context(|| "creating processor tables")?;
    sqlx::raw_sql(&sql::process_queue_function(queue_prefix))
        .execute(work_pool)
        .await
        .with_context(|| "creating the queue processing function")?;
    Ok(())
}

async fn upsert_config(pool: &PgPool, config: &ProcessorConfig) -> Result<()> {
    let sql = format!(
        "INSERT INTO {}_processor_config
             (job_name, enabled, frequency_seconds, timeout_seconds, max_parallel_jobs,
              table_prefix, queue_prefix, cache_backend, target_database, default_bitsize)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         ON CONFLICT (job_name) DO UPDATE SET
             enabled = EXCLUDED.enabled,
             frequency_seconds = EXCLUDED.frequency_seconds,
             timeout_seconds = EXCLUDED.timeout_seconds,
             max_parallel_jobs = EXCLUDED.max_parallel_jobs,
             cache_backend = EXCLUDED.cache_backend,
             default_bitsize = EXCLUDED.default_bitsize,
             updated_at = now()",
        config.queue_prefix
    );
    sqlx::query(&sql)
        .bind(config.job_name())
        .bind(config.enabled)
        .bind(config.frequency_seconds)
        .bind(config.timeout_seconds)
        .bind(config.max_parallel_jobs)
        .bind(&config.table_prefix)
        .bind(&config.queue_prefix)
        .bind(&config.cache_backend)
        .bind(&config.target_database)
        .bind(config.default_bitsize)
        .execute(pool)
        .await?;
    Ok(())
}

/// Set up the in-DBMS processor. `cron_pool` is the database pg_cron runs
/// in; when it differs from the work database a minimal config replica
/// lives in the work database so the worker function needs no cross-
/// database link.
pub async fn setup(
    work_pool: &PgPool,
    cron_pool: &PgPool,
    cron_is_work_db: bool,
    config: &ProcessorConfig,
) -> Result<()> {
    config.validate()?;
    let pg_cron_available = check_pg_cron_installed(cron_pool).await;
    if config.enabled && !pg_cron_available {
        return Err(ConfigError::PgCronUnavailable(
            "cannot enable the processor, the pg_cron extension is not installed; \
             set up with enabled=false and use 'manual-process', or install pg_cron"
                .to_string(),
        )
        .into());
    }

    install_worker_objects(work_pool, &config.queue_prefix).await?;
    upsert_config(work_pool, config).await?;

    if !cron_is_work_db {
        // the scheduling side needs its own config copy next to cron.job
        sqlx::raw_sql(&sql::config_tables(&config.queue_prefix))
            .execute(cron_pool)
            .await?;
    }
    if pg_cron_available {
        sqlx::raw_sql(&sql::cron_sync_trigger(&config.queue_prefix))
            .execute(cron_pool)
            .await
            .with_context(|| "installing the cron scheduling trigger")?;
        if !cron_is_work_db {
            upsert_config(cron_pool, config).await?;
        }
        info!(
            "processor setup complete, job '{}' is managed via pg_cron",
            config.job_name()
        );
    } else {
        info!(
            "processor setup complete; pg_cron is not available, use 'manual-process' \
             or install pg_cron for automated processing"
        );
    }
    Ok(())
}

/// Flip the enabled flag; the config trigger (un)schedules the cron job.
pub async fn set_enabled(cron_pool: &PgPool, queue_prefix: &str, enabled: bool) -> Result<u64> {
    validate_identifier(queue_prefix, "queue table prefix")?;
    let sql = format!(
        "UPDATE {queue_prefix}_processor_config SET enabled = $1, updated_at = now()"
    );
    let result = sqlx::query(&sql).bind(enabled).execute(cron_pool).await?;
    info!(
        "processor {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(result.rows_affected())
}

/// Partial config update; unspecified fields keep their values.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub enabled: Option<bool>,
    pub frequency_seconds: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub max_parallel_jobs: Option<i32>,
    pub default_bitsize: Option<i64>,
}

pub async fn update_config(
    cron_pool: &PgPool,
    queue_prefix: &str,
    update: &ConfigUpdate,
) -> Result<u64> {
    validate_identifier(queue_prefix, "queue table prefix")?;
    let sql = format!(
        "UPDATE {queue_prefix}_processor_config SET
             enabled = COALESCE($1, enabled),
             frequency_seconds = COALESCE($2, frequency_seconds),
             timeout_seconds = COALESCE($3, timeout_seconds),
             max_parallel_jobs = COALESCE($4, max_parallel_jobs),
             default_bitsize = COALESCE($5, default_bitsize),
             updated_at = now()"
    );
    let result = sqlx::query(&sql)
        .bind(update.enabled)
        .bind(update.frequency_seconds)
        .bind(update.timeout_seconds)
        .bind(update.max_parallel_jobs)
        .bind(update.default_bitsize)
        .execute(cron_pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn get_status(cron_pool: &PgPool, queue_prefix: &str) -> Result<Option<ProcessorStatus>> {
    validate_identifier(queue_prefix, "queue table prefix")?;
    let sql = format!(
        "SELECT job_name, enabled, frequency_seconds, timeout_seconds, max_parallel_jobs,
                table_prefix, queue_prefix, cache_backend, target_database, default_bitsize,
                updated_at
         FROM {queue_prefix}_processor_config LIMIT 1"
    );
    let Some(row) = sqlx::query(&sql).fetch_optional(cron_pool).await? else {
        return Ok(None);
    };
    let config = ProcessorConfig {
        enabled: row.try_get("enabled")?,
        frequency_seconds: row.try_get("frequency_seconds")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        max_parallel_jobs: row.try_get("max_parallel_jobs")?,
        table_prefix: row.try_get("table_prefix")?,
        queue_prefix: row.try_get("queue_prefix")?,
        cache_backend: row.try_get("cache_backend")?,
        target_database: row.try_get("target_database")?,
        default_bitsize: row.try_get("default_bitsize")?,
    };
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    let cron_row = sqlx::query("SELECT schedule, active FROM cron.job WHERE jobname = $1")
        .bind(config.job_name())
        .fetch_optional(cron_pool)
        .await
        .unwrap_or(None);
    let (cron_schedule, cron_active) = match cron_row {
        Some(row) => (row.try_get("schedule").ok(), row.try_get("active").ok()),
        None => (None, None),
    };
    Ok(Some(ProcessorStatus {
        config,
        cron_schedule,
        cron_active,
        updated_at,
    }))
}

#[derive(Debug, Clone, Default)]
pub struct ProcessorCounters {
    pub active_jobs: i64,
    pub recent_successes: i64,
    pub recent_timeouts: i64,
    pub recent_failures: i64,
}

/// Counters over the active-jobs table and the last day of logs.
pub async fn get_counters(work_pool: &PgPool, queue_prefix: &str) -> Result<ProcessorCounters> {
    validate_identifier(queue_prefix, "queue table prefix")?;
    let sql = format!(
        "SELECT
             (SELECT COUNT(*) FROM {queue_prefix}_active_jobs) AS active_jobs,
             (SELECT COUNT(*) FROM {queue_prefix}_processor_log
              WHERE status = 'success' AND created_at > now() - interval '1 day')
                 AS recent_successes,
             (SELECT COUNT(*) FROM {queue_prefix}_processor_log
              WHERE status = 'timeout' AND created_at > now() - interval '1 day')
                 AS recent_timeouts,
             (SELECT COUNT(*) FROM {queue_prefix}_processor_log
              WHERE status = 'failed' AND created_at > now() - interval '1 day')
                 AS recent_failures"
    );
    let row = sqlx::query(&sql).fetch_one(work_pool).await?;
    Ok(ProcessorCounters {
        active_jobs: row.try_get("active_jobs")?,
        recent_successes: row.try_get("recent_successes")?,
        recent_timeouts: row.try_get("recent_timeouts")?,
        recent_failures: row.try_get("recent_failures")?,
    })
}

pub async fn get_logs(
    work_pool: &PgPool,
    queue_prefix: &str,
    limit: i64,
) -> Result<Vec<ProcessorLogEntry>> {
    validate_identifier(queue_prefix, "queue table prefix")?;
    let sql = format!(
        "SELECT job_id, query_hash, partition_key, status, error_message,
                execution_time_ms, created_at
         FROM {queue_prefix}_processor_log
         ORDER BY created_at DESC LIMIT $1"
    );
    let rows = sqlx::query(&sql).bind(limit).fetch_all(work_pool).await?;
    let mut entries = vec![];
    for row in rows {
        entries.push(ProcessorLogEntry {
            job_id: row.try_get("job_id")?,
            query_hash: row.try_get("query_hash")?,
            partition_key: row.try_get("partition_key")?,
            status: row.try_get("status")?,
            error_message: row.try_get("error_message")?,
            execution_time_ms: row.try_get("execution_time_ms")?,
            created_at: row.try_get("created_at")?,
        });
    }
    Ok(entries)
}

/// Run one processing round synchronously, bypassing pg_cron.
pub async fn manual_process(work_pool: &PgPool, queue_prefix: &str, count: i32) -> Result<i32> {
    validate_identifier(queue_prefix, "queue table prefix")?;
    let sql = format!("SELECT {queue_prefix}_process_queue($1) AS processed");
    let row = sqlx::query(&sql).bind(count).fetch_one(work_pool).await?;
    Ok(row.try_get("processed")?)
}

/// Remove every processor object. The config delete trigger unschedules the
/// cron job; a direct cron.job sweep covers installs without the trigger.
pub async fn remove(work_pool: &PgPool, cron_pool: &PgPool, queue_prefix: &str) -> Result<()> {
    validate_identifier(queue_prefix, "queue table prefix")?;
    let delete_config = format!("DELETE FROM {queue_prefix}_processor_config");
    if let Err(e) = sqlx::query(&delete_config).execute(cron_pool).await {
        warn!("failed to delete processor config rows: {e}");
    }
    let _ = sqlx::query("DELETE FROM cron.job WHERE jobname LIKE 'partitioncache_process_%'")
        .execute(cron_pool)
        .await;
    sqlx::raw_sql(&sql::drop_objects(queue_prefix))
        .execute(work_pool)
        .await?;
    info!("processor objects removed");
    Ok(())
}

/// Verify (and where permitted grant) the privileges the scheduling trigger
/// needs on the cron schema.
pub async fn check_permissions(cron_pool: &PgPool) -> Result<Vec<String>> {
    let row = sqlx::query(
        "SELECT
             has_schema_privilege(current_user, 'cron', 'USAGE') AS cron_usage,
             has_function_privilege(current_user,
                 'cron.schedule_in_database(text,text,text,text,text,boolean)',
                 'EXECUTE') AS schedule_exec,
             has_function_privilege(current_user, 'cron.unschedule(bigint)', 'EXECUTE')
                 AS unschedule_exec",
    )
    .fetch_one(cron_pool)
    .await
    .with_context(|| "checking pg_cron permissions (is pg_cron installed?)")?;

    let mut messages = vec![];
    let cron_usage: bool = row.try_get("cron_usage")?;
    let schedule_exec: bool = row.try_get("schedule_exec")?;
    let unschedule_exec: bool = row.try_get("unschedule_exec")?;

    if cron_usage && schedule_exec && unschedule_exec {
        messages.push("all pg_cron permissions are in place".to_string());
        return Ok(messages);
    }
    if !cron_usage {
        match sqlx::query("GRANT USAGE ON SCHEMA cron TO current_user")
            .execute(cron_pool)
            .await
        {
            Ok(_) => messages.push("granted USAGE on schema cron".to_string()),
            Err(_) => messages.push(
                "missing USAGE on schema cron; run: GRANT USAGE ON SCHEMA cron TO <user>"
                    .to_string(),
            ),
        }
    }
    if !schedule_exec {
        match sqlx::query("GRANT EXECUTE ON FUNCTION cron.schedule_in_database TO current_user")
            .execute(cron_pool)
            .await
        {
            Ok(_) => messages.push("granted EXECUTE on cron.schedule_in_database".to_string()),
            Err(_) => messages.push(
                "missing EXECUTE on cron.schedule_in_database; run: \
                 GRANT EXECUTE ON FUNCTION cron.schedule_in_database TO <user>"
                    .to_string(),
            ),
        }
    }
    if !unschedule_exec {
        match sqlx::query("GRANT EXECUTE ON FUNCTION cron.unschedule TO current_user")
            .execute(cron_pool)
            .await
        {
            Ok(_) => messages.push("granted EXECUTE on cron.unschedule".to_string()),
            Err(_) => messages.push(
                "missing EXECUTE on cron.unschedule; run: \
                 GRANT EXECUTE ON FUNCTION cron.unschedule TO <user>"
                    .to_string(),
            ),
        }
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProcessorConfig {
        ProcessorConfig {
            enabled: false,
            frequency_seconds: 60,
            timeout_seconds: 1800,
            max_parallel_jobs: 2,
            table_prefix: "partitioncache".to_string(),
            queue_prefix: "partitioncache_queue".to_string(),
            cache_backend: "postgresql_array".to_string(),
            target_database: "analytics".to_string(),
            default_bitsize: None,
        }
    }

    #[test]
    fn job_name_is_deterministic() {
        assert_eq!(
            config().job_name(),
            "partitioncache_process_analytics_partitioncache"
        );
    }

    #[test]
    fn generated_sql_references_prefixed_objects() {
        let tables = sql::config_tables("pcq");
        assert!(tables.contains("pcq_processor_config"));
        assert!(tables.contains("pcq_active_jobs"));
        let function = sql::process_queue_function("pcq");
        assert!(function.contains("pcq_process_queue"));
        assert!(function.contains("FOR UPDATE SKIP LOCKED"));
        assert!(function.contains("make_interval"));
        let trigger = sql::cron_sync_trigger("pcq");
        assert!(trigger.contains("cron.schedule_in_database"));
        assert!(trigger.contains("pcq_processor_config_sync"));
    }

    #[test]
    fn invalid_prefix_is_rejected() {
        let mut bad = config();
        bad.queue_prefix = "bad-prefix".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn client_side_backends_are_rejected_at_setup() {
        let mut roaring = config();
        roaring.cache_backend = "postgresql_roaringbit".to_string();
        let error = roaring.validate().unwrap_err();
        assert!(
            error.downcast_ref::<ConfigError>().is_some(),
            "expected a configuration error, got: {error:#}"
        );
        let mut memory = config();
        memory.cache_backend = "memory".to_string();
        assert!(memory.validate().is_err());
    }

    #[test]
    fn unsupported_backends_raise_inside_the_sql_function() {
        let function = sql::process_queue_function("pcq");
        assert!(function.contains("ELSIF v_backend = 'postgresql_array'"));
        assert!(function.contains("is not supported by the in-database processor"));
    }
}

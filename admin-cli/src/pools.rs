use anyhow::{Context, Result};
use partitioncache_cache::CacheEnv;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Connection pools for the in-DBMS processor: the work database (queues
/// and cache tables) and the database pg_cron is installed in. The two may
/// differ; `PG_CRON_*` variables override the cache connection settings,
/// `PG_CRON_DATABASE` alone switches only the database.
pub async fn processor_pools(cache_env: &CacheEnv) -> Result<(PgPool, PgPool, bool)> {
    let work_pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&cache_env.connection_string())
        .await
        .with_context(|| "connecting to the work database")?;

    let cron_host = std::env::var("PG_CRON_HOST").unwrap_or_else(|_| cache_env.host.clone());
    let cron_port = match std::env::var("PG_CRON_PORT") {
        Ok(raw) => raw
            .parse::<u16>()
            .with_context(|| format!("invalid PG_CRON_PORT '{raw}'"))?,
        Err(_) => cache_env.port,
    };
    let cron_user = std::env::var("PG_CRON_USER").unwrap_or_else(|_| cache_env.user.clone());
    let cron_password =
        std::env::var("PG_CRON_PASSWORD").unwrap_or_else(|_| cache_env.password.clone());
    let cron_database =
        std::env::var("PG_CRON_DATABASE").unwrap_or_else(|_| cache_env.database.clone());

    let cron_is_work_db = cron_host == cache_env.host
        && cron_port == cache_env.port
        && cron_database == cache_env.database;
    if cron_is_work_db {
        return Ok((work_pool.clone(), work_pool, true));
    }

    let cron_uri = format!(
        "postgres://{cron_user}:{cron_password}@{cron_host}:{cron_port}/{cron_database}"
    );
    let cron_pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&cron_uri)
        .await
        .with_context(|| "connecting to the pg_cron database")?;
    Ok((work_pool, cron_pool, false))
}

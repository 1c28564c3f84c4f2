//! Durable priority queues feeding the asynchronous fill pipeline.
//!
//! Two queues: original queries pushed by host applications and query
//! fragments produced from them. Both are priority queues (highest first,
//! FIFO within a priority); pushing a duplicate bumps its priority instead
//! of inserting a second row. The PostgreSQL provider implements efficient
//! blocking pops over LISTEN/NOTIFY; a Redis provider satisfies the same
//! interface with list commands.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Environment-driven queue configuration
pub mod config;
/// Queue entries and the provider trait
pub mod model;
/// PostgreSQL provider (tables, triggers, SKIP LOCKED pops)
pub mod postgres;
/// Redis provider (JSON entries over lists)
pub mod redis_queue;

pub use config::QueueEnv;
pub use model::{FragmentQueueEntry, OriginalQueueEntry, QueueHandler, QueueLengths};
pub use postgres::PostgresQueueHandler;
pub use redis_queue::RedisQueueHandler;

use anyhow::Result;
use partitioncache_cache::ConfigError;
use std::sync::Arc;

/// Connect the queue provider selected by `QUERY_QUEUE_PROVIDER`.
pub async fn connect_queue_handler() -> Result<Arc<dyn QueueHandler>> {
    let env = QueueEnv::from_env()?;
    match env.provider.as_str() {
        "postgresql" => {
            let handler = PostgresQueueHandler::connect(&env).await?;
            handler.setup().await?;
            Ok(Arc::new(handler))
        }
        "redis" => Ok(Arc::new(RedisQueueHandler::connect(&env)?)),
        other => Err(ConfigError::UnknownQueueProvider(other.to_string()).into()),
    }
}

/// Check that the selected provider's environment is complete.
pub fn validate_queue_configuration() -> Result<()> {
    QueueEnv::from_env()?;
    Ok(())
}

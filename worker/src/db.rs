use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use partitioncache_cache::{Datatype, Value, ValueSet};
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Row};
use std::time::Duration;

/// Whether an execution error is the configured statement timeout firing.
pub fn is_timeout_error(error: &anyhow::Error) -> bool {
    let message = format!("{error:#}").to_lowercase();
    message.contains("statement timeout")
        || message.contains("canceling statement")
        || message.contains("query_canceled")
}

fn typed_wrapper(fragment_sql: &str, partition_key: &str, datatype: Datatype) -> Result<String> {
    let cast = match datatype {
        Datatype::Integer => "bigint",
        Datatype::Float => "double precision",
        Datatype::Text => "text",
        Datatype::Timestamp => "timestamptz",
        Datatype::Geometry => {
            // geometry results only stream through lazy insertion
            anyhow::bail!("geometry fragments cannot be fetched into the client");
        }
    };
    Ok(format!(
        "SELECT q.{partition_key}::{cast} AS v FROM ({fragment_sql}) AS q"
    ))
}

/// Evaluate a fragment against the target DBMS and collect the distinct
/// partition-key values. Each call owns a fresh connection so transaction
/// state never leaks between concurrent jobs.
pub async fn execute_fragment(
    target_db_uri: &str,
    fragment_sql: &str,
    partition_key: &str,
    datatype: Datatype,
    statement_timeout: Duration,
) -> Result<ValueSet> {
    let wrapped = typed_wrapper(fragment_sql, partition_key, datatype)?;
    let mut connection = PgConnection::connect(target_db_uri)
        .await
        .with_context(|| "connecting to the target database")?;
    if !statement_timeout.is_zero() {
        sqlx::query(&format!(
            "SET statement_timeout = {}",
            statement_timeout.as_millis()
        ))
        .execute(&mut connection)
        .await?;
    }
    let rows = sqlx::query(&wrapped)
        .fetch_all(&mut connection)
        .await
        .with_context(|| "executing fragment against the target database")?;
    let mut values = ValueSet::new();
    for row in rows {
        let value = match datatype {
            Datatype::Integer => Value::Int(row.try_get::<i64, _>("v")?),
            Datatype::Float => Value::Float(row.try_get::<f64, _>("v")?),
            Datatype::Text => Value::Text(row.try_get::<String, _>("v")?),
            Datatype::Timestamp => Value::Timestamp(row.try_get::<DateTime<Utc>, _>("v")?),
            Datatype::Geometry => unreachable!("rejected by typed_wrapper"),
        };
        values.insert(value);
    }
    let _ = connection.close().await;
    Ok(values)
}

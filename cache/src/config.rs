use crate::errors::ConfigError;
use crate::identifiers::validate_identifier;
use anyhow::Result;

pub const DEFAULT_TABLE_PREFIX: &str = "partitioncache";
pub const DEFAULT_BITSIZE: i64 = 100_000;

/// Connection settings for the cache database, read from the environment.
#[derive(Debug, Clone)]
pub struct CacheEnv {
    pub backend: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub table_prefix: String,
    pub bitsize: i64,
}

fn collect_env(names: &[&str]) -> Result<Vec<String>, ConfigError> {
    let mut values = vec![];
    let mut missing = vec![];
    for name in names {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => values.push(value),
            _ => missing.push(name.to_string()),
        }
    }
    if missing.is_empty() {
        Ok(values)
    } else {
        Err(ConfigError::MissingEnv(missing))
    }
}

impl CacheEnv {
    /// Read `CACHE_BACKEND` and the `PG_CACHE_*` connection settings.
    /// Missing variables are reported all at once.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = std::env::var("CACHE_BACKEND").unwrap_or_else(|_| "postgresql_bit".to_string());
        let values = collect_env(&[
            "PG_CACHE_HOST",
            "PG_CACHE_PORT",
            "PG_CACHE_USER",
            "PG_CACHE_PASSWORD",
            "PG_CACHE_DB",
        ])?;
        let port: u16 = values[1]
            .parse()
            .map_err(|_| ConfigError::Other(format!("invalid PG_CACHE_PORT '{}'", values[1])))?;
        let table_prefix = std::env::var("PG_CACHE_TABLE_PREFIX")
            .unwrap_or_else(|_| DEFAULT_TABLE_PREFIX.to_string());
        validate_identifier(&table_prefix, "table prefix")?;
        let bitsize = match std::env::var("PG_CACHE_BITSIZE") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Other(format!("invalid PG_CACHE_BITSIZE '{raw}'")))?,
            Err(_) => DEFAULT_BITSIZE,
        };
        Ok(Self {
            backend,
            host: values[0].clone(),
            port,
            user: values[2].clone(),
            password: values[3].clone(),
            database: values[4].clone(),
            table_prefix,
            bitsize,
        })
    }

    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

use partitioncache_cache::ConfigError;
use partitioncache_cache::identifiers::validate_identifier;

pub const DEFAULT_QUEUE_TABLE_PREFIX: &str = "partitioncache_queue";

/// Queue provider settings, read from the environment. The provider decides
/// which connection variables are required; every missing name is reported.
#[derive(Debug, Clone)]
pub struct QueueEnv {
    pub provider: String,
    // postgresql provider
    pub pg_host: Option<String>,
    pub pg_port: Option<u16>,
    pub pg_user: Option<String>,
    pub pg_password: Option<String>,
    pub pg_database: Option<String>,
    pub table_prefix: String,
    // redis provider
    pub redis_host: Option<String>,
    pub redis_port: Option<u16>,
    pub redis_password: Option<String>,
    pub redis_db: Option<u32>,
    pub redis_queue_key: Option<String>,
}

fn required(names: &[&str]) -> Result<Vec<String>, ConfigError> {
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

fn parse_port(name: &str, raw: &str) -> Result<u16, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::Other(format!("invalid {name} '{raw}'")))
}

impl QueueEnv {
    pub fn from_env() -> Result<Self, ConfigError> {
        let provider =
            std::env::var("QUERY_QUEUE_PROVIDER").unwrap_or_else(|_| "postgresql".to_string());
        let table_prefix = std::env::var("PG_QUEUE_TABLE_PREFIX")
            .unwrap_or_else(|_| DEFAULT_QUEUE_TABLE_PREFIX.to_string());
        validate_identifier(&table_prefix, "queue table prefix")?;

        let mut env = Self {
            provider: provider.clone(),
            pg_host: None,
            pg_port: None,
            pg_user: None,
            pg_password: None,
            pg_database: None,
            table_prefix,
            redis_host: None,
            redis_port: None,
            redis_password: std::env::var("REDIS_PASSWORD").ok(),
            redis_db: None,
            redis_queue_key: None,
        };

        match provider.as_str() {
            "postgresql" => {
                let values = required(&[
                    "PG_QUEUE_HOST",
                    "PG_QUEUE_PORT",
                    "PG_QUEUE_USER",
                    "PG_QUEUE_PASSWORD",
                    "PG_QUEUE_DB",
                ])?;
                env.pg_host = Some(values[0].clone());
                env.pg_port = Some(parse_port("PG_QUEUE_PORT", &values[1])?);
                env.pg_user = Some(values[2].clone());
                env.pg_password = Some(values[3].clone());
                env.pg_database = Some(values[4].clone());
            }
            "redis" => {
                let values = required(&[
                    "REDIS_HOST",
                    "REDIS_PORT",
                    "QUERY_QUEUE_REDIS_DB",
                    "QUERY_QUEUE_REDIS_QUEUE_KEY",
                ])?;
                env.redis_host = Some(values[0].clone());
                env.redis_port = Some(parse_port("REDIS_PORT", &values[1])?);
                env.redis_db = Some(values[2].parse().map_err(|_| {
                    ConfigError::Other(format!("invalid QUERY_QUEUE_REDIS_DB '{}'", values[2]))
                })?);
                env.redis_queue_key = Some(values[3].clone());
            }
            other => return Err(ConfigError::UnknownQueueProvider(other.to_string())),
        }
        Ok(env)
    }

    pub fn pg_connection_string(&self) -> Result<String, ConfigError> {
        match (
            &self.pg_user,
            &self.pg_password,
            &self.pg_host,
            &self.pg_port,
            &self.pg_database,
        ) {
            (Some(user), Some(password), Some(host), Some(port), Some(database)) => Ok(format!(
                "postgres://{user}:{password}@{host}:{port}/{database}"
            )),
            _ => Err(ConfigError::MissingEnv(vec![
                "PG_QUEUE_HOST".into(),
                "PG_QUEUE_PORT".into(),
                "PG_QUEUE_USER".into(),
                "PG_QUEUE_PASSWORD".into(),
                "PG_QUEUE_DB".into(),
            ])),
        }
    }

    pub fn redis_url(&self) -> Result<String, ConfigError> {
        match (&self.redis_host, &self.redis_port, &self.redis_db) {
            (Some(host), Some(port), Some(db)) => Ok(match &self.redis_password {
                Some(password) => format!("redis://:{password}@{host}:{port}/{db}"),
                None => format!("redis://{host}:{port}/{db}"),
            }),
            _ => Err(ConfigError::MissingEnv(vec![
                "REDIS_HOST".into(),
                "REDIS_PORT".into(),
                "QUERY_QUEUE_REDIS_DB".into(),
            ])),
        }
    }
}

use thiserror::Error;

/// Configuration errors: wrong environment, wrong identifiers, capability or
/// datatype misuse. The CLI maps these to exit code 1; everything else is a
/// runtime failure (exit code 2).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<String>),

    #[error("invalid {kind} '{value}': only alphanumeric characters and underscores are allowed")]
    InvalidIdentifier { kind: &'static str, value: String },

    #[error(
        "partition key '{partition_key}' is registered with datatype '{existing}', \
         cannot register it with '{requested}'"
    )]
    DatatypeMismatch {
        partition_key: String,
        existing: String,
        requested: String,
    },

    #[error("unknown datatype '{0}'")]
    UnknownDatatype(String),

    #[error("datatype '{datatype}' is not supported by the '{backend}' backend")]
    UnsupportedDatatype {
        backend: &'static str,
        datatype: String,
    },

    #[error("value {value} does not fit bitsize {bitsize} of partition '{partition_key}'")]
    BitsizeExceeded {
        partition_key: String,
        value: i64,
        bitsize: i64,
    },

    #[error("cache backend '{0}' does not support lazy intersection")]
    LazyUnsupported(String),

    #[error("cache backend '{0}' does not support spatial filtering")]
    SpatialUnsupported(String),

    #[error("unknown cache backend '{0}'")]
    UnknownBackend(String),

    #[error("unknown queue provider '{0}', expected 'postgresql' or 'redis'")]
    UnknownQueueProvider(String),

    #[error("pg_cron is not available: {0}")]
    PgCronUnavailable(String),

    #[error("{0}")]
    Other(String),
}

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigError;

/// Datatype of a partition key. Registered once per partition key and
/// immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Integer,
    Float,
    Text,
    Timestamp,
    Geometry,
}

impl Datatype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Integer => "integer",
            Datatype::Float => "float",
            Datatype::Text => "text",
            Datatype::Timestamp => "timestamp",
            Datatype::Geometry => "geometry",
        }
    }

    /// SQL column type of the array payload for this datatype.
    pub fn array_column_type(&self) -> &'static str {
        match self {
            Datatype::Integer => "BIGINT[]",
            Datatype::Float => "DOUBLE PRECISION[]",
            Datatype::Text => "TEXT[]",
            Datatype::Timestamp => "TIMESTAMPTZ[]",
            Datatype::Geometry => "BYTEA[]",
        }
    }

    /// SQL scalar type used for temporary partition-key tables.
    pub fn scalar_column_type(&self) -> &'static str {
        match self {
            Datatype::Integer => "BIGINT",
            Datatype::Float => "DOUBLE PRECISION",
            Datatype::Text => "TEXT",
            Datatype::Timestamp => "TIMESTAMPTZ",
            Datatype::Geometry => "BYTEA",
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Datatype {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integer" => Ok(Datatype::Integer),
            "float" => Ok(Datatype::Float),
            "text" => Ok(Datatype::Text),
            "timestamp" => Ok(Datatype::Timestamp),
            "geometry" => Ok(Datatype::Geometry),
            other => Err(ConfigError::UnknownDatatype(other.to_string())),
        }
    }
}

/// A single partition key value. Totally ordered (floats via `total_cmp`)
/// so `BTreeSet<Value>` is the canonical set type.
///
/// Untagged serde representation; `Timestamp` is declared before `Text` so
/// RFC 3339 strings deserialize as timestamps, everything else as text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
    Geometry(Vec<u8>),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Int(_) => 0,
            Value::Float(_) => 1,
            Value::Text(_) => 2,
            Value::Timestamp(_) => 3,
            Value::Geometry(_) => 4,
        }
    }

    pub fn datatype(&self) -> Datatype {
        match self {
            Value::Int(_) => Datatype::Integer,
            Value::Float(_) => Datatype::Float,
            Value::Text(_) => Datatype::Text,
            Value::Timestamp(_) => Datatype::Timestamp,
            Value::Geometry(_) => Datatype::Geometry,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Render as a SQL literal for splicing into rewritten queries.
    pub fn sql_literal(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Text(v) => format!("'{}'", v.replace('\'', "''")),
            Value::Timestamp(v) => format!("'{}'", v.to_rfc3339()),
            Value::Geometry(v) => format!("'\\x{}'", hex::encode(v)),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Geometry(a), Value::Geometry(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// The canonical partition-key set type.
pub type ValueSet = BTreeSet<Value>;

/// Build a value set of integers; test and loader convenience.
pub fn int_set<I: IntoIterator<Item = i64>>(values: I) -> ValueSet {
    values.into_iter().map(Value::Int).collect()
}

/// Status of an attempted fragment evaluation. Anything but `Ok` is a
/// tombstone: it suppresses both reads and re-evaluation until cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Ok,
    Timeout,
    Failed,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Ok => "ok",
            QueryStatus::Timeout => "timeout",
            QueryStatus::Failed => "failed",
        }
    }

    pub fn is_tombstone(&self) -> bool {
        !matches!(self, QueryStatus::Ok)
    }
}

impl FromStr for QueryStatus {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(QueryStatus::Ok),
            "timeout" => Ok(QueryStatus::Timeout),
            "failed" => Ok(QueryStatus::Failed),
            other => Err(ConfigError::Other(format!("unknown query status '{other}'"))),
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged cache payload. `Null` means the fragment matched every partition
/// key (identity of intersection); tombstones record failed attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheEntry {
    Set(ValueSet),
    Null,
    Tombstone(QueryStatus),
}

/// Companion record for a cache entry; cheap existence checks never
/// materialise the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub hash: String,
    pub query: String,
    pub partition_key: String,
    pub status: QueryStatus,
    pub last_seen: DateTime<Utc>,
}

/// Strategy for shrinking an oversized partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Delete the entries with the earliest `last_seen` first
    Oldest,
    /// Delete the entries with the largest payloads first
    Largest,
}

impl FromStr for EvictionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oldest" => Ok(EvictionStrategy::Oldest),
            "largest" => Ok(EvictionStrategy::Largest),
            other => Err(ConfigError::Other(format!(
                "unknown eviction strategy '{other}', expected 'oldest' or 'largest'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_totally_ordered() {
        let mut set = ValueSet::new();
        set.insert(Value::Int(3));
        set.insert(Value::Int(1));
        set.insert(Value::Int(3));
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().next(), Some(&Value::Int(1)));

        let mut floats = ValueSet::new();
        floats.insert(Value::Float(2.5));
        floats.insert(Value::Float(f64::NAN));
        floats.insert(Value::Float(f64::NAN));
        assert_eq!(floats.len(), 2);
    }

    #[test]
    fn sql_literals_are_escaped() {
        assert_eq!(Value::Int(7).sql_literal(), "7");
        assert_eq!(Value::Text("o'brien".into()).sql_literal(), "'o''brien'");
    }

    #[test]
    fn datatype_round_trips_through_names() {
        for datatype in [
            Datatype::Integer,
            Datatype::Float,
            Datatype::Text,
            Datatype::Timestamp,
            Datatype::Geometry,
        ] {
            assert_eq!(datatype.as_str().parse::<Datatype>().unwrap(), datatype);
        }
        assert!("uuid".parse::<Datatype>().is_err());
    }
}

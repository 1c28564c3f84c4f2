use anyhow::Result;
use partitioncache_cache::ConfigError;
use partitioncache_query::VariantGenOptions;
use std::str::FromStr;

/// Physical strategy for splicing the partition-key restriction into the
/// rewritten query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `anchor.P IN (v1, v2, ...)`
    In,
    /// `anchor.P IN (VALUES (v1), (v2), ...)`
    Values,
    /// Materialise into a temporary table, restrict with `IN (SELECT ...)`
    TmpTableIn,
    /// Materialise into a temporary table, INNER JOIN the anchor to it
    TmpTableJoin,
    /// `anchor.P IN (<lazy sub-query>)`; lazy backends only
    InSubquery,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::In => "IN",
            Method::Values => "VALUES",
            Method::TmpTableIn => "TMP_TABLE_IN",
            Method::TmpTableJoin => "TMP_TABLE_JOIN",
            Method::InSubquery => "IN_SUBQUERY",
        }
    }
}

impl FromStr for Method {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN" => Ok(Method::In),
            "VALUES" => Ok(Method::Values),
            "TMP_TABLE_IN" => Ok(Method::TmpTableIn),
            "TMP_TABLE_JOIN" => Ok(Method::TmpTableJoin),
            "IN_SUBQUERY" => Ok(Method::InSubquery),
            other => Err(ConfigError::Other(format!("unknown splice method '{other}'"))),
        }
    }
}

/// Options for the splice-only primitives.
#[derive(Debug, Clone, Default)]
pub struct ExtendOptions {
    /// Alias to splice onto; auto-detected when absent
    pub p0_alias: Option<String>,
    /// Create an index and ANALYZE temp tables after filling them
    pub analyze_tmp_table: bool,
    /// Partition-join detection settings for anchor auto-detection
    pub auto_detect_partition_join: bool,
    pub partition_join_table: Option<String>,
}

impl ExtendOptions {
    pub fn new() -> Self {
        Self {
            p0_alias: None,
            analyze_tmp_table: true,
            auto_detect_partition_join: true,
            partition_join_table: None,
        }
    }
}

/// Options for the complete apply-cache path.
#[derive(Debug, Clone)]
pub struct ApplyCacheOptions {
    pub method: Method,
    pub p0_alias: Option<String>,
    pub analyze_tmp_table: bool,
    /// Rewrite the query to the star schema around `<P>_mv AS p0`
    pub use_p0_table: bool,
    pub p0_table_name: Option<String>,
    /// Variant generation settings shared with the fill pipeline
    pub variants: VariantGenOptions,
    /// Buffer distance in meters; required in spatial mode
    pub buffer_distance: Option<f64>,
}

impl Default for ApplyCacheOptions {
    fn default() -> Self {
        // consumers look up with relaxed attributes and two-table components
        // to maximise the chance of a hit
        let variants = VariantGenOptions {
            min_component_size: 2,
            keep_all_attributes: false,
            ..VariantGenOptions::default()
        };
        Self {
            method: Method::In,
            p0_alias: None,
            analyze_tmp_table: true,
            use_p0_table: false,
            p0_table_name: None,
            variants,
            buffer_distance: None,
        }
    }
}

impl ApplyCacheOptions {
    pub fn extend_options(&self) -> ExtendOptions {
        ExtendOptions {
            p0_alias: self.p0_alias.clone(),
            analyze_tmp_table: self.analyze_tmp_table,
            auto_detect_partition_join: self.variants.auto_detect_partition_join,
            partition_join_table: self.variants.partition_join_table.clone(),
        }
    }
}

/// Statistics of one apply-cache invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub generated_variants: usize,
    pub cache_hits: usize,
    pub enhanced: bool,
    pub p0_rewritten: bool,
}

use anyhow::{Result, bail};
use std::collections::BTreeMap;
use std::sync::Once;
use tracing::warn;

static STAR_JOIN_TABLE_WARNING: Once = Once::new();
static AUTO_DETECT_STAR_JOIN_WARNING: Once = Once::new();

/// Options controlling fragment variant generation.
///
/// One typed record instead of loose keyword arguments; every layer that
/// generates hashes (rewriter, fill worker, CLI) passes the same struct so
/// producers and consumers agree on the hash space.
#[derive(Debug, Clone)]
pub struct VariantGenOptions {
    /// Minimum number of tables in a variant
    pub min_component_size: usize,
    /// Maximum number of tables in a variant (excluding the partition-join table)
    pub max_component_size: usize,
    /// Only enumerate table subsets connected through multi-table predicates
    pub follow_graph: bool,
    /// Keep every attribute condition fixed; `false` also emits variants
    /// with single conditions retained per table
    pub keep_all_attributes: bool,
    /// Canonicalize fragments (sorted conjuncts) before hashing
    pub canonicalize_queries: bool,
    /// Auto-detect a partition-join table from the query shape
    pub auto_detect_partition_join: bool,
    /// Explicit partition-join table, by alias or table name
    pub partition_join_table: Option<String>,
    /// Warn about tables that never touch the partition key
    pub warn_no_partition_key: bool,
    /// Replace the fragment SELECT list with `DISTINCT anchor.P`
    pub strip_select: bool,
    /// Skip the pairwise partition-key equijoins (spatial mode)
    pub skip_partition_key_joins: bool,
    /// Project this geometry column instead of the partition key (spatial mode)
    pub geometry_column: Option<String>,
    /// Bucket size for distance-literal quantisation; `<= 0` disables it
    pub bucket_steps: f64,
    /// Extra predicates to add per table name
    pub add_constraints: BTreeMap<String, String>,
    /// Attributes whose conditions are removed from every variant
    pub remove_constraints_all: Vec<String>,
    /// Attributes whose removal produces additional variants
    pub remove_constraints_add: Vec<String>,
}

impl Default for VariantGenOptions {
    fn default() -> Self {
        Self {
            min_component_size: 1,
            max_component_size: 15,
            follow_graph: true,
            keep_all_attributes: true,
            canonicalize_queries: false,
            auto_detect_partition_join: true,
            partition_join_table: None,
            warn_no_partition_key: true,
            strip_select: true,
            skip_partition_key_joins: false,
            geometry_column: None,
            bucket_steps: 1.0,
            add_constraints: BTreeMap::new(),
            remove_constraints_all: vec![],
            remove_constraints_add: vec![],
        }
    }
}

impl VariantGenOptions {
    pub fn with_min_component_size(mut self, size: usize) -> Self {
        self.min_component_size = size;
        self
    }

    pub fn with_partition_join_table(mut self, table: impl Into<String>) -> Self {
        self.partition_join_table = Some(table.into());
        self
    }

    /// Deprecated name for [`Self::with_partition_join_table`]. Warns once.
    pub fn with_star_join_table(mut self, table: impl Into<String>) -> Result<Self> {
        STAR_JOIN_TABLE_WARNING.call_once(|| {
            warn!("'star_join_table' is deprecated, use 'partition_join_table' instead");
        });
        if self.partition_join_table.is_some() {
            bail!("cannot set both 'partition_join_table' and deprecated 'star_join_table'");
        }
        self.partition_join_table = Some(table.into());
        Ok(self)
    }

    /// Deprecated name for setting [`Self::auto_detect_partition_join`]. Warns once.
    pub fn with_auto_detect_star_join(mut self, enabled: bool) -> Self {
        AUTO_DETECT_STAR_JOIN_WARNING.call_once(|| {
            warn!("'auto_detect_star_join' is deprecated, use 'auto_detect_partition_join' instead");
        });
        self.auto_detect_partition_join = enabled;
        self
    }
}

use crate::extend::{extend_query_with_partition_keys, extend_query_with_partition_keys_lazy};
use crate::options::{ApplyCacheOptions, CacheStats, Method};
use crate::spatial::{extend_query_with_spatial_filter, extend_query_with_spatial_filter_lazy};
use anyhow::{Result, anyhow};
use partitioncache_cache::{CacheHandler, ConfigError, ValueSet};
use partitioncache_query::parse;
use partitioncache_query::{
    VariantGenOptions, detect_partition_join_from_query, generate_all_hashes,
};
use sqlparser::ast::{BinaryOperator, Expr, TableFactor};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Look up the intersected partition keys for a query. Returns the key set
/// (None without hits or when only match-all entries hit), the number of
/// generated variants, and the number of cache hits.
pub async fn get_partition_keys(
    query: &str,
    handler: &dyn CacheHandler,
    partition_key: &str,
    variants: &VariantGenOptions,
) -> Result<(Option<ValueSet>, usize, usize)> {
    let hashes: BTreeSet<String> = generate_all_hashes(query, partition_key, variants)?
        .into_iter()
        .collect();
    info!("found {} subqueries in query", hashes.len());
    let (keys, hits) = handler.get_intersected(&hashes, partition_key).await?;
    debug!("intersected cache entries: {hits} hits");
    Ok((keys, hashes.len(), hits))
}

/// Lazy counterpart of [`get_partition_keys`]; the backend must declare the
/// lazy capability.
pub async fn get_partition_keys_lazy(
    query: &str,
    handler: &dyn CacheHandler,
    partition_key: &str,
    variants: &VariantGenOptions,
) -> Result<(Option<String>, usize, usize)> {
    let hashes: BTreeSet<String> = generate_all_hashes(query, partition_key, variants)?
        .into_iter()
        .collect();
    let lazy = handler
        .lazy()
        .ok_or_else(|| ConfigError::LazyUnsupported(handler.name().to_string()))?;
    let (subquery, hits) = lazy.get_intersected_lazy(&hashes, partition_key).await?;
    Ok((subquery, hashes.len(), hits))
}

/// The alias cache restrictions splice onto: the caller-provided alias, the
/// detected partition-join alias, or the first FROM table.
pub fn find_anchor_alias(
    query: &str,
    partition_key: &str,
    auto_detect_partition_join: bool,
    partition_join_table: Option<&str>,
) -> Result<String> {
    let statement = parse::parse_one(query)?;
    let select = parse::outer_select(&statement)
        .ok_or_else(|| anyhow!("query has no outer SELECT"))?;
    let first = select
        .from
        .first()
        .map(|table| &table.relation)
        .ok_or_else(|| anyhow!("no table found in query"))?;
    let fallback = match first {
        TableFactor::Table { name, alias, .. } => alias
            .as_ref()
            .map(|a| a.name.value.clone())
            .unwrap_or_else(|| name.to_string()),
        _ => return Err(anyhow!("no table found in query")),
    };

    match detect_partition_join_from_query(
        query,
        partition_key,
        auto_detect_partition_join,
        partition_join_table,
    ) {
        Ok(Some(alias)) => Ok(alias),
        _ => Ok(fallback),
    }
}

fn is_pk_equijoin(expr: &Expr, aliases: &[String], partition_key: &str) -> bool {
    if let Expr::BinaryOp {
        left,
        op: BinaryOperator::Eq,
        right,
    } = expr
    {
        if let (Expr::CompoundIdentifier(l), Expr::CompoundIdentifier(r)) =
            (left.as_ref(), right.as_ref())
        {
            return l.len() == 2
                && r.len() == 2
                && l[1].value == partition_key
                && r[1].value == partition_key
                && aliases.contains(&l[0].value)
                && aliases.contains(&r[0].value);
        }
    }
    false
}

/// Rewrite a query to the star-schema shape around a partition-key
/// materialised view: `<P>_mv AS p0` joins every table by P, replacing the
/// pairwise equijoins, which gives the optimizer a central small table to
/// drive the plan from.
pub fn rewrite_query_with_p0_table(
    query: &str,
    partition_key: &str,
    mv_table_name: Option<&str>,
    p0_alias: &str,
) -> Result<String> {
    let mv_table = mv_table_name
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("{partition_key}_mv"));

    let mut statement = parse::parse_one(query)?;
    let Some(select) = parse::outer_select_mut(&mut statement) else {
        return Ok(query.to_string());
    };

    let mut aliases: Vec<String> = vec![];
    for table in &select.from {
        if let TableFactor::Table { name, alias, .. } = &table.relation {
            if name.to_string() == mv_table {
                // star table already present
                return Ok(query.to_string());
            }
            aliases.push(
                alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| name.to_string()),
            );
        }
    }
    if aliases.is_empty() {
        return Ok(query.to_string());
    }

    // steal the TableWithJoins node from a parsed snippet instead of
    // constructing it field by field
    let snippet = parse::parse_one(&format!("SELECT * FROM {mv_table} AS {p0_alias}"))?;
    let p0_table = parse::outer_select(&snippet)
        .and_then(|s| s.from.first())
        .cloned()
        .ok_or_else(|| anyhow!("failed to build star table reference"))?;
    select.from.push(p0_table);

    let mut conjuncts = match select.selection.take() {
        Some(existing) => parse::split_conjuncts(existing),
        None => vec![],
    };
    conjuncts.retain(|conjunct| !is_pk_equijoin(conjunct, &aliases, partition_key));
    for alias in &aliases {
        conjuncts.push(parse::parse_condition(&format!(
            "{alias}.{partition_key} = {p0_alias}.{partition_key}"
        ))?);
    }
    select.selection = parse::combine_conjuncts(conjuncts);

    Ok(statement.to_string())
}

fn spatial_variant_options(options: &ApplyCacheOptions) -> VariantGenOptions {
    VariantGenOptions {
        auto_detect_partition_join: false,
        skip_partition_key_joins: true,
        ..options.variants.clone()
    }
}

/// Apply the cache to a query end to end: generate variants, intersect the
/// cached sets, optionally rewrite to the star schema, and splice the
/// restriction. With an empty cache the query comes back unchanged.
pub async fn apply_cache(
    query: &str,
    handler: &dyn CacheHandler,
    partition_key: &str,
    options: &ApplyCacheOptions,
) -> Result<(String, CacheStats)> {
    if options.method == Method::InSubquery {
        return Err(ConfigError::Other(
            "IN_SUBQUERY is lazy-only, use apply_cache_lazy".to_string(),
        )
        .into());
    }

    if options.variants.geometry_column.is_some() {
        return apply_cache_spatial(query, handler, partition_key, options).await;
    }

    let (keys, generated_variants, cache_hits) =
        get_partition_keys(query, handler, partition_key, &options.variants).await?;

    let mut working_query = query.to_string();
    let mut p0_rewritten = false;
    if options.use_p0_table {
        let p0_alias = options.p0_alias.as_deref().unwrap_or("p0");
        working_query = rewrite_query_with_p0_table(
            query,
            partition_key,
            options.p0_table_name.as_deref(),
            p0_alias,
        )?;
        p0_rewritten = working_query != query;
    }

    let mut stats = CacheStats {
        generated_variants,
        cache_hits,
        enhanced: false,
        p0_rewritten,
    };

    let Some(keys) = keys.filter(|set| !set.is_empty()) else {
        info!(
            "no cache hits found for query, generated {generated_variants} subqueries, \
             {cache_hits} cache hits"
        );
        return Ok((working_query, stats));
    };

    let mut extend_options = options.extend_options();
    if options.use_p0_table && p0_rewritten {
        extend_options.p0_alias = Some(options.p0_alias.clone().unwrap_or_else(|| "p0".to_string()));
    }

    let enhanced_query = extend_query_with_partition_keys(
        &working_query,
        &keys,
        partition_key,
        options.method,
        &extend_options,
    )?;
    stats.enhanced = true;
    info!(
        "enhanced query with cache, generated {generated_variants} subqueries, \
         {cache_hits} cache hits"
    );
    Ok((enhanced_query, stats))
}

async fn apply_cache_spatial(
    query: &str,
    handler: &dyn CacheHandler,
    partition_key: &str,
    options: &ApplyCacheOptions,
) -> Result<(String, CacheStats)> {
    let buffer_distance = options.buffer_distance.ok_or_else(|| {
        ConfigError::Other("buffer_distance is required when geometry_column is set".to_string())
    })?;
    let spatial = handler
        .spatial()
        .ok_or_else(|| ConfigError::SpatialUnsupported(handler.name().to_string()))?;

    let variants = spatial_variant_options(options);
    let hashes: BTreeSet<String> = generate_all_hashes(query, partition_key, &variants)?
        .into_iter()
        .collect();
    let mut stats = CacheStats {
        generated_variants: hashes.len(),
        ..CacheStats::default()
    };

    let Some((wkb, srid)) = spatial
        .get_spatial_filter(&hashes, partition_key, buffer_distance)
        .await?
    else {
        info!(
            "no spatial cache hits found for query, generated {} subqueries",
            hashes.len()
        );
        return Ok((query.to_string(), stats));
    };
    stats.cache_hits = handler
        .filter_existing_keys(&hashes, partition_key)
        .await?
        .len();

    let geometry_column = options
        .variants
        .geometry_column
        .as_deref()
        .expect("spatial mode checked by caller");
    let enhanced_query = extend_query_with_spatial_filter(
        query,
        &wkb,
        geometry_column,
        buffer_distance,
        srid,
        options.p0_alias.as_deref(),
    )?;
    stats.enhanced = true;
    Ok((enhanced_query, stats))
}

/// Lazy variant of [`apply_cache`]: the intersection stays inside the cache
/// DBMS as a sub-query. The backend must declare the lazy capability.
pub async fn apply_cache_lazy(
    query: &str,
    handler: &dyn CacheHandler,
    partition_key: &str,
    options: &ApplyCacheOptions,
) -> Result<(String, CacheStats)> {
    let is_spatial = options.variants.geometry_column.is_some();
    if is_spatial {
        return apply_cache_lazy_spatial(query, handler, partition_key, options).await;
    }

    let (lazy_subquery, generated_variants, cache_hits) =
        get_partition_keys_lazy(query, handler, partition_key, &options.variants).await?;

    let mut working_query = query.to_string();
    let mut p0_rewritten = false;
    if options.use_p0_table {
        let p0_alias = options.p0_alias.as_deref().unwrap_or("p0");
        working_query = rewrite_query_with_p0_table(
            query,
            partition_key,
            options.p0_table_name.as_deref(),
            p0_alias,
        )?;
        p0_rewritten = working_query != query;
    }

    let mut stats = CacheStats {
        generated_variants,
        cache_hits,
        enhanced: false,
        p0_rewritten,
    };

    let Some(lazy_subquery) = lazy_subquery.filter(|sql| !sql.trim().is_empty()) else {
        return Ok((working_query, stats));
    };

    let mut extend_options = options.extend_options();
    if options.use_p0_table && p0_rewritten {
        extend_options.p0_alias = Some(options.p0_alias.clone().unwrap_or_else(|| "p0".to_string()));
    }

    let enhanced_query = extend_query_with_partition_keys_lazy(
        &working_query,
        &lazy_subquery,
        partition_key,
        options.method,
        &extend_options,
    )?;
    stats.enhanced = true;
    Ok((enhanced_query, stats))
}

async fn apply_cache_lazy_spatial(
    query: &str,
    handler: &dyn CacheHandler,
    partition_key: &str,
    options: &ApplyCacheOptions,
) -> Result<(String, CacheStats)> {
    let buffer_distance = options.buffer_distance.ok_or_else(|| {
        ConfigError::Other("buffer_distance is required when geometry_column is set".to_string())
    })?;
    let spatial = handler
        .spatial()
        .ok_or_else(|| ConfigError::SpatialUnsupported(handler.name().to_string()))?;

    let variants = spatial_variant_options(options);
    let hashes: BTreeSet<String> = generate_all_hashes(query, partition_key, &variants)?
        .into_iter()
        .collect();
    let mut stats = CacheStats {
        generated_variants: hashes.len(),
        ..CacheStats::default()
    };

    let Some(filter_sql) = spatial
        .get_spatial_filter_lazy(&hashes, partition_key, buffer_distance)
        .await?
    else {
        return Ok((query.to_string(), stats));
    };
    stats.cache_hits = handler
        .filter_existing_keys(&hashes, partition_key)
        .await?
        .len();

    let geometry_column = options
        .variants
        .geometry_column
        .as_deref()
        .expect("spatial mode checked by caller");
    let enhanced_query = extend_query_with_spatial_filter_lazy(
        query,
        &filter_sql,
        geometry_column,
        buffer_distance,
        options.p0_alias.as_deref(),
    )?;
    stats.enhanced = true;
    Ok((enhanced_query, stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p0_rewrite_replaces_pairwise_joins() {
        let rewritten = rewrite_query_with_p0_table(
            "SELECT * FROM tt AS t1, tt AS t2 WHERE t1.zone = t2.zone AND t1.x = 1",
            "zone",
            None,
            "p0",
        )
        .unwrap();
        assert!(rewritten.contains("zone_mv AS p0"));
        assert!(!rewritten.contains("t1.zone = t2.zone"));
        assert!(rewritten.contains("t1.zone = p0.zone"));
        assert!(rewritten.contains("t2.zone = p0.zone"));
        assert!(rewritten.contains("t1.x = 1"));
    }

    #[test]
    fn p0_rewrite_is_idempotent() {
        let query = "SELECT * FROM tt AS t1, zone_mv AS p0 WHERE t1.zone = p0.zone";
        let rewritten = rewrite_query_with_p0_table(query, "zone", None, "p0").unwrap();
        assert_eq!(rewritten, query);
    }

    #[test]
    fn anchor_prefers_partition_join_alias() {
        let query = "SELECT * FROM ta AS a, tb AS b, tc AS c, p0_mv AS p \
                     WHERE a.id = p.id AND b.id = p.id AND c.id = p.id AND a.x = 1";
        let anchor = find_anchor_alias(query, "id", true, None).unwrap();
        assert_eq!(anchor, "p");
    }

    #[test]
    fn anchor_falls_back_to_first_table() {
        let anchor =
            find_anchor_alias("SELECT * FROM taxi_trips AS t WHERE t.x = 1", "trip_id", true, None)
                .unwrap();
        assert_eq!(anchor, "t");
    }
}

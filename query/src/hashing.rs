use crate::constraints::apply_constraint_modifications;
use crate::fragments::generate_partial_queries;
use crate::normalize::{clean_query, normalize_distance_conditions};
use crate::options::VariantGenOptions;
use crate::parse;
use anyhow::Result;
use sha1::{Digest, Sha1};
use sqlparser::ast::SelectItem;
use std::collections::BTreeSet;
use tracing::info;

/// SHA-1 of the fragment text, hex encoded. The sole cache lookup key.
pub fn hash_query(query: &str) -> String {
    hex::encode(Sha1::digest(query.as_bytes()))
}

/// Canonicalise a fragment for cross-producer determinism: parse and
/// re-render with the outer WHERE conjuncts in sorted order.
pub fn canonicalize_query(query: &str) -> Result<String> {
    let mut statement = parse::parse_one(query)?;
    if let Some(select) = parse::outer_select_mut(&mut statement) {
        if let Some(selection) = select.selection.take() {
            let mut conjuncts = parse::split_conjuncts(selection);
            conjuncts.sort_by_key(|c| c.to_string());
            select.selection = parse::combine_conjuncts(conjuncts);
        }
    }
    Ok(statement.to_string())
}

/// The outer SELECT list of the query, unless it is a bare `*`.
fn extract_outer_select_list(query: &str) -> Option<String> {
    let statement = parse::parse_one(query).ok()?;
    let select = parse::outer_select(&statement)?;
    if select.projection.is_empty() {
        return None;
    }
    if select.projection.len() == 1 && matches!(select.projection[0], SelectItem::Wildcard(_)) {
        return None;
    }
    Some(
        select
            .projection
            .iter()
            .map(|item| item.to_string())
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Generate the deduplicated set of `(fragment, hash)` pairs for a query.
///
/// Runs the fragment generator on the cleaned query and again on its
/// distance-bucketised copy, applies constraint edits, and hashes every
/// surviving variant. The result is sorted by fragment text so repeated
/// invocations return identical sequences.
pub fn generate_all_query_hash_pairs(
    query: &str,
    partition_key: &str,
    opts: &VariantGenOptions,
) -> Result<Vec<(String, String)>> {
    let pre_clean_select = if opts.strip_select {
        None
    } else {
        extract_outer_select_list(query)
    };

    let cleaned = clean_query(query)?;

    let mut query_set: BTreeSet<String> =
        generate_partial_queries(&cleaned, partition_key, opts, pre_clean_select.as_deref())?
            .into_iter()
            .collect();

    let bucketised = normalize_distance_conditions(&cleaned, opts.bucket_steps, true)?;
    query_set.extend(generate_partial_queries(
        &bucketised,
        partition_key,
        opts,
        pre_clean_select.as_deref(),
    )?);

    let mut query_set = apply_constraint_modifications(
        query_set,
        &opts.add_constraints,
        &opts.remove_constraints_all,
        &opts.remove_constraints_add,
    );

    // constraint edits can introduce fresh distance literals; bucketise those too
    if !opts.add_constraints.is_empty() || !opts.remove_constraints_add.is_empty() {
        let mut normalized_extras = BTreeSet::new();
        for variant in &query_set {
            if variant != &cleaned && variant != &bucketised {
                if let Ok(normalized) =
                    normalize_distance_conditions(variant, opts.bucket_steps, true)
                {
                    if &normalized != variant {
                        normalized_extras.insert(normalized);
                    }
                }
            }
        }
        query_set.extend(normalized_extras);
    }

    let final_set: BTreeSet<String> = if opts.canonicalize_queries {
        query_set
            .iter()
            .filter_map(|q| canonicalize_query(q).ok())
            .collect()
    } else {
        query_set
    };

    info!("generated {} fragment variants", final_set.len());
    Ok(final_set
        .into_iter()
        .map(|fragment| {
            let hash = hash_query(&fragment);
            (fragment, hash)
        })
        .collect())
}

/// The hashes alone, for cache lookups.
pub fn generate_all_hashes(
    query: &str,
    partition_key: &str,
    opts: &VariantGenOptions,
) -> Result<Vec<String>> {
    Ok(generate_all_query_hash_pairs(query, partition_key, opts)?
        .into_iter()
        .map(|(_, hash)| hash)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_sha1_hex() {
        let hash = hash_query("SELECT DISTINCT t1.trip_id FROM taxi_trips AS t1");
        assert_eq!(hash.len(), 40);
        assert_eq!(hash, hash_query("SELECT DISTINCT t1.trip_id FROM taxi_trips AS t1"));
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn pair_generation_is_deterministic() {
        let query = "SELECT * FROM taxi_trips AS t, osm_pois AS p \
                     WHERE ST_DWithin(t.pickup_geom, p.geom, 200) AND p.poi_type = 'museum'";
        let opts = VariantGenOptions::default();
        let first = generate_all_query_hash_pairs(query, "trip_id", &opts).unwrap();
        let second = generate_all_query_hash_pairs(query, "trip_id", &opts).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn bucketised_distances_share_fragments() {
        let opts = VariantGenOptions {
            bucket_steps: 500.0,
            ..VariantGenOptions::default()
        };
        let q1 = "SELECT DISTINCT t.trip_id FROM taxi_trips t, osm_pois p \
                  WHERE ST_DWithin(t.pickup_geom, p.geom, 200) AND p.poi_type = 'museum'";
        let q2 = "SELECT DISTINCT t.trip_id FROM taxi_trips t, osm_pois p \
                  WHERE ST_DWithin(t.pickup_geom, p.geom, 250) AND p.poi_type = 'museum'";
        let h1: BTreeSet<String> = generate_all_hashes(q1, "trip_id", &opts)
            .unwrap()
            .into_iter()
            .collect();
        let h2: BTreeSet<String> = generate_all_hashes(q2, "trip_id", &opts)
            .unwrap()
            .into_iter()
            .collect();
        assert!(
            h1.intersection(&h2).next().is_some(),
            "expected overlapping hashes between bucketised variants"
        );
        // the shared fragment carries the bucketised literal
        let pairs = generate_all_query_hash_pairs(q1, "trip_id", &opts).unwrap();
        assert!(pairs.iter().any(|(fragment, _)| fragment.contains("500")));
    }

    #[test]
    fn bucket_steps_zero_disables_bucketisation() {
        let opts = VariantGenOptions {
            bucket_steps: 0.0,
            ..VariantGenOptions::default()
        };
        let query = "SELECT * FROM taxi_trips t, osm_pois p \
                     WHERE ST_DWithin(t.pickup_geom, p.geom, 260) AND p.poi_type = 'museum'";
        let pairs = generate_all_query_hash_pairs(query, "trip_id", &opts).unwrap();
        assert!(pairs.iter().all(|(fragment, _)| !fragment.contains("300")));
        assert!(pairs.iter().any(|(fragment, _)| fragment.contains("260")));
    }

    #[test]
    fn canonicalized_hashing_sorts_conjuncts() {
        let canonical =
            canonicalize_query("SELECT * FROM t AS a WHERE a.z = 1 AND a.b = 2").unwrap();
        assert_eq!(canonical, "SELECT * FROM t AS a WHERE a.b = 2 AND a.z = 1");
    }
}

use crate::conditions::{GroupedConditions, extract_and_group_conditions};
use crate::graph::{all_combinations, connected_subgraphs};
use crate::options::VariantGenOptions;
use crate::parse;
use crate::partition_join::detect_partition_join_table;
use anyhow::Result;
use itertools::Itertools;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use tracing::{error, warn};

/// Stable fallback alias for the partition-join table when `p1` collides.
fn partition_join_fallback_alias(table_name: &str) -> String {
    let digest = Sha1::digest(table_name.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 10000;
    format!("partition_join_{n}")
}

fn remap(condition: &str, mapping: &BTreeMap<String, String>) -> String {
    match parse::remap_condition_sql(condition, mapping) {
        Ok(remapped) => remapped,
        Err(e) => {
            warn!("failed to remap condition '{condition}': {e:#}");
            condition.to_string()
        }
    }
}

/// Variants of the attribute-condition map with single conditions retained.
/// The original map is always the first entry.
fn remove_single_conditions(
    conditions: &BTreeMap<String, Vec<String>>,
) -> Vec<BTreeMap<String, Vec<String>>> {
    let mut variants = vec![conditions.clone()];
    for (alias, conds) in conditions {
        if conds.len() > 1 {
            for cond in conds {
                let mut reduced = conditions.clone();
                reduced.insert(alias.clone(), vec![cond.clone()]);
                variants.push(reduced);
            }
        }
    }
    variants
}

fn build_select_clause(
    strip_select: bool,
    original_select: Option<&str>,
    new_aliases: &[String],
    mapping: &BTreeMap<String, String>,
    partition_key: &str,
    partition_join_alias: Option<&str>,
    geometry_column: Option<&str>,
) -> String {
    let original = match original_select {
        Some(original) if !strip_select => original,
        _ => {
            let column = geometry_column.unwrap_or(partition_key);
            let alias = partition_join_alias
                .map(|a| a.to_string())
                .unwrap_or_else(|| new_aliases[0].clone());
            return format!("SELECT DISTINCT {alias}.{column}");
        }
    };
    let remapped = parse::parse_one(&format!("SELECT {original} FROM __pc")).map(|mut statement| {
        use sqlparser::ast::{Expr, visit_expressions_mut};
        use std::ops::ControlFlow;
        let _ = visit_expressions_mut(&mut statement, |e: &mut Expr| {
            if let Expr::CompoundIdentifier(parts) = e {
                if parts.len() >= 2 {
                    if let Some(new_alias) = mapping.get(&parts[0].value) {
                        parts[0].value = new_alias.clone();
                        parts[0].quote_style = None;
                    }
                }
            }
            ControlFlow::<()>::Continue(())
        });
        parse::outer_select(&statement)
            .map(|select| {
                select
                    .projection
                    .iter()
                    .map(|item| item.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_else(|| original.to_string())
    });
    match remapped {
        Ok(list) => format!("SELECT {list}"),
        Err(e) => {
            warn!("failed to map SELECT clause aliases: {e:#}, falling back to stripped SELECT");
            format!("SELECT DISTINCT {}.{partition_key}", new_aliases[0])
        }
    }
}

fn assemble(select_clause: &str, tables: &[String], conditions: &[String]) -> String {
    if conditions.is_empty() {
        format!("{select_clause} FROM {}", tables.join(", "))
    } else {
        format!(
            "{select_clause} FROM {} WHERE {}",
            tables.join(", "),
            conditions.join(" AND ")
        )
    }
}

/// Multi-alias conditions applicable to a table subset: distance conditions
/// whose pair lies in the subset plus other-function and OR conditions whose
/// alias tuples are covered.
fn relevant_multi_alias_conditions(
    grouped: &GroupedConditions,
    combination: &[String],
) -> Vec<String> {
    let mut relevant: Vec<String> = vec![];
    for ((a, b), conds) in &grouped.distance_conditions {
        if combination.contains(a) && combination.contains(b) {
            relevant.extend(conds.iter().cloned());
        }
    }
    for (aliases, conds) in &grouped.other_functions {
        if aliases.iter().all(|a| combination.contains(a)) {
            relevant.extend(conds.iter().cloned());
        }
    }
    for (aliases, conds) in &grouped.or_conditions {
        if aliases.iter().all(|a| combination.contains(a)) {
            relevant.extend(conds.iter().cloned());
        }
    }
    relevant.sort();
    relevant
}

/// Generate every partial query (fragment) of the given cleaned query.
///
/// Table subsets are enumerated over the multi-table-predicate graph (or all
/// combinations when `follow_graph` is off), renamed to `t1..tn` in a
/// canonical order, and combined with the applicable conditions. A detected
/// partition-join table is re-added to every variant as the star center.
pub fn generate_partial_queries(
    query: &str,
    partition_key: &str,
    opts: &VariantGenOptions,
    pre_clean_select: Option<&str>,
) -> Result<Vec<String>> {
    let mut fragments: Vec<String> = vec![];

    let original_select = if opts.strip_select {
        None
    } else {
        pre_clean_select.map(|s| s.to_string())
    };

    let mut grouped = extract_and_group_conditions(query, partition_key)?;
    for conds in grouped.attribute_conditions.values_mut() {
        conds.sort();
    }

    let partition_join_alias = detect_partition_join_table(
        &grouped,
        partition_key,
        opts.auto_detect_partition_join,
        opts.partition_join_table.as_deref(),
    );

    if opts.warn_no_partition_key && opts.geometry_column.is_none() {
        warn_tables_without_partition_key(&grouped, partition_key, partition_join_alias.as_deref());
    }

    let aliases_for_variants: Vec<String> = grouped
        .table_aliases
        .iter()
        .filter(|a| Some(a.as_str()) != partition_join_alias.as_deref())
        .cloned()
        .collect();
    let edges: Vec<(String, String)> = grouped
        .distance_conditions
        .keys()
        .filter(|(a, b)| {
            Some(a.as_str()) != partition_join_alias.as_deref()
                && Some(b.as_str()) != partition_join_alias.as_deref()
        })
        .cloned()
        .collect();

    let combinations = if opts.follow_graph {
        connected_subgraphs(
            &aliases_for_variants,
            &edges,
            opts.min_component_size,
            opts.max_component_size,
        )
    } else {
        all_combinations(
            &aliases_for_variants,
            opts.min_component_size,
            opts.max_component_size,
        )
    };

    let pk_conditions_flat: Vec<(String, String)> = grouped
        .partition_key_conditions
        .iter()
        .flat_map(|(alias, conds)| conds.iter().map(move |c| (alias.clone(), c.clone())))
        .collect();

    for combination in &combinations {
        let attribute_variants = if opts.keep_all_attributes {
            vec![grouped.attribute_conditions.clone()]
        } else {
            remove_single_conditions(&grouped.attribute_conditions)
        };

        for attribute_conditions in &attribute_variants {
            // canonical ordering: sort the chosen aliases by their
            // concatenated attribute conditions, so equivalent subsets map
            // to identical fragments
            let mut table_keys: Vec<String> = combination
                .iter()
                .filter(|a| attribute_conditions.contains_key(*a))
                .cloned()
                .collect();
            table_keys.sort_by_key(|a| attribute_conditions[a].join(""));
            if table_keys.is_empty() {
                continue;
            }

            let mut mapping: BTreeMap<String, String> = BTreeMap::new();
            let mut new_aliases: Vec<String> = vec![];
            let mut from_tables: Vec<String> = vec![];
            for (i, key) in table_keys.iter().enumerate() {
                let new_alias = format!("t{}", i + 1);
                mapping.insert(key.clone(), new_alias.clone());
                let table_name = grouped.alias_to_table.get(key).unwrap_or(key);
                from_tables.push(format!("{table_name} AS {new_alias}"));
                new_aliases.push(new_alias);
            }

            let mut base_conditions: Vec<String> = vec![];
            for key in &table_keys {
                for condition in &attribute_conditions[key] {
                    base_conditions.push(remap(condition, &mapping));
                }
            }
            for condition in relevant_multi_alias_conditions(&grouped, combination) {
                base_conditions.push(remap(&condition, &mapping));
            }

            let mut pk_join_conditions: Vec<String> = vec![];
            if !opts.skip_partition_key_joins {
                for i in 0..new_aliases.len() {
                    for j in (i + 1)..new_aliases.len() {
                        pk_join_conditions.push(format!(
                            "{}.{partition_key} = {}.{partition_key}",
                            new_aliases[i], new_aliases[j]
                        ));
                    }
                }
            }
            let mut full_conditions = base_conditions.clone();
            full_conditions.extend(pk_join_conditions.iter().cloned());

            if let Some(pj_alias) = &partition_join_alias {
                let pj_table = grouped
                    .alias_to_table
                    .get(pj_alias)
                    .cloned()
                    .unwrap_or_else(|| pj_alias.clone());
                let mut pj_new_alias = "p1".to_string();
                if new_aliases.contains(&pj_new_alias)
                    || grouped.table_aliases.contains(&pj_new_alias)
                {
                    pj_new_alias = partition_join_fallback_alias(&pj_table);
                }
                let mut pj_mapping = mapping.clone();
                pj_mapping.insert(pj_alias.clone(), pj_new_alias.clone());

                let mut combined_tables = from_tables.clone();
                combined_tables.push(format!("{pj_table} AS {pj_new_alias}"));

                let mut pj_joins: Vec<String> = vec![];
                if opts.skip_partition_key_joins {
                    // spatial mode: the star is connected by the original
                    // distance conditions, not partition-key equijoins
                    for key in &table_keys {
                        for ((a, b), conds) in &grouped.distance_conditions {
                            let touches = (a == pj_alias && b == key) || (b == pj_alias && a == key);
                            if touches {
                                for condition in conds {
                                    pj_joins.push(remap(condition, &pj_mapping));
                                }
                            }
                        }
                        for (aliases, conds) in &grouped.other_functions {
                            if aliases.contains(pj_alias) && aliases.contains(key) {
                                for condition in conds {
                                    pj_joins.push(remap(condition, &pj_mapping));
                                }
                            }
                        }
                    }
                } else {
                    for alias in &new_aliases {
                        pj_joins.push(format!(
                            "{alias}.{partition_key} = {pj_new_alias}.{partition_key}"
                        ));
                    }
                }

                let mut pj_conditions: Vec<String> = vec![];
                if let Some(conds) = grouped.attribute_conditions.get(pj_alias) {
                    for condition in conds {
                        pj_conditions.push(remap(condition, &pj_mapping));
                    }
                }
                for (aliases, conds) in &grouped.other_functions {
                    if aliases.len() == 1 && aliases[0] == *pj_alias {
                        for condition in conds {
                            pj_conditions.push(remap(condition, &pj_mapping));
                        }
                    }
                }

                let mut combined_conditions = base_conditions.clone();
                combined_conditions.extend(pj_joins);
                combined_conditions.extend(pj_conditions);

                let select_clause = build_select_clause(
                    opts.strip_select,
                    original_select.as_deref(),
                    &new_aliases,
                    &pj_mapping,
                    partition_key,
                    Some(&pj_new_alias),
                    opts.geometry_column.as_deref(),
                );
                fragments.push(assemble(&select_clause, &combined_tables, &combined_conditions));

                // partition-key restriction supersets applied to the star center
                for size in 1..=pk_conditions_flat.len() {
                    for combo in pk_conditions_flat.iter().combinations(size) {
                        let mut conditions = combined_conditions.clone();
                        for (orig_alias, condition) in &combo {
                            let mut single = BTreeMap::new();
                            single.insert(orig_alias.clone(), pj_new_alias.clone());
                            conditions.push(remap(condition, &single));
                        }
                        fragments.push(assemble(&select_clause, &combined_tables, &conditions));
                    }
                }
            } else {
                let select_clause = build_select_clause(
                    opts.strip_select,
                    original_select.as_deref(),
                    &new_aliases,
                    &mapping,
                    partition_key,
                    None,
                    opts.geometry_column.as_deref(),
                );
                fragments.push(assemble(&select_clause, &from_tables, &full_conditions));
            }

            // partition-key restriction supersets applied to the first table
            if !pk_conditions_flat.is_empty() {
                let select_clause = build_select_clause(
                    opts.strip_select,
                    original_select.as_deref(),
                    &new_aliases,
                    &mapping,
                    partition_key,
                    None,
                    opts.geometry_column.as_deref(),
                );
                for size in 1..=pk_conditions_flat.len() {
                    for combo in pk_conditions_flat.iter().combinations(size) {
                        let mut conditions = full_conditions.clone();
                        for (orig_alias, condition) in &combo {
                            let mut single = BTreeMap::new();
                            single.insert(orig_alias.clone(), new_aliases[0].clone());
                            conditions.push(remap(condition, &single));
                        }
                        fragments.push(assemble(&select_clause, &from_tables, &conditions));
                    }
                }
            }
        }
    }

    // the raw subqueries inside partition-key IN (...) conditions are
    // fragments in their own right
    for conds in grouped.partition_key_conditions.values() {
        for condition in conds {
            let Some(open) = condition.find('(') else {
                continue;
            };
            let Some(close) = condition.rfind(')') else {
                continue;
            };
            if close <= open {
                continue;
            }
            for part in condition[open + 1..close].split("INTERSECT") {
                let part = part.trim();
                if !part.is_empty() {
                    fragments.push(part.to_string());
                }
            }
        }
    }

    // validate and canonicalise; an unparseable fragment is dropped, never
    // emitted malformed
    let mut validated = vec![];
    for fragment in fragments {
        match parse::restringify(&fragment) {
            Ok(canonical) => validated.push(canonical),
            Err(_) => error!("failed to parse generated fragment: {fragment}"),
        }
    }
    Ok(validated)
}

fn warn_tables_without_partition_key(
    grouped: &GroupedConditions,
    partition_key: &str,
    partition_join_alias: Option<&str>,
) {
    for alias in &grouped.table_aliases {
        if Some(alias.as_str()) == partition_join_alias {
            continue;
        }
        let in_attributes = grouped
            .attribute_conditions
            .get(alias)
            .map(|conds| conds.iter().any(|c| c.contains(partition_key)))
            .unwrap_or(false);
        let in_distance = grouped.distance_conditions.iter().any(|((a, b), conds)| {
            (a == alias || b == alias) && conds.iter().any(|c| c.contains(partition_key))
        });
        let in_pk_joins = grouped
            .partition_key_joins
            .keys()
            .any(|(a, b)| a == alias || b == alias);
        if !in_attributes && !in_distance && !in_pk_joins {
            warn!(
                "table '{alias}' ({}) does not use partition key '{partition_key}'",
                grouped.alias_to_table.get(alias).unwrap_or(alias)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::clean_query;

    fn opts() -> VariantGenOptions {
        VariantGenOptions::default()
    }

    #[test]
    fn single_table_query_yields_one_fragment() {
        let cleaned =
            clean_query("SELECT * FROM taxi_trips AS t WHERE t.fare_amount > 20").unwrap();
        let fragments = generate_partial_queries(&cleaned, "trip_id", &opts(), None).unwrap();
        assert_eq!(
            fragments,
            vec!["SELECT DISTINCT t1.trip_id FROM taxi_trips AS t1 WHERE t1.fare_amount > 20"]
        );
    }

    #[test]
    fn partition_key_conditions_multiply_variants() {
        let cleaned = clean_query(
            "SELECT * FROM taxi_trips AS t WHERE t.fare_amount > 20 AND t.trip_id IN (1, 2, 3)",
        )
        .unwrap();
        let fragments = generate_partial_queries(&cleaned, "trip_id", &opts(), None).unwrap();
        // base fragment, base + IN restriction, and the raw IN-list body is
        // unparseable as a SELECT so it is dropped
        assert!(fragments.contains(
            &"SELECT DISTINCT t1.trip_id FROM taxi_trips AS t1 WHERE t1.fare_amount > 20"
                .to_string()
        ));
        assert!(fragments.iter().any(|f| f.contains("t1.trip_id IN (1, 2, 3)")));
    }

    #[test]
    fn two_connected_tables_produce_joined_fragment() {
        let cleaned = clean_query(
            "SELECT * FROM taxi_trips AS t, osm_pois AS p \
             WHERE ST_DWithin(t.pickup_geom, p.geom, 200) AND p.poi_type = 'museum'",
        )
        .unwrap();
        let fragments = generate_partial_queries(&cleaned, "trip_id", &opts(), None).unwrap();
        // size-1 fragments for each table plus the connected pair
        assert!(fragments.iter().any(|f| f.contains("taxi_trips AS t1")
            && !f.contains("osm_pois")));
        assert!(
            fragments
                .iter()
                .any(|f| f.contains("osm_pois") && f.contains("taxi_trips"))
        );
        let joined = fragments
            .iter()
            .find(|f| f.contains("osm_pois") && f.contains("taxi_trips"))
            .unwrap();
        assert!(joined.contains("t1.trip_id = t2.trip_id"));
    }

    #[test]
    fn partition_join_table_is_readded_as_star_center() {
        let cleaned = clean_query(
            "SELECT * FROM ta AS a, tb AS b, tc AS c, p0_mv AS p \
             WHERE a.id = p.id AND b.id = p.id AND c.id = p.id \
             AND a.x = 1 AND b.y = 2 AND c.z = 3",
        )
        .unwrap();
        let fragments = generate_partial_queries(&cleaned, "id", &opts(), None).unwrap();
        assert!(!fragments.is_empty());
        for fragment in &fragments {
            assert!(fragment.contains("p0_mv AS p1"), "missing star center: {fragment}");
            assert!(fragment.starts_with("SELECT DISTINCT p1.id"));
        }
        // star edges replace pairwise joins
        assert!(fragments.iter().any(|f| f.contains("t1.id = p1.id")));
        assert!(!fragments.iter().any(|f| f.contains("t1.id = t2.id")));
    }

    #[test]
    fn geometry_column_is_projected_in_spatial_mode() {
        let mut options = opts();
        options.geometry_column = Some("geom".to_string());
        options.skip_partition_key_joins = true;
        let cleaned =
            clean_query("SELECT * FROM pois AS p WHERE p.poi_type = 'museum'").unwrap();
        let fragments = generate_partial_queries(&cleaned, "zone", &options, None).unwrap();
        assert_eq!(
            fragments,
            vec!["SELECT DISTINCT t1.geom FROM pois AS t1 WHERE t1.poi_type = 'museum'"]
        );
    }
}

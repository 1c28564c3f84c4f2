use crate::conditions::{GroupedConditions, extract_and_group_conditions};
use anyhow::Result;
use tracing::{info, warn};

/// Detect the partition-join table: a central table joined to every other
/// outer table exclusively by the partition key and carrying no other
/// predicates of its own. At most one per query.
///
/// Explicit specification wins (matched by alias first, then by table name).
/// Auto-detection accepts tables named `p0*` without attribute conditions,
/// then falls back to shape detection for queries with at least three
/// tables.
pub fn detect_partition_join_table(
    grouped: &GroupedConditions,
    partition_key: &str,
    auto_detect_partition_join: bool,
    partition_join_table: Option<&str>,
) -> Option<String> {
    if let Some(requested) = partition_join_table {
        if grouped.table_aliases.iter().any(|a| a == requested) {
            info!("using explicit partition-join table by alias: {requested}");
            return Some(requested.to_string());
        }
        for (alias, table_name) in &grouped.alias_to_table {
            if table_name == requested {
                info!("using explicit partition-join table by name: {requested} -> alias {alias}");
                return Some(alias.clone());
            }
        }
        warn!(
            "could not match partition-join table '{requested}' to any alias or table name \
             (aliases: {:?})",
            grouped.table_aliases
        );
    }

    if !auto_detect_partition_join {
        return None;
    }

    // naming convention: p0* tables without attribute conditions
    for alias in &grouped.table_aliases {
        let has_no_attrs = grouped
            .attribute_conditions
            .get(alias)
            .map(|conds| conds.is_empty())
            .unwrap_or(true);
        let table_name = grouped.alias_to_table.get(alias).cloned().unwrap_or_default();
        if has_no_attrs && table_name.to_lowercase().starts_with("p0") {
            info!("auto-detected partition-join table via naming convention: {alias} -> {table_name}");
            return Some(alias.clone());
        }
    }

    // shape detection needs at least three tables for a star
    if grouped.table_aliases.len() <= 2 {
        return None;
    }
    for alias in &grouped.table_aliases {
        let only_pk_conditions = grouped
            .attribute_conditions
            .get(alias)
            .map(|conds| conds.iter().all(|c| c.contains(partition_key)))
            .unwrap_or(true);
        if !only_pk_conditions {
            continue;
        }

        let mut joined: Vec<&String> = vec![];
        for (a, b) in grouped.partition_key_joins.keys() {
            if a == alias && !joined.contains(&b) {
                joined.push(b);
            } else if b == alias && !joined.contains(&a) {
                joined.push(a);
            }
        }
        for ((a, b), conds) in &grouped.distance_conditions {
            let other = if a == alias {
                b
            } else if b == alias {
                a
            } else {
                continue;
            };
            let joins_by_pk = conds.iter().any(|c| {
                c.contains(&format!("{a}.{partition_key}"))
                    && c.contains(&format!("{b}.{partition_key}"))
            });
            if joins_by_pk && !joined.contains(&other) {
                joined.push(other);
            }
        }

        if joined.len() == grouped.table_aliases.len() - 1 {
            info!(
                "auto-detected partition-join table via shape detection: {alias} -> {}",
                grouped.alias_to_table.get(alias).unwrap_or(alias)
            );
            return Some(alias.clone());
        }
    }

    None
}

/// Detect the partition-join table directly from SQL text.
pub fn detect_partition_join_from_query(
    query: &str,
    partition_key: &str,
    auto_detect_partition_join: bool,
    partition_join_table: Option<&str>,
) -> Result<Option<String>> {
    let grouped = extract_and_group_conditions(query, partition_key)?;
    Ok(detect_partition_join_table(
        &grouped,
        partition_key,
        auto_detect_partition_join,
        partition_join_table,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_star_shape() {
        let query = "SELECT * FROM ta AS a, tb AS b, tc AS c, p0_mv AS p \
                     WHERE a.id = p.id AND b.id = p.id AND c.id = p.id \
                     AND a.x = 1 AND b.y = 2 AND c.z = 3";
        let detected = detect_partition_join_from_query(query, "id", true, None).unwrap();
        assert_eq!(detected.as_deref(), Some("p"));
    }

    #[test]
    fn shape_detection_without_naming_convention() {
        let query = "SELECT * FROM ta AS a, tb AS b, tc AS c, hub AS h \
                     WHERE a.id = h.id AND b.id = h.id AND c.id = h.id \
                     AND a.x = 1 AND b.y = 2 AND c.z = 3";
        let detected = detect_partition_join_from_query(query, "id", true, None).unwrap();
        assert_eq!(detected.as_deref(), Some("h"));
    }

    #[test]
    fn explicit_specification_by_table_name() {
        let query = "SELECT * FROM ta AS a, central AS x WHERE a.id = x.id AND a.v = 1";
        let detected = detect_partition_join_from_query(query, "id", false, Some("central")).unwrap();
        assert_eq!(detected.as_deref(), Some("x"));
    }

    #[test]
    fn two_table_query_has_no_star() {
        let query = "SELECT * FROM ta AS a, tb AS b WHERE a.id = b.id AND a.x = 1";
        let detected = detect_partition_join_from_query(query, "id", true, None).unwrap();
        assert_eq!(detected, None);
    }
}

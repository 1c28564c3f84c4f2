use crate::graph::{build_adjacency, connected_component};
use crate::parse;
use anyhow::Result;
use sqlparser::ast::{Distinct, Statement, TableFactor};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

fn table_entries(statement: &Statement) -> Vec<(String, String)> {
    let mut tables = vec![];
    let Some(select) = parse::outer_select(statement) else {
        return tables;
    };
    let mut push = |relation: &TableFactor| {
        if let TableFactor::Table { name, alias, .. } = relation {
            let alias_name = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| name.to_string());
            tables.push((alias_name.to_lowercase(), relation.to_string()));
        }
    };
    for table in &select.from {
        push(&table.relation);
        for join in &table.joins {
            push(&join.relation);
        }
    }
    tables
}

/// Drop outer tables no longer reachable from the anchor (first) table
/// through the remaining WHERE conjuncts, along with the conditions that
/// reference only dropped tables. Reconstructs the SQL from scratch so no
/// dangling commas or conjunctions survive.
fn remove_orphaned_tables(statement: Statement) -> String {
    let rendered = statement.to_string();
    let Some(select) = parse::outer_select(&statement) else {
        return rendered;
    };
    let tables = table_entries(&statement);
    if tables.len() <= 1 {
        return rendered;
    }
    let Some(selection) = &select.selection else {
        return rendered;
    };
    let conjuncts = parse::split_conjuncts(selection.clone());
    let alias_set: BTreeSet<String> = tables.iter().map(|(a, _)| a.clone()).collect();
    let nodes: Vec<String> = tables.iter().map(|(a, _)| a.clone()).collect();

    let mut edges: Vec<(String, String)> = vec![];
    for conjunct in &conjuncts {
        let referenced: Vec<String> = parse::collect_qualifiers(conjunct)
            .into_iter()
            .map(|q| q.to_lowercase())
            .filter(|q| alias_set.contains(q))
            .collect();
        for i in 0..referenced.len() {
            for j in (i + 1)..referenced.len() {
                edges.push((referenced[i].clone(), referenced[j].clone()));
            }
        }
    }

    let adjacency = build_adjacency(&nodes, &edges);
    let anchor = &tables[0].0;
    let connected = connected_component(anchor, &adjacency);
    let orphaned: BTreeSet<String> = alias_set.difference(&connected).cloned().collect();
    if orphaned.is_empty() {
        return rendered;
    }

    let kept_tables: Vec<&(String, String)> =
        tables.iter().filter(|(a, _)| !orphaned.contains(a)).collect();
    let mut kept_conditions: Vec<String> = vec![];
    for conjunct in &conjuncts {
        let referenced: BTreeSet<String> = parse::collect_qualifiers(conjunct)
            .into_iter()
            .map(|q| q.to_lowercase())
            .collect();
        if referenced.is_empty() || referenced.difference(&orphaned).next().is_some() {
            kept_conditions.push(conjunct.to_string());
        }
    }

    let distinct = match &select.distinct {
        Some(Distinct::Distinct) => "DISTINCT ",
        _ => "",
    };
    let projection = select
        .projection
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let from = kept_tables
        .iter()
        .map(|(_, sql)| sql.clone())
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("SELECT {distinct}{projection} FROM {from}");
    if !kept_conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&kept_conditions.join(" AND "));
    }
    sql
}

fn try_remove_constraints(query: &str, attributes: &[String]) -> Result<String> {
    let mut statement = parse::parse_one(query)?;
    if let Some(select) = parse::outer_select_mut(&mut statement) {
        if let Some(selection) = select.selection.take() {
            let kept: Vec<_> = parse::split_conjuncts(selection)
                .into_iter()
                .filter(|conjunct| {
                    let names = parse::collect_column_names(conjunct);
                    !attributes.iter().any(|attr| names.contains(attr))
                })
                .collect();
            select.selection = parse::combine_conjuncts(kept);
        }
    }
    Ok(remove_orphaned_tables(statement))
}

/// Remove every condition mentioning one of the given attributes, then prune
/// tables the removal disconnected. Returns the query unchanged on parse
/// failure.
pub fn remove_constraints_from_query(query: &str, attributes: &[String]) -> String {
    if attributes.is_empty() {
        return query.to_string();
    }
    match try_remove_constraints(query, attributes) {
        Ok(modified) => modified,
        Err(e) => {
            warn!("failed to remove constraints from query: {e:#}");
            query.to_string()
        }
    }
}

fn try_add_constraints(query: &str, constraints: &BTreeMap<String, String>) -> Result<String> {
    let mut statement = parse::parse_one(query)?;
    let table_names: BTreeSet<String> = {
        let Some(select) = parse::outer_select(&statement) else {
            return Ok(query.to_string());
        };
        let mut names = BTreeSet::new();
        for table in &select.from {
            if let TableFactor::Table { name, .. } = &table.relation {
                names.insert(name.to_string());
            }
            for join in &table.joins {
                if let TableFactor::Table { name, .. } = &join.relation {
                    names.insert(name.to_string());
                }
            }
        }
        names
    };

    let mut additions = vec![];
    for (table, constraint) in constraints {
        if !table_names.contains(table) {
            continue;
        }
        match parse::parse_condition(constraint) {
            Ok(expr) => additions.push(expr),
            Err(e) => warn!("failed to parse constraint '{constraint}': {e:#}"),
        }
    }
    if additions.is_empty() {
        return Ok(query.to_string());
    }

    if let Some(select) = parse::outer_select_mut(&mut statement) {
        let mut conjuncts = match select.selection.take() {
            Some(existing) => parse::split_conjuncts(existing),
            None => vec![],
        };
        conjuncts.extend(additions);
        select.selection = parse::combine_conjuncts(conjuncts);
    }
    Ok(statement.to_string())
}

/// Add per-table predicates to a query whose FROM clause mentions the table.
/// Returns the query unchanged on parse failure.
pub fn add_constraints_to_query(query: &str, constraints: &BTreeMap<String, String>) -> String {
    if constraints.is_empty() {
        return query.to_string();
    }
    match try_add_constraints(query, constraints) {
        Ok(modified) => modified,
        Err(e) => {
            warn!("failed to add constraints to query: {e:#}");
            query.to_string()
        }
    }
}

/// Apply the three constraint-edit passes over a set of variants:
/// unconditional removals rewrite every variant, additive removals keep the
/// originals too, and added constraints produce variants alongside the
/// originals.
pub fn apply_constraint_modifications(
    queries: BTreeSet<String>,
    add_constraints: &BTreeMap<String, String>,
    remove_constraints_all: &[String],
    remove_constraints_add: &[String],
) -> BTreeSet<String> {
    let mut current = queries;

    if !remove_constraints_all.is_empty() {
        current = current
            .iter()
            .map(|q| remove_constraints_from_query(q, remove_constraints_all))
            .collect();
    }

    let mut result: BTreeSet<String> = BTreeSet::new();
    if !remove_constraints_add.is_empty() {
        result.extend(current.iter().cloned());
        for query in &current {
            result.insert(remove_constraints_from_query(query, remove_constraints_add));
        }
    } else {
        result = current;
    }

    if !add_constraints.is_empty() {
        let mut with_additions = BTreeSet::new();
        for query in &result {
            with_additions.insert(add_constraints_to_query(query, add_constraints));
            with_additions.insert(query.clone());
        }
        result = with_additions;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removing_linking_condition_prunes_orphaned_table() {
        let query = "SELECT DISTINCT t1.trip_id FROM taxi_trips AS t1, osm_pois AS t2 \
                     WHERE ST_DWithin(t1.pickup_geom, t2.geom, 200) AND t2.poi_type = 'museum' \
                     AND t1.fare_amount > 20";
        let modified = remove_constraints_from_query(query, &["geom".to_string()]);
        assert!(!modified.contains("osm_pois"));
        assert!(!modified.contains("poi_type"));
        assert!(modified.contains("t1.fare_amount > 20"));
    }

    #[test]
    fn unrelated_removal_keeps_all_tables() {
        let query = "SELECT DISTINCT t1.trip_id FROM taxi_trips AS t1, osm_pois AS t2 \
                     WHERE ST_DWithin(t1.pickup_geom, t2.geom, 200) AND t1.fare_amount > 20";
        let modified = remove_constraints_from_query(query, &["fare_amount".to_string()]);
        assert!(modified.contains("osm_pois"));
        assert!(!modified.contains("fare_amount"));
    }

    #[test]
    fn add_constraints_targets_matching_tables_only() {
        let mut constraints = BTreeMap::new();
        constraints.insert("points_table".to_string(), "size = 4".to_string());
        let unchanged = add_constraints_to_query("SELECT * FROM other AS o WHERE o.x = 1", &constraints);
        assert_eq!(unchanged, "SELECT * FROM other AS o WHERE o.x = 1");
        let modified =
            add_constraints_to_query("SELECT * FROM points_table AS p WHERE p.x = 1", &constraints);
        assert!(modified.contains("size = 4"));
    }

    #[test]
    fn remove_add_keeps_original_variants() {
        let queries: BTreeSet<String> = ["SELECT * FROM t AS a WHERE a.x = 1 AND a.y = 2".to_string()]
            .into_iter()
            .collect();
        let result = apply_constraint_modifications(
            queries,
            &BTreeMap::new(),
            &[],
            &["y".to_string()],
        );
        assert_eq!(result.len(), 2);
        assert!(result.iter().any(|q| q.contains("a.y = 2")));
        assert!(result.iter().any(|q| !q.contains("a.y = 2")));
    }
}

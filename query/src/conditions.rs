use crate::parse;
use anyhow::{Result, anyhow};
use sqlparser::ast::{BinaryOperator, Expr, JoinConstraint, JoinOperator, TableFactor};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// The outer WHERE conjuncts of a query, grouped by the tables they touch.
///
/// Condition strings are stored in canonical (parsed and re-rendered) form
/// with their original aliases intact; remapping to fragment aliases happens
/// at assembly time.
#[derive(Debug, Default, Clone)]
pub struct GroupedConditions {
    /// Conditions referencing exactly one outer alias
    pub attribute_conditions: BTreeMap<String, Vec<String>>,
    /// Function-call conditions between exactly two outer aliases
    pub distance_conditions: BTreeMap<(String, String), Vec<String>>,
    /// Remaining multi-alias (or alias-free) conditions, keyed by the sorted
    /// qualifier tuple
    pub other_functions: BTreeMap<Vec<String>, Vec<String>>,
    /// Disjunctive conditions, keyed the same way
    pub or_conditions: BTreeMap<Vec<String>, Vec<String>>,
    /// Restrictions on the partition key itself (IN / BETWEEN / comparisons)
    pub partition_key_conditions: BTreeMap<String, Vec<String>>,
    /// `a.P = b.P` equijoins, keyed by the sorted alias pair
    pub partition_key_joins: BTreeMap<(String, String), Vec<String>>,
    /// Outer aliases in FROM order
    pub table_aliases: Vec<String>,
    /// Alias to table-name mapping
    pub alias_to_table: BTreeMap<String, String>,
}

fn is_comparison(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
    )
}

fn contains_in_predicate(expr: &Expr) -> bool {
    use sqlparser::ast::visit_expressions;
    use std::ops::ControlFlow;
    let mut found = false;
    let _ = visit_expressions(expr, |e: &Expr| {
        if matches!(e, Expr::InList { .. } | Expr::InSubquery { .. }) {
            found = true;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    });
    found
}

fn table_alias_and_name(relation: &TableFactor) -> Option<(String, String)> {
    if let TableFactor::Table { name, alias, .. } = relation {
        let table_name = name.to_string();
        let alias_name = alias
            .as_ref()
            .map(|a| a.name.value.clone())
            .unwrap_or_else(|| table_name.clone());
        return Some((alias_name, table_name));
    }
    None
}

/// Extract the outer WHERE conjuncts of a query and group them by table
/// alias and alias pair. JOIN ... ON conditions at the outer scope count as
/// conjuncts too.
pub fn extract_and_group_conditions(query: &str, partition_key: &str) -> Result<GroupedConditions> {
    let statement = parse::parse_one(query)?;
    let select = parse::outer_select(&statement)
        .ok_or_else(|| anyhow!("query has no outer SELECT: {query}"))?;

    let mut grouped = GroupedConditions::default();
    let mut conjuncts: Vec<Expr> = vec![];

    for table in &select.from {
        if let Some((alias, name)) = table_alias_and_name(&table.relation) {
            grouped.table_aliases.push(alias.clone());
            grouped.alias_to_table.insert(alias, name);
        }
        for join in &table.joins {
            if let Some((alias, name)) = table_alias_and_name(&join.relation) {
                grouped.table_aliases.push(alias.clone());
                grouped.alias_to_table.insert(alias, name);
            }
            let constraint = match &join.join_operator {
                JoinOperator::Inner(c)
                | JoinOperator::LeftOuter(c)
                | JoinOperator::RightOuter(c)
                | JoinOperator::FullOuter(c) => Some(c),
                _ => None,
            };
            if let Some(JoinConstraint::On(condition)) = constraint {
                conjuncts.extend(parse::split_conjuncts(condition.clone()));
            }
        }
    }

    let unique_tables: BTreeSet<&String> = grouped.alias_to_table.values().collect();
    if unique_tables.len() > 1 {
        // may behave unexpectedly if tables are not joined by the partition key
        debug!(
            "more than one table is used in the query ({})",
            unique_tables
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    for alias in &grouped.table_aliases {
        grouped.attribute_conditions.insert(alias.clone(), vec![]);
    }
    let alias_set: BTreeSet<String> = grouped.table_aliases.iter().cloned().collect();

    if let Some(selection) = &select.selection {
        conjuncts.extend(parse::split_conjuncts(selection.clone()));
    }

    for condition in conjuncts {
        let sql = condition.to_string();

        // partition-key equijoin between two outer aliases
        if let Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } = &condition
        {
            if let (Expr::CompoundIdentifier(l), Expr::CompoundIdentifier(r)) =
                (left.as_ref(), right.as_ref())
            {
                if l.len() == 2
                    && r.len() == 2
                    && l[1].value == partition_key
                    && r[1].value == partition_key
                    && alias_set.contains(&l[0].value)
                    && alias_set.contains(&r[0].value)
                {
                    let (a, b) = (l[0].value.clone(), r[0].value.clone());
                    let key = if a <= b { (a, b) } else { (b, a) };
                    grouped.partition_key_joins.entry(key).or_default().push(sql);
                    continue;
                }
            }
        }

        // restriction on the partition key itself, kept for slicing
        let references_pk = parse::references_column(&condition, partition_key);
        let is_restriction = contains_in_predicate(&condition)
            || matches!(condition, Expr::Between { .. })
            || matches!(&condition, Expr::BinaryOp { op, .. } if is_comparison(op));
        if references_pk && is_restriction {
            let qualifiers = parse::collect_qualifiers(&condition);
            let alias = qualifiers
                .first()
                .cloned()
                .or_else(|| grouped.table_aliases.first().cloned())
                .unwrap_or_else(|| "unknown".to_string());
            grouped
                .partition_key_conditions
                .entry(alias)
                .or_default()
                .push(sql);
            continue;
        }

        let qualifiers = parse::collect_qualifiers(&condition);
        let outer_aliases: Vec<String> = qualifiers
            .iter()
            .filter(|q| alias_set.contains(*q))
            .cloned()
            .collect();

        if outer_aliases.len() == 1 && !qualifiers.is_empty() {
            grouped
                .attribute_conditions
                .entry(outer_aliases[0].clone())
                .or_default()
                .push(sql);
            continue;
        }

        let mut sorted_qualifiers = qualifiers.clone();
        sorted_qualifiers.sort();
        let mut sorted_outer = outer_aliases.clone();
        sorted_outer.sort();

        if parse::contains_function(&condition) {
            if sorted_outer.len() == 2 {
                grouped
                    .distance_conditions
                    .entry((sorted_outer[0].clone(), sorted_outer[1].clone()))
                    .or_default()
                    .push(sql);
            } else {
                grouped
                    .other_functions
                    .entry(sorted_qualifiers)
                    .or_default()
                    .push(sql);
            }
        } else if parse::contains_or(&condition) {
            grouped
                .or_conditions
                .entry(sorted_qualifiers)
                .or_default()
                .push(sql);
        } else if sorted_outer.len() == 2 {
            grouped
                .distance_conditions
                .entry((sorted_outer[0].clone(), sorted_outer[1].clone()))
                .or_default()
                .push(sql);
        } else {
            grouped
                .other_functions
                .entry(sorted_qualifiers)
                .or_default()
                .push(sql);
        }
    }

    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_single_and_multi_alias_conditions() {
        let grouped = extract_and_group_conditions(
            "SELECT * FROM taxi_trips AS t, osm_pois AS p \
             WHERE t.fare_amount > 20 AND ST_DWithin(t.pickup_geom, p.geom, 200) \
             AND p.poi_type = 'museum'",
            "trip_id",
        )
        .unwrap();
        assert_eq!(grouped.table_aliases, vec!["t", "p"]);
        assert_eq!(grouped.attribute_conditions["t"].len(), 1);
        assert_eq!(grouped.attribute_conditions["p"].len(), 1);
        assert_eq!(
            grouped.distance_conditions[&("p".to_string(), "t".to_string())].len(),
            1
        );
    }

    #[test]
    fn partition_key_joins_are_tracked_separately() {
        let grouped = extract_and_group_conditions(
            "SELECT * FROM tt AS a, tt AS b WHERE a.trip_id = b.trip_id AND a.size = 4",
            "trip_id",
        )
        .unwrap();
        assert_eq!(
            grouped.partition_key_joins[&("a".to_string(), "b".to_string())].len(),
            1
        );
        assert_eq!(grouped.attribute_conditions["a"].len(), 1);
        assert!(grouped.attribute_conditions["b"].is_empty());
    }

    #[test]
    fn partition_key_restrictions_are_sliced_out() {
        let grouped = extract_and_group_conditions(
            "SELECT * FROM tt AS a WHERE a.trip_id IN (1, 2, 3) AND a.size = 4",
            "trip_id",
        )
        .unwrap();
        assert_eq!(grouped.partition_key_conditions["a"].len(), 1);
        assert_eq!(grouped.attribute_conditions["a"], vec!["a.size = 4"]);
    }
}

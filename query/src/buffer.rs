use crate::normalize::is_distance_function;
use crate::parse;
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, Value,
    visit_expressions,
};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

fn first_qualifier(expr: &Expr) -> Option<String> {
    parse::collect_qualifiers(expr).into_iter().next()
}

fn first_number(expr: &Expr) -> Option<f64> {
    let mut found = None;
    let _ = visit_expressions(expr, |e: &Expr| {
        if let Expr::Value(Value::Number(text, _)) = e {
            if let Ok(value) = text.parse::<f64>() {
                found = Some(value);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    });
    found
}

/// Extract `(alias1, alias2, distance)` from every distance constraint:
/// `ST_DWithin` calls anywhere in the query, then comparison-based distance
/// expressions among the outer conjuncts (upper bounds only).
pub fn extract_distance_constraints(query: &str) -> Vec<(String, String, f64)> {
    let Ok(statement) = parse::parse_one(query) else {
        return vec![];
    };

    let mut results: Vec<(String, String, f64)> = vec![];
    let mut seen_pairs: BTreeSet<(String, String)> = BTreeSet::new();

    let _ = visit_expressions(&statement, |e: &Expr| {
        if let Expr::Function(function) = e {
            if function.name.to_string().to_uppercase() == "ST_DWITHIN" {
                if let FunctionArguments::List(arg_list) = &function.args {
                    let exprs: Vec<&Expr> = arg_list
                        .args
                        .iter()
                        .filter_map(|arg| match arg {
                            FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => Some(expr),
                            _ => None,
                        })
                        .collect();
                    if exprs.len() >= 3 {
                        let alias1 = first_qualifier(exprs[0]);
                        let alias2 = first_qualifier(exprs[1]);
                        let distance = first_number(exprs[2]);
                        if let (Some(a1), Some(a2), Some(d)) = (alias1, alias2, distance) {
                            let pair = if a1 <= a2 { (a1, a2) } else { (a2, a1) };
                            if seen_pairs.insert(pair.clone()) {
                                results.push((pair.0, pair.1, d));
                            }
                        }
                    }
                }
            }
        }
        ControlFlow::<()>::Continue(())
    });

    if let Some(select) = parse::outer_select(&statement) {
        if let Some(selection) = &select.selection {
            for conjunct in parse::split_conjuncts(selection.clone()) {
                if !is_distance_function(&conjunct.to_string()) {
                    continue;
                }
                let aliases = parse::collect_qualifiers(&conjunct);
                if aliases.len() != 2 {
                    continue;
                }
                let pair = if aliases[0] <= aliases[1] {
                    (aliases[0].clone(), aliases[1].clone())
                } else {
                    (aliases[1].clone(), aliases[0].clone())
                };
                if seen_pairs.contains(&pair) {
                    continue;
                }
                let distance = match &conjunct {
                    Expr::Between {
                        negated: false,
                        high,
                        ..
                    } => first_number(high),
                    Expr::BinaryOp { op, right, .. }
                        if matches!(op, BinaryOperator::Lt | BinaryOperator::LtEq) =>
                    {
                        first_number(right)
                    }
                    _ => None,
                };
                if let Some(d) = distance {
                    seen_pairs.insert(pair.clone());
                    results.push((pair.0, pair.1, d));
                }
            }
        }
    }

    results.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    results
}

/// Buffer distance for spatial filters: the weighted diameter of the graph
/// whose nodes are aliases and whose edge weights are the distance bounds
/// (maximum weight per pair). For a star the diameter is the sum of the two
/// largest spokes; for a chain, the sum along the longest path. Returns 0.0
/// with fewer than two connected nodes.
pub fn compute_buffer_distance(query: &str) -> f64 {
    let edges = extract_distance_constraints(query);
    if edges.is_empty() {
        return 0.0;
    }

    let mut weights: BTreeMap<(String, String), f64> = BTreeMap::new();
    let mut nodes: BTreeSet<String> = BTreeSet::new();
    for (a, b, d) in edges {
        nodes.insert(a.clone());
        nodes.insert(b.clone());
        weights
            .entry((a, b))
            .and_modify(|w| *w = w.max(d))
            .or_insert(d);
    }
    let index: BTreeMap<&String, usize> = nodes.iter().enumerate().map(|(i, n)| (n, i)).collect();
    let n = nodes.len();
    if n < 2 {
        return 0.0;
    }

    let mut dist = vec![vec![f64::INFINITY; n]; n];
    for (i, row) in dist.iter_mut().enumerate() {
        row[i] = 0.0;
    }
    for ((a, b), w) in &weights {
        let (ia, ib) = (index[a], index[b]);
        dist[ia][ib] = dist[ia][ib].min(*w);
        dist[ib][ia] = dist[ib][ia].min(*w);
    }
    for k in 0..n {
        for i in 0..n {
            for j in 0..n {
                let through = dist[i][k] + dist[k][j];
                if through < dist[i][j] {
                    dist[i][j] = through;
                }
            }
        }
    }

    let mut diameter = 0.0f64;
    for row in &dist {
        for &value in row {
            if value.is_finite() && value > diameter {
                diameter = value;
            }
        }
    }
    diameter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn st_dwithin_constraints_are_extracted() {
        let constraints = extract_distance_constraints(
            "SELECT * FROM a, b WHERE ST_DWithin(a.geom, b.geom, 500) AND a.x = 1",
        );
        assert_eq!(
            constraints,
            vec![("a".to_string(), "b".to_string(), 500.0)]
        );
    }

    #[test]
    fn star_diameter_sums_two_largest_spokes() {
        let query = "SELECT * FROM hub AS h, a, b \
                     WHERE ST_DWithin(h.geom, a.geom, 300) AND ST_DWithin(h.geom, b.geom, 200)";
        assert_eq!(compute_buffer_distance(query), 500.0);
    }

    #[test]
    fn comparison_distances_use_upper_bounds() {
        let query = "SELECT * FROM p1, p2 \
                     WHERE SQRT(POWER(p1.x - p2.x, 2) + POWER(p1.y - p2.y, 2)) < 0.008";
        let constraints = extract_distance_constraints(query);
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].2, 0.008);
    }

    #[test]
    fn no_constraints_means_zero_buffer() {
        assert_eq!(compute_buffer_distance("SELECT * FROM t WHERE t.x = 1"), 0.0);
    }
}

use crate::parse;
use anyhow::{Result, anyhow};
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, Join, JoinConstraint,
    JoinOperator, TableWithJoins, Value,
};
use tracing::debug;

/// Drop `--` line comments. Runs before whitespace collapse, otherwise the
/// collapse would glue everything after the first comment onto one line.
fn strip_line_comments(query: &str) -> String {
    query
        .lines()
        .map(|line| match line.find("--") {
            Some(pos) => &line[..pos],
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Convert explicit `JOIN ... ON c` syntax at the outer scope into a comma
/// join with `c` moved to WHERE. Subqueries are left untouched. Queries
/// using either syntax then produce the same cache fragments.
pub fn normalize_joins_to_comma(query: &str) -> String {
    let Ok(mut statement) = parse::parse_one(query) else {
        return query.to_string();
    };
    let Some(select) = parse::outer_select_mut(&mut statement) else {
        return query.to_string();
    };
    if select.from.iter().all(|table| table.joins.is_empty()) {
        return query.to_string();
    }

    let mut relations = vec![];
    let mut join_conditions = vec![];
    for table in select.from.drain(..) {
        relations.push(TableWithJoins {
            relation: table.relation,
            joins: vec![],
        });
        for join in table.joins {
            let Join {
                relation,
                join_operator,
                ..
            } = join;
            let constraint = match join_operator {
                JoinOperator::Inner(c)
                | JoinOperator::LeftOuter(c)
                | JoinOperator::RightOuter(c)
                | JoinOperator::FullOuter(c) => Some(c),
                _ => None,
            };
            if let Some(JoinConstraint::On(condition)) = constraint {
                join_conditions.push(condition);
            }
            relations.push(TableWithJoins {
                relation,
                joins: vec![],
            });
        }
    }
    select.from = relations;

    if !join_conditions.is_empty() {
        let mut conjuncts = match select.selection.take() {
            Some(existing) => parse::split_conjuncts(existing),
            None => vec![],
        };
        conjuncts.extend(join_conditions);
        select.selection = parse::combine_conjuncts(conjuncts);
    }

    statement.to_string()
}

/// Clean a query into the stable form used for variant generation.
///
/// Strips comments and trailing semicolons, normalizes JOINs to comma joins,
/// drops ORDER BY / LIMIT / GROUP BY / HAVING, replaces the outer SELECT
/// list with `*` and flattens the WHERE clause into its conjuncts.
pub fn clean_query(query: &str) -> Result<String> {
    let without_comments = strip_line_comments(query);
    let collapsed = without_comments
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let trimmed = collapsed.trim().trim_end_matches(';').trim();
    let comma_joined = normalize_joins_to_comma(trimmed);

    let statement = parse::parse_one(&comma_joined)?;
    let select = parse::outer_select(&statement)
        .ok_or_else(|| anyhow!("query has no outer SELECT: {query}"))?;

    let from_clause = select
        .from
        .iter()
        .map(|table| table.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let mut cleaned = format!("SELECT * FROM {from_clause}");
    if let Some(selection) = &select.selection {
        let conjuncts = parse::split_conjuncts(selection.clone());
        let rendered = conjuncts
            .iter()
            .map(|conjunct| conjunct.to_string())
            .collect::<Vec<_>>()
            .join(" AND ");
        cleaned.push_str(" WHERE ");
        cleaned.push_str(&rendered);
    }

    // quoted identifiers are not supported in fragment text
    Ok(cleaned.replace('"', "").replace('`', ""))
}

/// Heuristic for "condition built around a distance-like function call":
/// a call whose argument list holds several operands.
pub fn is_distance_function(condition: &str) -> bool {
    if let (Some(open), Some(close)) = (condition.find('('), condition.rfind(')')) {
        if close > open {
            let inner = &condition[open + 1..close];
            return inner.contains(',') || inner.contains('+');
        }
    }
    false
}

fn number_value(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Value(Value::Number(text, _)) => text.parse().ok(),
        Expr::Nested(inner) => number_value(inner),
        _ => None,
    }
}

fn set_number(expr: &mut Expr, value: f64) {
    match expr {
        Expr::Value(Value::Number(text, _)) => *text = format_bucket_value(value),
        Expr::Nested(inner) => set_number(inner, value),
        _ => {}
    }
}

fn format_bucket_value(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn floor_to_bucket(value: f64, steps: f64) -> f64 {
    (value / steps).trunc() * steps
}

fn ceil_to_bucket(value: f64, steps: f64) -> f64 {
    let floored = floor_to_bucket(value, steps);
    if floored == value { value } else { floored + steps }
}

fn bucketise_condition(mut condition: Expr, steps: f64, restrict_to_dist_functions: bool) -> Expr {
    if restrict_to_dist_functions && !is_distance_function(&condition.to_string()) {
        return condition;
    }
    match &mut condition {
        Expr::Between {
            negated: false,
            low,
            high,
            ..
        } => {
            if let (Some(lower), Some(upper)) = (number_value(low), number_value(high)) {
                if lower >= 0.0 && upper >= 0.0 {
                    set_number(low, floor_to_bucket(lower, steps));
                    set_number(high, ceil_to_bucket(upper, steps));
                }
            }
        }
        Expr::BinaryOp { op, right, .. } => match op {
            BinaryOperator::Lt | BinaryOperator::LtEq => {
                if let Some(value) = number_value(right) {
                    if value >= 0.0 {
                        set_number(right, ceil_to_bucket(value, steps));
                    }
                }
            }
            BinaryOperator::Gt | BinaryOperator::GtEq => {
                if let Some(value) = number_value(right) {
                    if value >= 0.0 {
                        set_number(right, floor_to_bucket(value, steps));
                    }
                }
            }
            _ => {}
        },
        // bare distance predicates (ST_DWithin and friends) carry the bound
        // as a function argument; quantise it like an upper bound
        Expr::Function(function) => {
            if let FunctionArguments::List(arg_list) = &mut function.args {
                for arg in &mut arg_list.args {
                    if let FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) = arg {
                        if let Some(value) = number_value(expr) {
                            if value >= 0.0 {
                                set_number(expr, ceil_to_bucket(value, steps));
                            }
                        }
                    }
                }
            }
        }
        _ => {}
    }
    condition
}

/// Quantise distance literals in the outer WHERE to multiples of
/// `bucket_steps`: BETWEEN lower bounds floored and upper bounds ceiled,
/// `<`/`<=` ceiled, `>`/`>=` floored. Lets `d < 1.6` and `d < 3.6` share a
/// fragment. `bucket_steps <= 0` disables the pass.
pub fn normalize_distance_conditions(
    query: &str,
    bucket_steps: f64,
    restrict_to_dist_functions: bool,
) -> Result<String> {
    if bucket_steps <= 0.0 {
        debug!("bucket_steps disabled, skipping distance normalization");
        return Ok(query.to_string());
    }
    let mut statement = parse::parse_one(query)?;
    let Some(select) = parse::outer_select_mut(&mut statement) else {
        return Ok(query.to_string());
    };
    let Some(selection) = select.selection.take() else {
        return Ok(statement.to_string());
    };
    let bucketised = parse::split_conjuncts(selection)
        .into_iter()
        .map(|conjunct| bucketise_condition(conjunct, bucket_steps, restrict_to_dist_functions))
        .collect();
    select.selection = parse::combine_conjuncts(bucketised);
    Ok(statement.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_rounding() {
        assert_eq!(floor_to_bucket(1.6, 1.0), 1.0);
        assert_eq!(ceil_to_bucket(3.6, 1.0), 4.0);
        assert_eq!(ceil_to_bucket(4.0, 1.0), 4.0);
        assert_eq!(floor_to_bucket(1.6, 2.0), 0.0);
        assert_eq!(ceil_to_bucket(3.6, 2.0), 4.0);
        assert_eq!(format_bucket_value(4.0), "4");
        assert_eq!(format_bucket_value(2.5), "2.5");
    }

    #[test]
    fn distance_function_heuristic() {
        assert!(is_distance_function("ST_DWithin(a.geom, b.geom, 500)"));
        assert!(is_distance_function("SQRT(POWER(a.x - b.x, 2) + POWER(a.y - b.y, 2)) < 0.5"));
        assert!(!is_distance_function("a.size = 4"));
        assert!(!is_distance_function("LOWER(a.name) = 'x'"));
    }

    #[test]
    fn comments_and_semicolons_are_stripped() {
        let cleaned = clean_query(
            "SELECT t.id FROM trips AS t -- trailing comment\nWHERE t.fare > 10;",
        )
        .unwrap();
        assert_eq!(cleaned, "SELECT * FROM trips AS t WHERE t.fare > 10");
    }

    #[test]
    fn explicit_joins_become_comma_joins() {
        let normalized = normalize_joins_to_comma(
            "SELECT t.id FROM trips AS t JOIN pois AS p ON t.zone = p.zone WHERE t.fare > 10",
        );
        assert!(normalized.contains("FROM trips AS t, pois AS p"));
        assert!(normalized.contains("t.fare > 10 AND t.zone = p.zone"));
    }

    #[test]
    fn cross_joins_lose_their_kind_but_keep_the_table() {
        let cleaned =
            clean_query("SELECT * FROM trips AS t CROSS JOIN pois AS p WHERE t.fare > 10")
                .unwrap();
        assert_eq!(cleaned, "SELECT * FROM trips AS t, pois AS p WHERE t.fare > 10");
    }

    #[test]
    fn subquery_joins_are_left_alone() {
        let query = "SELECT * FROM trips AS t WHERE t.zone IN \
                     (SELECT z.id FROM zones AS z JOIN cities AS c ON z.city = c.id)";
        let cleaned = clean_query(query).unwrap();
        assert!(cleaned.contains("JOIN cities AS c ON z.city = c.id"));
    }

    #[test]
    fn group_by_having_order_and_limit_are_dropped() {
        let cleaned = clean_query(
            "SELECT t.zone, COUNT(*) FROM trips AS t WHERE t.fare > 10 \
             GROUP BY t.zone HAVING COUNT(*) > 5 ORDER BY t.zone LIMIT 10",
        )
        .unwrap();
        assert_eq!(cleaned, "SELECT * FROM trips AS t WHERE t.fare > 10");
    }

    #[test]
    fn between_bounds_are_bucketised() {
        let normalized = normalize_distance_conditions(
            "SELECT * FROM a, b WHERE DIST(a.g, b.g) BETWEEN 1.6 AND 3.6",
            1.0,
            true,
        )
        .unwrap();
        assert!(normalized.contains("BETWEEN 1 AND 4"), "got: {normalized}");
        let coarser = normalize_distance_conditions(
            "SELECT * FROM a, b WHERE DIST(a.g, b.g) BETWEEN 1.6 AND 3.6",
            2.0,
            true,
        )
        .unwrap();
        assert!(coarser.contains("BETWEEN 0 AND 4"), "got: {coarser}");
    }

    #[test]
    fn non_distance_comparisons_are_left_alone() {
        let normalized = normalize_distance_conditions(
            "SELECT * FROM a WHERE a.fare < 1.6",
            1.0,
            true,
        )
        .unwrap();
        assert!(normalized.contains("a.fare < 1.6"), "got: {normalized}");
    }
}

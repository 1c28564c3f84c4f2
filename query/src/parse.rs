use anyhow::{Context, Result, anyhow};
use sqlparser::ast::{
    BinaryOperator, Expr, Select, SetExpr, Statement, visit_expressions, visit_expressions_mut,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

/// Parse exactly one SQL statement. The PostgreSQL dialect keeps backslash
/// sequences in string literals intact (WKB hex literals rely on that).
pub fn parse_one(sql: &str) -> Result<Statement> {
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .with_context(|| format!("parsing sql: {sql}"))?;
    if statements.len() != 1 {
        return Err(anyhow!("expected a single statement, got {}", statements.len()));
    }
    Ok(statements.remove(0))
}

/// Parse and re-render, yielding the canonical stringification.
pub fn restringify(sql: &str) -> Result<String> {
    Ok(parse_one(sql)?.to_string())
}

/// The outermost SELECT of a statement, if it is a plain query.
pub fn outer_select(statement: &Statement) -> Option<&Select> {
    if let Statement::Query(query) = statement {
        if let SetExpr::Select(select) = query.body.as_ref() {
            return Some(select);
        }
    }
    None
}

pub fn outer_select_mut(statement: &mut Statement) -> Option<&mut Select> {
    if let Statement::Query(query) = statement {
        if let SetExpr::Select(select) = query.body.as_mut() {
            return Some(select);
        }
    }
    None
}

/// Parse a bare condition by wrapping it in a throwaway SELECT.
pub fn parse_condition(condition: &str) -> Result<Expr> {
    let mut statement = parse_one(&format!("SELECT * FROM __pc WHERE {condition}"))?;
    outer_select_mut(&mut statement)
        .and_then(|select| select.selection.take())
        .ok_or_else(|| anyhow!("condition did not parse: {condition}"))
}

/// Flatten a WHERE expression into its conjuncts, unwrapping redundant parens.
pub fn split_conjuncts(expr: Expr) -> Vec<Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut out = split_conjuncts(*left);
            out.extend(split_conjuncts(*right));
            out
        }
        Expr::Nested(inner) => split_conjuncts(*inner),
        other => vec![other],
    }
}

/// AND a list of conjuncts back together (left-associated).
pub fn combine_conjuncts(conjuncts: Vec<Expr>) -> Option<Expr> {
    let mut iter = conjuncts.into_iter();
    let first = iter.next()?;
    Some(iter.fold(first, |acc, next| Expr::BinaryOp {
        left: Box::new(acc),
        op: BinaryOperator::And,
        right: Box::new(next),
    }))
}

/// Table qualifiers referenced by an expression, in pre-order, deduplicated.
pub fn collect_qualifiers(expr: &Expr) -> Vec<String> {
    let mut qualifiers: Vec<String> = vec![];
    let _ = visit_expressions(expr, |e: &Expr| {
        if let Expr::CompoundIdentifier(parts) = e {
            if parts.len() >= 2 {
                let head = parts[0].value.clone();
                if !qualifiers.contains(&head) {
                    qualifiers.push(head);
                }
            }
        }
        ControlFlow::<()>::Continue(())
    });
    qualifiers
}

/// Column names referenced by an expression (the last identifier of
/// qualified references plus bare identifiers).
pub fn collect_column_names(expr: &Expr) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let _ = visit_expressions(expr, |e: &Expr| {
        match e {
            Expr::CompoundIdentifier(parts) => {
                if let Some(last) = parts.last() {
                    names.insert(last.value.clone());
                }
            }
            Expr::Identifier(ident) => {
                names.insert(ident.value.clone());
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    names
}

/// Whether the expression contains any function call.
pub fn contains_function(expr: &Expr) -> bool {
    let mut found = false;
    let _ = visit_expressions(expr, |e: &Expr| {
        if matches!(e, Expr::Function(_)) {
            found = true;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    });
    found
}

/// Whether the expression contains a disjunction.
pub fn contains_or(expr: &Expr) -> bool {
    let mut found = false;
    let _ = visit_expressions(expr, |e: &Expr| {
        if matches!(
            e,
            Expr::BinaryOp {
                op: BinaryOperator::Or,
                ..
            }
        ) {
            found = true;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    });
    found
}

/// Whether the expression references the given column anywhere.
pub fn references_column(expr: &Expr, column: &str) -> bool {
    collect_column_names(expr).contains(column)
}

/// Rewrite every table qualifier through the given mapping, in one pass so
/// chained renames cannot collide.
pub fn remap_qualifiers(expr: &mut Expr, mapping: &BTreeMap<String, String>) {
    let _ = visit_expressions_mut(expr, |e: &mut Expr| {
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
}

/// Remap qualifiers inside a condition given as SQL text.
pub fn remap_condition_sql(condition: &str, mapping: &BTreeMap<String, String>) -> Result<String> {
    let mut expr = parse_condition(condition)?;
    remap_qualifiers(&mut expr, mapping);
    Ok(expr.to_string())
}

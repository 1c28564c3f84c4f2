use crate::options::{ExtendOptions, Method};
use anyhow::{Result, anyhow};
use partitioncache_cache::{ConfigError, Value, ValueSet};
use partitioncache_query::hashing::hash_query;
use partitioncache_query::parse;
use sqlparser::ast::{Join, Statement, TableFactor};

pub(crate) fn add_where_condition(statement: &mut Statement, condition: &str) -> Result<()> {
    let parsed = parse::parse_condition(condition)?;
    let select = parse::outer_select_mut(statement)
        .ok_or_else(|| anyhow!("query has no outer SELECT"))?;
    let mut conjuncts = match select.selection.take() {
        Some(existing) => parse::split_conjuncts(existing),
        None => vec![],
    };
    conjuncts.push(parsed);
    select.selection = parse::combine_conjuncts(conjuncts);
    Ok(())
}

fn values_list(values: &ValueSet) -> String {
    values
        .iter()
        .map(Value::sql_literal)
        .collect::<Vec<_>>()
        .join(",")
}

fn values_rows(values: &ValueSet) -> String {
    values
        .iter()
        .map(|v| format!("({})", v.sql_literal()))
        .collect::<Vec<_>>()
        .join(",")
}

fn tmp_table_setup(values: &ValueSet, analyze_tmp_table: bool) -> String {
    let column_type = values
        .iter()
        .next()
        .map(|v| v.datatype().scalar_column_type())
        .unwrap_or("TEXT");
    let mut setup = format!(
        "CREATE TEMPORARY TABLE tmp_partition_keys (partition_key {column_type} PRIMARY KEY);\
         INSERT INTO tmp_partition_keys (partition_key) VALUES {rows};",
        rows = values_rows(values),
    );
    if analyze_tmp_table {
        setup.push_str(
            "CREATE INDEX tmp_partition_keys_idx ON tmp_partition_keys \
             USING HASH(partition_key);ANALYZE tmp_partition_keys;",
        );
    }
    setup
}

fn relation_alias(relation: &TableFactor) -> Option<String> {
    if let TableFactor::Table { name, alias, .. } = relation {
        return Some(
            alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| name.to_string()),
        );
    }
    None
}

fn splice_tmp_table_join(
    statement: &mut Statement,
    tmp_table: &str,
    join_column_name: &str,
    partition_key: &str,
    p0_alias: Option<&str>,
) -> Result<()> {
    let select = parse::outer_select_mut(statement)
        .ok_or_else(|| anyhow!("query has no outer SELECT"))?;
    let mut joins_to_add: Vec<(usize, Join)> = vec![];
    for (index, table) in select.from.iter().enumerate() {
        let Some(alias) = relation_alias(&table.relation) else {
            continue;
        };
        // an explicit anchor restricts the join to that table; without one
        // every outer table joins the temp table
        if let Some(target) = p0_alias {
            if alias != target {
                continue;
            }
        }
        let snippet = format!(
            "SELECT * FROM __pc INNER JOIN {tmp_table} AS tmp_{alias} \
             ON tmp_{alias}.{join_column_name} = {alias}.{partition_key}"
        );
        let parsed = parse::parse_one(&snippet)?;
        let join = parse::outer_select(&parsed)
            .and_then(|s| s.from.first())
            .and_then(|t| t.joins.first())
            .cloned()
            .ok_or_else(|| anyhow!("join snippet has no join"))?;
        joins_to_add.push((index, join));
    }
    for (index, join) in joins_to_add {
        select.from[index].joins.push(join);
    }
    Ok(())
}

/// Splice a materialised partition-key set into a query.
///
/// Covers the common cases; callers owning the original query text are free
/// to rewrite it themselves instead.
pub fn extend_query_with_partition_keys(
    query: &str,
    partition_keys: &ValueSet,
    partition_key: &str,
    method: Method,
    options: &ExtendOptions,
) -> Result<String> {
    if partition_keys.is_empty() {
        return Ok(query.to_string());
    }
    if method == Method::InSubquery {
        return Err(ConfigError::Other(
            "IN_SUBQUERY requires a lazy backend, use extend_query_with_partition_keys_lazy"
                .to_string(),
        )
        .into());
    }

    let p0_alias = match (&options.p0_alias, method) {
        (Some(alias), _) => Some(alias.clone()),
        // TMP_TABLE_JOIN without an anchor joins every table
        (None, Method::TmpTableJoin) => None,
        (None, _) => Some(crate::apply::find_anchor_alias(
            query,
            partition_key,
            options.auto_detect_partition_join,
            options.partition_join_table.as_deref(),
        )?),
    };

    let mut statement = parse::parse_one(query)?;
    match method {
        Method::In => {
            let alias = p0_alias.expect("alias resolved above");
            add_where_condition(
                &mut statement,
                &format!("{alias}.{partition_key} IN ({})", values_list(partition_keys)),
            )?;
            Ok(statement.to_string())
        }
        Method::Values => {
            let alias = p0_alias.expect("alias resolved above");
            add_where_condition(
                &mut statement,
                &format!(
                    "{alias}.{partition_key} IN (VALUES {})",
                    values_rows(partition_keys)
                ),
            )?;
            Ok(statement.to_string())
        }
        Method::TmpTableIn => {
            let alias = p0_alias.expect("alias resolved above");
            let setup = tmp_table_setup(partition_keys, options.analyze_tmp_table);
            add_where_condition(
                &mut statement,
                &format!(
                    "{alias}.{partition_key} IN (SELECT partition_key FROM tmp_partition_keys)"
                ),
            )?;
            Ok(format!("{setup}{statement}"))
        }
        Method::TmpTableJoin => {
            let setup = tmp_table_setup(partition_keys, options.analyze_tmp_table);
            splice_tmp_table_join(
                &mut statement,
                "tmp_partition_keys",
                "partition_key",
                partition_key,
                p0_alias.as_deref(),
            )?;
            Ok(format!("{setup}{statement}"))
        }
        Method::InSubquery => unreachable!("rejected above"),
    }
}

fn lazy_tmp_table_setup(
    lazy_subquery: &str,
    partition_key: &str,
    analyze_tmp_table: bool,
) -> (String, String) {
    let table_name = format!("tmp_cache_keys_{}", &hash_query(lazy_subquery)[..8]);
    let mut setup = format!("CREATE TEMPORARY TABLE {table_name} AS ({lazy_subquery});\n");
    if analyze_tmp_table {
        setup.push_str(&format!(
            "CREATE INDEX {table_name}_idx ON {table_name} ({partition_key});\n"
        ));
        setup.push_str(&format!("ANALYZE {table_name};\n"));
    }
    (setup, table_name)
}

/// Splice a lazy intersection sub-query into a query. The sub-query is
/// evaluated by the DBMS, so large key sets never travel to the client.
pub fn extend_query_with_partition_keys_lazy(
    query: &str,
    lazy_subquery: &str,
    partition_key: &str,
    method: Method,
    options: &ExtendOptions,
) -> Result<String> {
    if lazy_subquery.trim().is_empty() {
        return Ok(query.to_string());
    }
    let method = match method {
        // the eager IN-list maps to the sub-query form on the lazy path
        Method::In | Method::InSubquery => Method::InSubquery,
        Method::TmpTableIn => Method::TmpTableIn,
        Method::TmpTableJoin => Method::TmpTableJoin,
        Method::Values => {
            return Err(ConfigError::Other(
                "VALUES cannot splice a lazy sub-query".to_string(),
            )
            .into());
        }
    };

    let p0_alias = match (&options.p0_alias, method) {
        (Some(alias), _) => Some(alias.clone()),
        (None, Method::TmpTableJoin) => None,
        (None, _) => Some(crate::apply::find_anchor_alias(
            query,
            partition_key,
            options.auto_detect_partition_join,
            options.partition_join_table.as_deref(),
        )?),
    };

    let mut statement = parse::parse_one(query)?;
    match method {
        Method::InSubquery => {
            let alias = p0_alias.expect("alias resolved above");
            add_where_condition(
                &mut statement,
                &format!("{alias}.{partition_key} IN ({lazy_subquery})"),
            )?;
            Ok(statement.to_string())
        }
        Method::TmpTableIn => {
            let alias = p0_alias.expect("alias resolved above");
            let (setup, table_name) =
                lazy_tmp_table_setup(lazy_subquery, partition_key, options.analyze_tmp_table);
            add_where_condition(
                &mut statement,
                &format!("{alias}.{partition_key} IN (SELECT {partition_key} FROM {table_name})"),
            )?;
            Ok(format!("{setup}{statement}"))
        }
        Method::TmpTableJoin => {
            let (setup, table_name) =
                lazy_tmp_table_setup(lazy_subquery, partition_key, options.analyze_tmp_table);
            splice_tmp_table_join(
                &mut statement,
                &table_name,
                partition_key,
                partition_key,
                p0_alias.as_deref(),
            )?;
            Ok(format!("{setup}{statement}"))
        }
        _ => unreachable!("mapped above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partitioncache_cache::model::int_set;

    fn opts() -> ExtendOptions {
        ExtendOptions::new()
    }

    #[test]
    fn in_method_appends_to_where() {
        let extended = extend_query_with_partition_keys(
            "SELECT * FROM taxi_trips AS t WHERE t.fare_amount > 20",
            &int_set([1, 2, 3]),
            "trip_id",
            Method::In,
            &opts(),
        )
        .unwrap();
        assert_eq!(
            extended,
            "SELECT * FROM taxi_trips AS t WHERE t.fare_amount > 20 AND t.trip_id IN (1, 2, 3)"
        );
    }

    #[test]
    fn empty_key_set_returns_query_unchanged() {
        let query = "SELECT * FROM taxi_trips AS t WHERE t.fare_amount > 20";
        let extended = extend_query_with_partition_keys(
            query,
            &ValueSet::new(),
            "trip_id",
            Method::In,
            &opts(),
        )
        .unwrap();
        assert_eq!(extended, query);
    }

    #[test]
    fn tmp_table_in_prepends_setup() {
        let extended = extend_query_with_partition_keys(
            "SELECT * FROM taxi_trips AS t WHERE t.fare_amount > 20",
            &int_set([7, 9]),
            "trip_id",
            Method::TmpTableIn,
            &opts(),
        )
        .unwrap();
        assert!(extended.starts_with(
            "CREATE TEMPORARY TABLE tmp_partition_keys (partition_key BIGINT PRIMARY KEY);"
        ));
        assert!(extended.contains("INSERT INTO tmp_partition_keys (partition_key) VALUES (7),(9);"));
        assert!(extended.contains("ANALYZE tmp_partition_keys;"));
        assert!(
            extended.ends_with(
                "WHERE t.fare_amount > 20 AND t.trip_id IN \
                 (SELECT partition_key FROM tmp_partition_keys)"
            )
        );
    }

    #[test]
    fn tmp_table_join_joins_every_table_without_anchor() {
        let extended = extend_query_with_partition_keys(
            "SELECT * FROM ta AS a, tb AS b WHERE a.trip_id = b.trip_id",
            &int_set([1]),
            "trip_id",
            Method::TmpTableJoin,
            &opts(),
        )
        .unwrap();
        assert!(extended.contains("ta AS a JOIN tmp_partition_keys AS tmp_a"));
        assert!(extended.contains("tb AS b JOIN tmp_partition_keys AS tmp_b"));
        assert!(extended.contains("tmp_a.partition_key = a.trip_id"));
    }

    #[test]
    fn lazy_subquery_is_spliced_inline() {
        let extended = extend_query_with_partition_keys_lazy(
            "SELECT * FROM taxi_trips AS t WHERE t.fare_amount > 20",
            "(SELECT x FROM cache_table)",
            "trip_id",
            Method::InSubquery,
            &opts(),
        )
        .unwrap();
        assert!(extended.contains("t.trip_id IN ((SELECT x FROM cache_table))"));
    }
}

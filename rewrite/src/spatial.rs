use crate::extend::add_where_condition;
use anyhow::{Result, anyhow};
use partitioncache_query::parse;
use sqlparser::ast::TableFactor;

fn first_table_alias(query: &str) -> Result<String> {
    let statement = parse::parse_one(query)?;
    let select = parse::outer_select(&statement)
        .ok_or_else(|| anyhow!("query has no outer SELECT"))?;
    let relation = select
        .from
        .first()
        .map(|table| &table.relation)
        .ok_or_else(|| anyhow!("no table found in query"))?;
    if let TableFactor::Table { name, alias, .. } = relation {
        Ok(alias
            .as_ref()
            .map(|a| a.name.value.clone())
            .unwrap_or_else(|| name.to_string()))
    } else {
        Err(anyhow!("no table found in query"))
    }
}

/// Splice an `ST_DWithin` restriction against a lazily-evaluated filter
/// geometry. Both sides are transformed to WGS84 before the geography cast,
/// since `::geography` only supports lon/lat coordinate systems.
pub fn extend_query_with_spatial_filter_lazy(
    query: &str,
    spatial_filter_sql: &str,
    geometry_column: &str,
    buffer_distance: f64,
    p0_alias: Option<&str>,
) -> Result<String> {
    if spatial_filter_sql.trim().is_empty() {
        return Ok(query.to_string());
    }
    let alias = match p0_alias {
        Some(alias) => alias.to_string(),
        None => first_table_alias(query)?,
    };
    let condition = format!(
        "ST_DWithin(ST_Transform({alias}.{geometry_column}, 4326)::geography, \
         ST_Transform(({spatial_filter_sql})::geometry, 4326)::geography, {buffer_distance})"
    );
    let mut statement = parse::parse_one(query)?;
    add_where_condition(&mut statement, &condition)?;
    Ok(statement.to_string())
}

/// Splice an `ST_DWithin` restriction against a pre-computed filter
/// geometry given as WKB bytes.
pub fn extend_query_with_spatial_filter(
    query: &str,
    spatial_filter_wkb: &[u8],
    geometry_column: &str,
    buffer_distance: f64,
    srid: i32,
    p0_alias: Option<&str>,
) -> Result<String> {
    if spatial_filter_wkb.is_empty() {
        return Ok(query.to_string());
    }
    let alias = match p0_alias {
        Some(alias) => alias.to_string(),
        None => first_table_alias(query)?,
    };
    let wkb_hex = hex::encode(spatial_filter_wkb);
    let condition = format!(
        "ST_DWithin(ST_Transform({alias}.{geometry_column}, 4326)::geography, \
         ST_Transform(ST_GeomFromWKB('\\x{wkb_hex}', {srid})::geometry, 4326)::geography, \
         {buffer_distance})"
    );
    let mut statement = parse::parse_one(query)?;
    add_where_condition(&mut statement, &condition)?;
    Ok(statement.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazy_spatial_filter_is_spliced() {
        let extended = extend_query_with_spatial_filter_lazy(
            "SELECT * FROM pois AS p WHERE p.poi_type = 'museum'",
            "SELECT geom FROM filter_geoms",
            "geom",
            500.0,
            None,
        )
        .unwrap();
        assert!(extended.contains("ST_DWithin"));
        assert!(extended.contains("p.geom"));
        assert!(extended.contains("500"));
    }

    #[test]
    fn empty_filter_leaves_query_unchanged() {
        let query = "SELECT * FROM pois AS p";
        let extended =
            extend_query_with_spatial_filter(query, &[], "geom", 100.0, 4326, None).unwrap();
        assert_eq!(extended, query);
    }

    #[test]
    fn wkb_filter_embeds_hex_literal() {
        let extended = extend_query_with_spatial_filter(
            "SELECT * FROM pois AS p",
            &[0x01, 0x02],
            "geom",
            250.0,
            4326,
            Some("p"),
        )
        .unwrap();
        assert!(extended.contains("0102"));
        assert!(extended.contains("ST_GeomFromWKB"));
    }
}

use partitioncache_query::hashing::hash_query;
use partitioncache_query::normalize::clean_query;
use partitioncache_query::{
    VariantGenOptions, generate_all_query_hash_pairs, generate_partial_queries,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;

const THREE_TABLE_QUERY: &str =
    "SELECT DISTINCT t.trip_id FROM taxi_trips AS t, osm_pois AS p, weather AS w \
     WHERE ST_DWithin(t.pickup_geom, p.geom, 200) AND p.poi_type = 'museum' \
     AND w.trip_id = t.trip_id AND w.rain > 0";

#[test]
fn hashing_uses_sha1_hex() {
    // the reference SHA-1 test vector
    assert_eq!(hash_query("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
}

#[test]
fn every_fragment_parses_as_a_select() {
    let pairs = generate_all_query_hash_pairs(
        THREE_TABLE_QUERY,
        "trip_id",
        &VariantGenOptions::default(),
    )
    .unwrap();
    assert!(!pairs.is_empty());
    for (fragment, hash) in &pairs {
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, fragment)
            .unwrap_or_else(|e| panic!("fragment failed to parse: {fragment}: {e}"));
        assert_eq!(statements.len(), 1);
        assert!(fragment.to_uppercase().starts_with("SELECT"));
        assert_eq!(hash.len(), 40);
        assert_eq!(*hash, hash_query(fragment));
    }
}

#[test]
fn fragments_reference_the_fact_table() {
    let pairs = generate_all_query_hash_pairs(
        "SELECT * FROM taxi_trips AS t WHERE t.fare_amount > 20 AND t.trip_id IN (1, 2, 3)",
        "trip_id",
        &VariantGenOptions::default(),
    )
    .unwrap();
    assert!(!pairs.is_empty());
    for (fragment, _) in &pairs {
        assert!(
            fragment.contains("taxi_trips"),
            "fragment misses the fact table: {fragment}"
        );
    }
}

#[test]
fn hash_sets_are_invocation_order_independent() {
    let opts = VariantGenOptions {
        keep_all_attributes: false,
        ..VariantGenOptions::default()
    };
    let first: BTreeSet<String> =
        generate_all_query_hash_pairs(THREE_TABLE_QUERY, "trip_id", &opts)
            .unwrap()
            .into_iter()
            .map(|(_, hash)| hash)
            .collect();
    let second: BTreeSet<String> =
        generate_all_query_hash_pairs(THREE_TABLE_QUERY, "trip_id", &opts)
            .unwrap()
            .into_iter()
            .map(|(_, hash)| hash)
            .collect();
    assert_eq!(first, second);
}

#[test]
fn join_on_syntax_matches_comma_join_fragments() {
    let comma = "SELECT t.trip_id FROM taxi_trips AS t, osm_pois AS p \
                 WHERE ST_DWithin(t.pickup_geom, p.geom, 500) AND t.fare_amount > 10";
    let join_on = "SELECT t.trip_id FROM taxi_trips AS t \
                   JOIN osm_pois AS p ON ST_DWithin(t.pickup_geom, p.geom, 500) \
                   WHERE t.fare_amount > 10";
    let opts = VariantGenOptions::default();
    let from_comma: BTreeSet<String> = generate_all_query_hash_pairs(comma, "trip_id", &opts)
        .unwrap()
        .into_iter()
        .map(|(_, hash)| hash)
        .collect();
    let from_join: BTreeSet<String> = generate_all_query_hash_pairs(join_on, "trip_id", &opts)
        .unwrap()
        .into_iter()
        .map(|(_, hash)| hash)
        .collect();
    assert_eq!(from_comma, from_join);
}

#[test]
fn order_by_and_limit_do_not_change_hashes() {
    let plain = "SELECT * FROM taxi_trips AS t WHERE t.fare_amount > 20";
    let decorated = "SELECT t.trip_id FROM taxi_trips AS t WHERE t.fare_amount > 20 \
                     ORDER BY t.trip_id LIMIT 50";
    let opts = VariantGenOptions::default();
    let from_plain: BTreeSet<String> = generate_all_query_hash_pairs(plain, "trip_id", &opts)
        .unwrap()
        .into_iter()
        .map(|(_, hash)| hash)
        .collect();
    let from_decorated: BTreeSet<String> =
        generate_all_query_hash_pairs(decorated, "trip_id", &opts)
            .unwrap()
            .into_iter()
            .map(|(_, hash)| hash)
            .collect();
    assert_eq!(from_plain, from_decorated);
}

#[test]
fn relaxed_attributes_emit_additional_variants() {
    let query = "SELECT * FROM taxi_trips AS t WHERE t.fare_amount > 20 AND t.tip_amount > 5";
    let strict = generate_all_query_hash_pairs(query, "trip_id", &VariantGenOptions::default())
        .unwrap();
    let relaxed = generate_all_query_hash_pairs(
        query,
        "trip_id",
        &VariantGenOptions {
            keep_all_attributes: false,
            ..VariantGenOptions::default()
        },
    )
    .unwrap();
    assert!(relaxed.len() > strict.len());
    // the strict set is contained in the relaxed set
    let strict_hashes: BTreeSet<&String> = strict.iter().map(|(_, hash)| hash).collect();
    let relaxed_hashes: BTreeSet<&String> = relaxed.iter().map(|(_, hash)| hash).collect();
    assert!(strict_hashes.is_subset(&relaxed_hashes));
}

#[test]
fn component_size_window_limits_variants() {
    let cleaned = clean_query(THREE_TABLE_QUERY).unwrap();
    let pairs = generate_partial_queries(
        &cleaned,
        "trip_id",
        &VariantGenOptions {
            min_component_size: 2,
            ..VariantGenOptions::default()
        },
        None,
    )
    .unwrap();
    for fragment in &pairs {
        let table_count = fragment.matches(" AS t").count();
        assert!(table_count >= 2, "undersized fragment: {fragment}");
    }
}

#[test]
fn deprecated_star_join_options_conflict() {
    let options = VariantGenOptions::default().with_partition_join_table("p0_mv");
    assert!(options.with_star_join_table("p0_mv").is_err());
    let accepted = VariantGenOptions::default()
        .with_star_join_table("p0_mv")
        .unwrap();
    assert_eq!(accepted.partition_join_table.as_deref(), Some("p0_mv"));
}

#[test]
fn star_query_fragments_extend_through_the_center() {
    // three tables joined pairwise through a central mv table
    let query = "SELECT * FROM ta AS a, tb AS b, tc AS c, p0_mv AS p \
                 WHERE a.id = p.id AND b.id = p.id AND c.id = p.id \
                 AND a.x = 1 AND b.y = 2 AND c.z = 3";
    let pairs =
        generate_all_query_hash_pairs(query, "id", &VariantGenOptions::default()).unwrap();
    assert!(!pairs.is_empty());
    for (fragment, _) in &pairs {
        assert!(fragment.contains("p0_mv AS p1"), "no star center: {fragment}");
    }
}

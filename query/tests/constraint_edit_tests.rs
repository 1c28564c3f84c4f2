use partitioncache_query::constraints::{
    add_constraints_to_query, remove_constraints_from_query,
};
use partitioncache_query::{VariantGenOptions, generate_all_query_hash_pairs};
use std::collections::{BTreeMap, BTreeSet};

const SPATIAL_QUERY: &str =
    "SELECT DISTINCT t.trip_id FROM taxi_trips AS t, osm_pois AS p \
     WHERE ST_DWithin(t.pickup_geom, p.geom, 200) AND p.poi_type = 'museum' \
     AND t.fare_amount > 20";

fn hashes(query: &str, opts: &VariantGenOptions) -> BTreeSet<String> {
    generate_all_query_hash_pairs(query, "trip_id", opts)
        .unwrap()
        .into_iter()
        .map(|(_, hash)| hash)
        .collect()
}

#[test]
fn remove_all_changes_every_variant() {
    let base = VariantGenOptions::default();
    let stripped = VariantGenOptions {
        remove_constraints_all: vec!["poi_type".to_string()],
        ..VariantGenOptions::default()
    };
    let with_conditions = generate_all_query_hash_pairs(SPATIAL_QUERY, "trip_id", &base).unwrap();
    let without = generate_all_query_hash_pairs(SPATIAL_QUERY, "trip_id", &stripped).unwrap();
    assert!(with_conditions.iter().any(|(f, _)| f.contains("poi_type")));
    assert!(without.iter().all(|(f, _)| !f.contains("poi_type")));
}

#[test]
fn remove_add_is_a_superset_of_the_plain_run() {
    let base = VariantGenOptions::default();
    let extended = VariantGenOptions {
        remove_constraints_add: vec!["fare_amount".to_string()],
        ..VariantGenOptions::default()
    };
    let plain = hashes(SPATIAL_QUERY, &base);
    let with_extras = hashes(SPATIAL_QUERY, &extended);
    assert!(plain.is_subset(&with_extras));
    assert!(with_extras.len() > plain.len());
}

#[test]
fn add_constraints_keep_the_unconstrained_variants() {
    let mut add_constraints = BTreeMap::new();
    add_constraints.insert("osm_pois".to_string(), "size = 4".to_string());
    let with_add = VariantGenOptions {
        add_constraints,
        ..VariantGenOptions::default()
    };
    let pairs = generate_all_query_hash_pairs(SPATIAL_QUERY, "trip_id", &with_add).unwrap();
    assert!(pairs.iter().any(|(f, _)| f.contains("size = 4")));
    // originals survive alongside the constrained variants
    assert!(
        pairs
            .iter()
            .any(|(f, _)| f.contains("osm_pois") && !f.contains("size = 4"))
    );
}

#[test]
fn orphan_removal_cascades_to_stale_conditions() {
    let fragment = "SELECT DISTINCT t1.trip_id FROM taxi_trips AS t1, osm_pois AS t2 \
                    WHERE ST_DWithin(t1.pickup_geom, t2.geom, 200) \
                    AND t2.poi_type = 'museum' AND t1.fare_amount > 20";
    let pruned = remove_constraints_from_query(fragment, &["pickup_geom".to_string()]);
    assert!(!pruned.contains("osm_pois"));
    assert!(!pruned.contains("poi_type"));
    assert!(!pruned.contains("ST_DWithin"));
    assert!(pruned.contains("t1.fare_amount > 20"));
}

#[test]
fn exists_conditions_keep_tables_connected() {
    let query = "SELECT DISTINCT t1.trip_id FROM trips AS t1, zones AS t2 \
                 WHERE t1.fare > 1 AND EXISTS (SELECT 1 FROM links AS l \
                 WHERE l.trip_id = t1.trip_id AND l.zone_id = t2.zone_id)";
    let pruned = remove_constraints_from_query(query, &["fare".to_string()]);
    // the correlated EXISTS still links both tables, nothing is orphaned
    assert!(pruned.contains("zones"));
    assert!(pruned.contains("EXISTS"));
    assert!(!pruned.contains("t1.fare > 1"));
}

#[test]
fn removing_everything_leaves_a_bare_scan() {
    let query = "SELECT DISTINCT t1.trip_id FROM trips AS t1 WHERE t1.fare > 1";
    let pruned = remove_constraints_from_query(query, &["fare".to_string()]);
    assert_eq!(pruned, "SELECT DISTINCT t1.trip_id FROM trips AS t1");
}

#[test]
fn add_constraint_parse_failures_leave_the_query_unchanged() {
    let mut add_constraints = BTreeMap::new();
    add_constraints.insert("trips".to_string(), "NOT VALID SQL ((".to_string());
    let query = "SELECT * FROM trips AS t WHERE t.fare > 1";
    assert_eq!(add_constraints_to_query(query, &add_constraints), query);
}

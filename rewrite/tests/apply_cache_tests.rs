use partitioncache_cache::model::int_set;
use partitioncache_cache::{CacheHandler, Datatype, MemoryCacheHandler, RegisterOptions};
use partitioncache_query::hashing::hash_query;
use partitioncache_rewrite::{ApplyCacheOptions, Method, apply_cache};

fn single_table_options() -> ApplyCacheOptions {
    let mut options = ApplyCacheOptions::default();
    options.variants.min_component_size = 1;
    options
}

const QUERY: &str = "SELECT * FROM taxi_trips AS t \
                     WHERE t.fare_amount > 20 AND t.trip_id IN (1, 2, 3)";
const FRAGMENT: &str =
    "SELECT DISTINCT t1.trip_id FROM taxi_trips AS t1 WHERE t1.fare_amount > 20";

#[tokio::test]
async fn empty_cache_returns_query_unchanged() {
    let cache = MemoryCacheHandler::new();
    cache
        .register_partition_key("trip_id", Datatype::Integer, &RegisterOptions::default())
        .await
        .unwrap();

    let (rewritten, stats) = apply_cache(QUERY, &cache, "trip_id", &single_table_options())
        .await
        .unwrap();
    assert_eq!(rewritten, QUERY);
    assert_eq!(stats.cache_hits, 0);
    assert!(!stats.enhanced);
    assert!(stats.generated_variants > 0);
}

#[tokio::test]
async fn populated_fragment_restricts_partition_scan() {
    let cache = MemoryCacheHandler::new();
    cache
        .register_partition_key("trip_id", Datatype::Integer, &RegisterOptions::default())
        .await
        .unwrap();

    // a fill cycle evaluated the attribute fragment against the DBMS
    cache
        .set_cache(&hash_query(FRAGMENT), &int_set([1, 2, 3, 4, 5]), "trip_id")
        .await
        .unwrap();
    cache
        .set_query(&hash_query(FRAGMENT), FRAGMENT, "trip_id")
        .await
        .unwrap();

    let mut options = single_table_options();
    options.method = Method::In;
    let (rewritten, stats) = apply_cache(QUERY, &cache, "trip_id", &options)
        .await
        .unwrap();
    assert!(stats.enhanced);
    assert_eq!(stats.cache_hits, 1);
    assert!(
        rewritten.ends_with("AND t.trip_id IN (1, 2, 3, 4, 5)"),
        "unexpected rewrite: {rewritten}"
    );
    assert!(rewritten.contains("t.fare_amount > 20"));
    assert!(rewritten.contains("t.trip_id IN (1, 2, 3)"));
}

#[tokio::test]
async fn intersection_across_fragments_narrows_the_set() {
    let cache = MemoryCacheHandler::new();
    let query = "SELECT * FROM taxi_trips AS t \
                 WHERE t.fare_amount > 20 AND t.payment_type = 'card'";
    let fare_fragment =
        "SELECT DISTINCT t1.trip_id FROM taxi_trips AS t1 WHERE t1.fare_amount > 20";
    let payment_fragment =
        "SELECT DISTINCT t1.trip_id FROM taxi_trips AS t1 WHERE t1.payment_type = 'card'";
    cache
        .set_cache(&hash_query(fare_fragment), &int_set([1, 2, 3]), "trip_id")
        .await
        .unwrap();
    cache
        .set_cache(&hash_query(payment_fragment), &int_set([2, 3, 4]), "trip_id")
        .await
        .unwrap();

    let (rewritten, stats) = apply_cache(query, &cache, "trip_id", &single_table_options())
        .await
        .unwrap();
    assert_eq!(stats.cache_hits, 2);
    assert!(stats.enhanced);
    assert!(
        rewritten.contains("t.trip_id IN (2, 3)"),
        "unexpected rewrite: {rewritten}"
    );
}

#[tokio::test]
async fn values_method_uses_values_rows() {
    let cache = MemoryCacheHandler::new();
    cache
        .set_cache(&hash_query(FRAGMENT), &int_set([8, 9]), "trip_id")
        .await
        .unwrap();

    let mut options = single_table_options();
    options.method = Method::Values;
    let (rewritten, _) = apply_cache(QUERY, &cache, "trip_id", &options)
        .await
        .unwrap();
    assert!(
        rewritten.contains("t.trip_id IN (VALUES (8), (9))"),
        "unexpected rewrite: {rewritten}"
    );
}

#[tokio::test]
async fn p0_rewrite_happens_even_without_cache_hits() {
    let cache = MemoryCacheHandler::new();
    let query = "SELECT * FROM tt AS a, tt AS b WHERE a.zone = b.zone AND a.x = 1";
    let mut options = ApplyCacheOptions::default();
    options.variants.min_component_size = 1;
    options.use_p0_table = true;
    let (rewritten, stats) = apply_cache(query, &cache, "zone", &options).await.unwrap();
    assert!(stats.p0_rewritten);
    assert!(!stats.enhanced);
    assert!(rewritten.contains("zone_mv AS p0"));
    assert!(rewritten.contains("a.zone = p0.zone"));
    assert!(!rewritten.contains("a.zone = b.zone"));
}

#[tokio::test]
async fn p0_rewrite_targets_the_star_table_for_the_splice() {
    let cache = MemoryCacheHandler::new();
    let fragment = "SELECT DISTINCT t1.zone FROM tt AS t1 WHERE t1.x = 1";
    cache
        .set_cache(&hash_query(fragment), &int_set([1, 2]), "zone")
        .await
        .unwrap();

    let query = "SELECT * FROM tt AS a, tt AS b WHERE a.zone = b.zone AND a.x = 1";
    let mut options = ApplyCacheOptions::default();
    options.variants.min_component_size = 1;
    options.use_p0_table = true;
    let (rewritten, stats) = apply_cache(query, &cache, "zone", &options).await.unwrap();
    assert!(stats.p0_rewritten);
    assert!(stats.enhanced);
    assert!(
        rewritten.contains("p0.zone IN (1, 2)"),
        "unexpected rewrite: {rewritten}"
    );
}

#[tokio::test]
async fn tmp_table_method_produces_a_setup_script() {
    let cache = MemoryCacheHandler::new();
    cache
        .set_cache(&hash_query(FRAGMENT), &int_set([3, 4]), "trip_id")
        .await
        .unwrap();

    let mut options = single_table_options();
    options.method = Method::TmpTableIn;
    let (rewritten, stats) = apply_cache(QUERY, &cache, "trip_id", &options)
        .await
        .unwrap();
    assert!(stats.enhanced);
    assert!(rewritten.starts_with("CREATE TEMPORARY TABLE tmp_partition_keys"));
    assert!(rewritten.contains("t.trip_id IN (SELECT partition_key FROM tmp_partition_keys)"));
}

#[tokio::test]
async fn null_entries_count_as_hits_but_do_not_restrict() {
    let cache = MemoryCacheHandler::new();
    cache.set_null(&hash_query(FRAGMENT), "trip_id").await.unwrap();

    let (rewritten, stats) = apply_cache(QUERY, &cache, "trip_id", &single_table_options())
        .await
        .unwrap();
    assert_eq!(stats.cache_hits, 1);
    assert!(!stats.enhanced);
    assert_eq!(rewritten, QUERY);
}

#[tokio::test]
async fn lazy_method_on_non_lazy_backend_is_a_configuration_error() {
    let cache = MemoryCacheHandler::new();
    let error = partitioncache_rewrite::apply_cache_lazy(
        QUERY,
        &cache,
        "trip_id",
        &single_table_options(),
    )
    .await
    .unwrap_err();
    assert!(
        error
            .downcast_ref::<partitioncache_cache::ConfigError>()
            .is_some(),
        "expected a configuration error, got: {error:#}"
    );
}

//! SQL objects of the in-DBMS processor.
//!
//! All object names derive from the queue prefix so several processors can
//! coexist in one database. The processing function mirrors the external
//! worker's executor: claim budget, pop fragments with SKIP LOCKED, stream
//! each fragment's result into the cache table, tombstone on failure, log.

/// Config, log and active-jobs tables.
pub fn config_tables(queue_prefix: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {queue_prefix}_processor_config (
             job_name TEXT PRIMARY KEY,
             enabled BOOLEAN NOT NULL DEFAULT false,
             frequency_seconds INTEGER NOT NULL DEFAULT 60,
             timeout_seconds INTEGER NOT NULL DEFAULT 1800,
             max_parallel_jobs INTEGER NOT NULL DEFAULT 2,
             table_prefix TEXT NOT NULL,
             queue_prefix TEXT NOT NULL,
             cache_backend TEXT NOT NULL,
             target_database TEXT NOT NULL,
             default_bitsize BIGINT,
             updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
         );
         CREATE TABLE IF NOT EXISTS {queue_prefix}_processor_log (
             id BIGSERIAL PRIMARY KEY,
             job_id TEXT,
             query_hash TEXT,
             partition_key TEXT,
             status TEXT NOT NULL CHECK (status IN ('success', 'timeout', 'failed')),
             error_message TEXT,
             execution_time_ms DOUBLE PRECISION,
             created_at TIMESTAMPTZ NOT NULL DEFAULT now()
         );
         CREATE TABLE IF NOT EXISTS {queue_prefix}_active_jobs (
             job_id TEXT PRIMARY KEY,
             query_hash TEXT NOT NULL,
             partition_key TEXT NOT NULL,
             started_at TIMESTAMPTZ NOT NULL DEFAULT now()
         );"
    )
}

/// The queue-draining function executed by pg_cron (or `manual-process`).
pub fn process_queue_function(queue_prefix: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {queue_prefix}_process_queue(p_max INTEGER DEFAULT NULL)
RETURNS INTEGER AS $$
DECLARE
    v_config RECORD;
    v_fragment RECORD;
    v_job_id TEXT;
    v_active INTEGER;
    v_budget INTEGER;
    v_processed INTEGER := 0;
    v_started TIMESTAMPTZ;
    v_elapsed DOUBLE PRECISION;
    v_cache_table TEXT;
    v_queries_table TEXT;
    v_fragment_queue TEXT;
    v_backend TEXT;
    v_bitsize BIGINT;
BEGIN
    SELECT * INTO v_config FROM {queue_prefix}_processor_config LIMIT 1;
    IF v_config IS NULL THEN
        RETURN 0;
    END IF;
    IF p_max IS NULL AND NOT v_config.enabled THEN
        RETURN 0;
    END IF;

    -- lease expiry: drop claims of workers that died mid-job
    DELETE FROM {queue_prefix}_active_jobs
    WHERE started_at < now() - make_interval(secs => GREATEST(v_config.timeout_seconds * 2, 300));

    SELECT COUNT(*) INTO v_active FROM {queue_prefix}_active_jobs;
    v_budget := LEAST(COALESCE(p_max, v_config.max_parallel_jobs),
                      v_config.max_parallel_jobs - v_active);
    IF v_budget <= 0 THEN
        RETURN 0;
    END IF;

    PERFORM set_config('statement_timeout', (v_config.timeout_seconds * 1000)::text, false);

    v_fragment_queue := v_config.queue_prefix || '_query_fragment_queue';
    v_queries_table := v_config.table_prefix || '_queries';

    WHILE v_processed < v_budget LOOP
        EXECUTE format(
            'SELECT id, query, hash, partition_key, partition_datatype, cache_backend
             FROM %I ORDER BY priority DESC, created_at ASC
             LIMIT 1 FOR UPDATE SKIP LOCKED', v_fragment_queue)
        INTO v_fragment;
        IF v_fragment.id IS NULL THEN
            EXIT;
        END IF;
        EXECUTE format('DELETE FROM %I WHERE id = $1', v_fragment_queue) USING v_fragment.id;

        v_job_id := v_fragment.hash || '_' || v_fragment.partition_key;
        INSERT INTO {queue_prefix}_active_jobs (job_id, query_hash, partition_key)
        VALUES (v_job_id, v_fragment.hash, v_fragment.partition_key)
        ON CONFLICT (job_id) DO UPDATE SET started_at = now();

        v_cache_table := v_config.table_prefix || '_cache_' || v_fragment.partition_key;
        v_backend := COALESCE(v_fragment.cache_backend, v_config.cache_backend);
        v_started := clock_timestamp();
        BEGIN
            IF v_backend = 'postgresql_bit' THEN
                EXECUTE format(
                    'SELECT bitsize FROM %I WHERE partition_key = $1',
                    v_config.table_prefix || '_partition_metadata')
                INTO v_bitsize USING v_fragment.partition_key;
                v_bitsize := COALESCE(v_bitsize, v_config.default_bitsize, 100000);
                EXECUTE format(
                    'WITH fragment_result AS (%s),
                     positions AS (
                         SELECT DISTINCT %I::bigint AS p FROM fragment_result
                         WHERE %I::bigint >= 0 AND %I::bigint < %s
                     ),
                     packed AS (
                         SELECT string_agg(
                                    CASE WHEN s.i IN (SELECT p FROM positions)
                                         THEN ''1'' ELSE ''0'' END,
                                    '''' ORDER BY s.i) AS bits,
                                (SELECT COUNT(*) FROM positions) AS cnt
                         FROM generate_series(0, %s - 1) AS s(i)
                     )
                     INSERT INTO %I (query_hash, partition_keys, partition_keys_count)
                     SELECT $1, bits::varbit, cnt FROM packed WHERE cnt > 0
                     ON CONFLICT (query_hash) DO UPDATE SET
                         partition_keys = EXCLUDED.partition_keys,
                         partition_keys_count = EXCLUDED.partition_keys_count',
                    v_fragment.query,
                    v_fragment.partition_key, v_fragment.partition_key,
                    v_fragment.partition_key, v_bitsize, v_bitsize, v_cache_table)
                USING v_fragment.hash;
            ELSIF v_backend = 'postgresql_array' THEN
                EXECUTE format(
                    'INSERT INTO %I (query_hash, partition_keys, partition_keys_count)
                     SELECT $1, array_agg(DISTINCT q.%I), COUNT(DISTINCT q.%I)
                     FROM (%s) AS q
                     HAVING COUNT(q.%I) > 0
                     ON CONFLICT (query_hash) DO UPDATE SET
                         partition_keys = EXCLUDED.partition_keys,
                         partition_keys_count = EXCLUDED.partition_keys_count',
                    v_cache_table, v_fragment.partition_key, v_fragment.partition_key,
                    v_fragment.query, v_fragment.partition_key)
                USING v_fragment.hash;
            ELSE
                -- roaring payloads are packed client-side, there is no SQL
                -- shape for them here
                RAISE EXCEPTION
                    'cache backend % is not supported by the in-database processor',
                    v_backend;
            END IF;

            EXECUTE format(
                'INSERT INTO %I (query_hash, partition_key, query, status)
                 VALUES ($1, $2, $3, ''ok'')
                 ON CONFLICT (query_hash, partition_key) DO UPDATE SET
                     query = EXCLUDED.query, status = ''ok'', last_seen = now()',
                v_queries_table)
            USING v_fragment.hash, v_fragment.partition_key, v_fragment.query;

            v_elapsed := EXTRACT(EPOCH FROM clock_timestamp() - v_started) * 1000;
            INSERT INTO {queue_prefix}_processor_log
                (job_id, query_hash, partition_key, status, execution_time_ms)
            VALUES (v_job_id, v_fragment.hash, v_fragment.partition_key, 'success', v_elapsed);
        EXCEPTION
            WHEN query_canceled THEN
                v_elapsed := EXTRACT(EPOCH FROM clock_timestamp() - v_started) * 1000;
                EXECUTE format(
                    'INSERT INTO %I (query_hash, partition_key, query, status)
                     VALUES ($1, $2, $3, ''timeout'')
                     ON CONFLICT (query_hash, partition_key) DO UPDATE SET
                         status = ''timeout'', last_seen = now()',
                    v_queries_table)
                USING v_fragment.hash, v_fragment.partition_key, v_fragment.query;
                INSERT INTO {queue_prefix}_processor_log
                    (job_id, query_hash, partition_key, status, error_message, execution_time_ms)
                VALUES (v_job_id, v_fragment.hash, v_fragment.partition_key,
                        'timeout', SQLERRM, v_elapsed);
            WHEN OTHERS THEN
                v_elapsed := EXTRACT(EPOCH FROM clock_timestamp() - v_started) * 1000;
                EXECUTE format(
                    'INSERT INTO %I (query_hash, partition_key, query, status)
                     VALUES ($1, $2, $3, ''failed'')
                     ON CONFLICT (query_hash, partition_key) DO UPDATE SET
                         status = ''failed'', last_seen = now()',
                    v_queries_table)
                USING v_fragment.hash, v_fragment.partition_key, v_fragment.query;
                INSERT INTO {queue_prefix}_processor_log
                    (job_id, query_hash, partition_key, status, error_message, execution_time_ms)
                VALUES (v_job_id, v_fragment.hash, v_fragment.partition_key,
                        'failed', SQLERRM, v_elapsed);
        END;

        DELETE FROM {queue_prefix}_active_jobs WHERE job_id = v_job_id;
        v_processed := v_processed + 1;
    END LOOP;

    RETURN v_processed;
END;
$$ LANGUAGE plpgsql"#
    )
}

/// Trigger keeping the pg_cron job in sync with the config row. The job
/// name derives deterministically from the target database and table
/// prefix.
pub fn cron_sync_trigger(queue_prefix: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {queue_prefix}_sync_cron_job()
RETURNS TRIGGER AS $$
DECLARE
    v_job_name TEXT;
    v_job_id BIGINT;
    v_row RECORD;
BEGIN
    IF TG_OP = 'DELETE' THEN
        v_row := OLD;
    ELSE
        v_row := NEW;
    END IF;
    v_job_name := 'partitioncache_process_' || v_row.target_database || '_' || v_row.table_prefix;
    SELECT jobid INTO v_job_id FROM cron.job WHERE jobname = v_job_name;

    IF TG_OP = 'DELETE' THEN
        IF v_job_id IS NOT NULL THEN
            PERFORM cron.unschedule(v_job_id);
        END IF;
        RETURN OLD;
    END IF;

    IF v_row.enabled THEN
        IF v_job_id IS NULL THEN
            PERFORM cron.schedule_in_database(
                v_job_name,
                v_row.frequency_seconds || ' seconds',
                format('SELECT %I(NULL)', v_row.queue_prefix || '_process_queue'),
                v_row.target_database);
        ELSE
            PERFORM cron.alter_job(
                job_id := v_job_id,
                schedule := v_row.frequency_seconds || ' seconds',
                active := true);
        END IF;
    ELSIF v_job_id IS NOT NULL THEN
        PERFORM cron.unschedule(v_job_id);
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;
CREATE OR REPLACE TRIGGER {queue_prefix}_processor_config_sync
    AFTER INSERT OR UPDATE OR DELETE ON {queue_prefix}_processor_config
    FOR EACH ROW EXECUTE FUNCTION {queue_prefix}_sync_cron_job()"#
    )
}

/// Objects to drop when the processor is removed.
pub fn drop_objects(queue_prefix: &str) -> String {
    format!(
        "DROP TRIGGER IF EXISTS {queue_prefix}_processor_config_sync
             ON {queue_prefix}_processor_config;
         DROP FUNCTION IF EXISTS {queue_prefix}_sync_cron_job();
         DROP FUNCTION IF EXISTS {queue_prefix}_process_queue(INTEGER);
         DROP TABLE IF EXISTS {queue_prefix}_active_jobs;
         DROP TABLE IF EXISTS {queue_prefix}_processor_log;
         DROP TABLE IF EXISTS {queue_prefix}_processor_config;"
    )
}

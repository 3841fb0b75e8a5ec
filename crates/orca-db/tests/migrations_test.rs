//! Integration tests for database migrations and connection pooling.
//!
//! Each test opens a fresh SQLite file inside its own temp directory, runs
//! migrations against it, and drops the directory on completion.

use orca_db::pool;
use orca_test_utils::create_test_db;

/// Expected tables created by the initial migration.
const EXPECTED_TABLES: &[&str] = &["budget_events", "invocations", "tasks"];

#[tokio::test]
async fn migrations_create_all_tables() {
    let (temp_pool, _dir) = create_test_db().await;

    let counts = pool::table_counts(&temp_pool)
        .await
        .expect("table_counts should succeed");

    let mut table_names: Vec<&str> = counts.iter().map(|(name, _)| name.as_str()).collect();
    table_names.sort_unstable();

    assert_eq!(
        table_names, EXPECTED_TABLES,
        "migration should create exactly the expected tables"
    );

    temp_pool.close().await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (temp_pool, _dir) = create_test_db().await;

    // Run migrations again -- should be a no-op against the already-applied set.
    pool::run_migrations(&temp_pool, pool::default_migrations_path())
        .await
        .expect("second migration run should succeed (idempotent)");

    for table in EXPECTED_TABLES {
        let query = format!("SELECT COUNT(*) FROM {table}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(&temp_pool)
            .await
            .unwrap_or_else(|e| panic!("failed to count {table}: {e}"));
        assert_eq!(count.0, 0, "table {table} should be empty after migrations");
    }

    temp_pool.close().await;
}

#[tokio::test]
async fn pool_is_functional_with_wal_journaling() {
    let (temp_pool, _dir) = create_test_db().await;

    let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
        .fetch_one(&temp_pool)
        .await
        .expect("journal_mode pragma should succeed");
    assert_eq!(mode.0.to_lowercase(), "wal");

    let one: (i32,) = sqlx::query_as("SELECT 1")
        .fetch_one(&temp_pool)
        .await
        .expect("simple query should work");
    assert_eq!(one.0, 1);

    temp_pool.close().await;
}

#[tokio::test]
async fn table_counts_returns_expected_tables() {
    let (temp_pool, _dir) = create_test_db().await;

    let counts = pool::table_counts(&temp_pool)
        .await
        .expect("table_counts should succeed");

    assert_eq!(counts.len(), EXPECTED_TABLES.len());
    for (name, count) in &counts {
        assert_eq!(*count, 0, "table {name} should be empty");
    }

    temp_pool.close().await;
}

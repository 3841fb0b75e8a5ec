//! Shared test utilities for orca integration tests.
//!
//! SQLite needs no server process, so unlike a Postgres-backed test harness
//! there is no shared container to bootstrap: each test gets its own
//! database file inside a fresh [`tempfile::TempDir`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;

use orca_db::config::DbConfig;
use orca_db::pool;

/// Create a temporary database with migrations applied.
///
/// Returns the pool and the [`TempDir`] backing it -- keep the directory
/// alive for as long as the pool is in use; dropping it deletes the file.
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir for test database");
    let db_path = dir.path().join("orca-test.db");
    let config = DbConfig::new(&db_path);

    let temp_pool = pool::create_pool(&config)
        .await
        .unwrap_or_else(|e| panic!("failed to open temp database {}: {e}", db_path.display()));

    pool::run_migrations(&temp_pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    (temp_pool, dir)
}

/// A controllable clock for deterministic assertions against budget
/// windows, poller backoff, and deploy timeouts -- all of which are
/// specified in terms of elapsed wall time.
#[derive(Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    /// A clock starting at a fixed, arbitrary instant.
    pub fn new() -> Self {
        let epoch = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("fixed epoch should parse")
            .with_timezone(&Utc);
        Self {
            now: Arc::new(Mutex::new(epoch)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("test clock mutex poisoned")
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("test clock mutex poisoned");
        *now += delta;
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

//! Shared pool-open sequence for every subcommand: ensure the database's
//! parent directory exists, connect, and bring the schema up to date.

use orca_db::pool;
use sqlx::SqlitePool;

use orca_core::config::OrcaConfig;

pub async fn open_pool(config: &OrcaConfig) -> anyhow::Result<SqlitePool> {
    pool::ensure_parent_dir(&config.db_config).await?;
    let db = pool::create_pool(&config.db_config).await?;
    pool::run_migrations(&db, pool::default_migrations_path()).await?;
    Ok(db)
}

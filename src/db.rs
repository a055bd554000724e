//! Connection pool and embedded migrations

use anyhow::{Context, Result};
use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use std::time::Duration;
use tracing::info;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/");

/// Build an r2d2 pool. Connections are established lazily so a database that
/// is down at start-up does not prevent the ingest loop from starting.
pub fn create_pool(database_url: &str, max_size: u32) -> PgPool {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .max_size(max_size)
        .connection_timeout(Duration::from_secs(10))
        .build_unchecked(manager)
}

/// Apply any pending migrations, returning how many ran.
pub fn run_migrations(pool: &PgPool) -> Result<usize> {
    let mut conn = pool
        .get()
        .context("Failed to get database connection for migrations")?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Failed to run database migrations: {}", e))?;
    for version in &applied {
        info!("Applied migration {}", version);
    }
    Ok(applied.len())
}

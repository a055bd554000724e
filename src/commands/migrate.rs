use anyhow::{Context, Result};
use flightview::config::AppConfig;
use flightview::db;
use tracing::info;

pub async fn handle_migrate(config: &AppConfig) -> Result<()> {
    let pool = db::create_pool(&config.database_url, 1);
    let applied = tokio::task::spawn_blocking(move || db::run_migrations(&pool))
        .await
        .context("Migration task panicked")??;
    if applied == 0 {
        info!("Database schema is up to date");
    } else {
        info!("Applied {} migration(s)", applied);
    }
    Ok(())
}

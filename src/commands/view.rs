use anyhow::{Context, Result};
use chrono::Utc;
use flightview::aircraft_states_repo::AircraftStatesRepository;
use flightview::config::AppConfig;
use flightview::db;
use flightview::viewer::Viewer;

use super::shutdown_signal;

/// Show the latest aircraft until the session ends. The viewer only reads.
pub async fn handle_view(
    config: &AppConfig,
    once: bool,
    limit: Option<i64>,
    refresh_seconds: Option<u64>,
) -> Result<()> {
    let mut viewer_config = config.viewer.clone();
    if let Some(limit) = limit {
        anyhow::ensure!(limit > 0, "--limit must be greater than zero");
        viewer_config.limit = limit;
    }
    if let Some(secs) = refresh_seconds {
        anyhow::ensure!(secs > 0, "--refresh must be greater than zero");
        viewer_config.refresh = std::time::Duration::from_secs(secs);
    }

    let pool = db::create_pool(&config.database_url, 1);
    let viewer = Viewer::new(AircraftStatesRepository::new(pool), viewer_config);

    if once {
        print!("{}", viewer.frame(Utc::now()).await);
        return Ok(());
    }

    viewer
        .run(shutdown_signal())
        .await
        .context("Failed to write to terminal")
}

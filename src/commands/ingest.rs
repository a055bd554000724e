use anyhow::{Context, Result};
use flightview::aircraft_states_repo::AircraftStatesRepository;
use flightview::config::AppConfig;
use flightview::db;
use flightview::ingest::{CycleContext, IngestCycle};
use flightview::instance_lock::InstanceLock;
use flightview::metrics::init_ingest_metrics;
use flightview::opensky_client::{OpenSkyClient, SnapshotSource};
use flightview::state_store::{InMemoryStateStore, StateStore};
use tracing::{info, warn};

use super::shutdown_signal;

/// Ingest pool size; the cycle writes sequentially so one connection is
/// in use at a time, the spare covers pruning and reconnects.
const INGEST_POOL_SIZE: u32 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    /// Run a single cycle and exit
    pub once: bool,
    /// Keep state in memory instead of PostgreSQL
    pub dry_run: bool,
}

pub async fn handle_ingest(config: &AppConfig, options: IngestOptions) -> Result<()> {
    init_ingest_metrics(config.metrics_port)?;

    let source = OpenSkyClient::new(config.credentials.clone())
        .context("Failed to build OpenSky client")?;
    if source.is_authenticated() {
        info!("Using OpenSky client credentials");
    } else {
        warn!("No OpenSky credentials configured, fetching anonymously (lower rate limits)");
    }

    if options.dry_run {
        info!("Dry run: aircraft states are kept in memory only");
        let cycle = IngestCycle::new(source, InMemoryStateStore::new(), config.geofence)
            .with_max_rows(config.max_rows);
        return drive(&cycle, config, options.once).await;
    }

    // Only one process may write the store
    let _lock = InstanceLock::acquire("ingest")?;

    let pool = db::create_pool(&config.database_url, INGEST_POOL_SIZE);
    let migration_pool = pool.clone();
    tokio::task::spawn_blocking(move || db::run_migrations(&migration_pool))
        .await
        .context("Migration task panicked")??;

    let cycle = IngestCycle::new(source, AircraftStatesRepository::new(pool), config.geofence)
        .with_max_rows(config.max_rows);
    drive(&cycle, config, options.once).await
}

async fn drive<S, T>(cycle: &IngestCycle<S, T>, config: &AppConfig, once: bool) -> Result<()>
where
    S: SnapshotSource,
    T: StateStore,
{
    if once {
        let mut ctx = CycleContext::new();
        let report = cycle.run_cycle(&mut ctx).await?;
        info!(
            "Fetched {}, upserted {}, filtered {}, malformed {}, write failures {}",
            report.fetched,
            report.upserted,
            report.filtered,
            report.malformed,
            report.write_failures
        );
        return Ok(());
    }

    let ctx = cycle.run(config.poll_interval, shutdown_signal()).await;
    info!(
        "Ingest stopped after {} cycles ({} succeeded, {} failed)",
        ctx.cycle_count, ctx.successful_cycles, ctx.failed_cycles
    );
    Ok(())
}

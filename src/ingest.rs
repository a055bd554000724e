//! Periodic ingest cycle
//!
//! Each tick walks `Idle → Fetching → Filtering → Persisting → Idle`. A fetch
//! or auth failure sends the cycle straight back to `Idle` with nothing
//! written; per-record failures are counted and the batch carries on.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::aircraft_state::normalize_snapshot;
use crate::errors::{CycleAbortError, SourceError};
use crate::geofence::BoundingBox;
use crate::metrics as names;
use crate::opensky_client::{Snapshot, SnapshotSource};
use crate::state_store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CyclePhase {
    #[default]
    Idle,
    Fetching,
    Filtering,
    Persisting,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CyclePhase::Idle => write!(f, "idle"),
            CyclePhase::Fetching => write!(f, "fetching"),
            CyclePhase::Filtering => write!(f, "filtering"),
            CyclePhase::Persisting => write!(f, "persisting"),
        }
    }
}

/// Counts for one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub malformed: usize,
    /// Outside the geofence or without a usable position
    pub filtered: usize,
    pub upserted: usize,
    pub write_failures: usize,
    pub pruned: usize,
    pub duration: Duration,
}

/// Poll state threaded through every tick
#[derive(Debug, Clone, Default)]
pub struct CycleContext {
    pub phase: CyclePhase,
    pub cycle_count: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_report: Option<CycleReport>,
}

impl CycleContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&mut self, phase: CyclePhase) {
        debug!("cycle {}: {} -> {}", self.cycle_count, self.phase, phase);
        self.phase = phase;
    }
}

/// Fetch → normalize → filter → upsert, against any source and store.
pub struct IngestCycle<S, T> {
    source: S,
    store: T,
    geofence: BoundingBox,
    /// 0 disables pruning
    max_rows: i64,
}

impl<S, T> IngestCycle<S, T>
where
    S: SnapshotSource,
    T: StateStore,
{
    pub fn new(source: S, store: T, geofence: BoundingBox) -> Self {
        Self {
            source,
            store,
            geofence,
            max_rows: 0,
        }
    }

    /// Keep only the `max_rows` most recently updated rows after each cycle.
    pub fn with_max_rows(mut self, max_rows: i64) -> Self {
        self.max_rows = max_rows.max(0);
        self
    }

    pub fn store(&self) -> &T {
        &self.store
    }

    /// Run exactly one cycle.
    pub async fn run_cycle(
        &self,
        ctx: &mut CycleContext,
    ) -> Result<CycleReport, CycleAbortError> {
        ctx.cycle_count += 1;
        let cycle = ctx.cycle_count;
        let span = info_span!("ingest_cycle", cycle);
        let started = Instant::now();
        metrics::counter!(names::CYCLES_TOTAL).increment(1);

        let result = self.run_phases(ctx).instrument(span).await;
        ctx.enter(CyclePhase::Idle);

        match result {
            Ok(mut report) => {
                report.duration = started.elapsed();
                let now = Utc::now();
                ctx.successful_cycles += 1;
                ctx.last_success_at = Some(now);
                ctx.last_report = Some(report.clone());
                metrics::gauge!(names::LAST_SUCCESS_TIMESTAMP).set(now.timestamp() as f64);
                metrics::histogram!(names::CYCLE_DURATION_MS)
                    .record(report.duration.as_secs_f64() * 1000.0);
                Ok(report)
            }
            Err(source) => {
                ctx.failed_cycles += 1;
                metrics::counter!(names::CYCLES_FAILED_TOTAL).increment(1);
                Err(CycleAbortError { cycle, source })
            }
        }
    }

    async fn run_phases(&self, ctx: &mut CycleContext) -> Result<CycleReport, SourceError> {
        ctx.enter(CyclePhase::Fetching);
        let snapshot = self.fetch_with_reauth().await?;
        debug!(
            "Fetched {} state vectors (upstream time {:?})",
            snapshot.states.len(),
            snapshot.time
        );

        ctx.enter(CyclePhase::Filtering);
        let mut report = CycleReport {
            fetched: snapshot.states.len(),
            ..CycleReport::default()
        };
        let normalized = normalize_snapshot(&snapshot.states, Utc::now());
        report.malformed = normalized.malformed;
        let inside: Vec<_> = normalized
            .states
            .into_iter()
            .filter(|state| self.geofence.contains(state.latitude, state.longitude))
            .collect();
        report.filtered = report.fetched - report.malformed - inside.len();

        metrics::counter!(names::RECORDS_FETCHED_TOTAL).increment(report.fetched as u64);
        metrics::counter!(names::RECORDS_MALFORMED_TOTAL).increment(report.malformed as u64);
        metrics::counter!(names::RECORDS_FILTERED_TOTAL).increment(report.filtered as u64);

        ctx.enter(CyclePhase::Persisting);
        // Sequential so writes to one key land in snapshot order
        for mut state in inside {
            state.updated_at = Utc::now();
            match self.store.upsert(&state).await {
                Ok(()) => report.upserted += 1,
                Err(e) => {
                    warn!("Failed to upsert aircraft {}: {}", state.icao24, e);
                    report.write_failures += 1;
                }
            }
        }
        metrics::counter!(names::UPSERTS_TOTAL).increment(report.upserted as u64);
        metrics::counter!(names::WRITE_FAILURES_TOTAL).increment(report.write_failures as u64);

        if self.max_rows > 0 {
            match self.store.prune_to(self.max_rows).await {
                Ok(pruned) => {
                    report.pruned = pruned;
                    metrics::counter!(names::PRUNED_TOTAL).increment(pruned as u64);
                }
                Err(e) => warn!("Failed to prune aircraft states: {}", e),
            }
        }

        Ok(report)
    }

    /// Fetch once; if the token was rejected or could not be obtained,
    /// re-authenticate and fetch once more.
    async fn fetch_with_reauth(&self) -> Result<Snapshot, SourceError> {
        match self.source.fetch_snapshot(&self.geofence).await {
            Err(e) if e.needs_reauth() => {
                info!("{}, re-authenticating and retrying once", e);
                metrics::counter!(names::REAUTH_TOTAL).increment(1);
                self.source.reauthenticate().await?;
                self.source.fetch_snapshot(&self.geofence).await
            }
            other => other,
        }
    }

    /// Run cycles every `period` until `shutdown` resolves.
    ///
    /// Shutdown is only observed between cycles, so a cycle in progress always
    /// finishes its writes.
    pub async fn run<F>(&self, period: Duration, shutdown: F) -> CycleContext
    where
        F: Future<Output = ()>,
    {
        let mut ctx = CycleContext::new();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            "Starting ingest loop: every {:?}, geofence {}",
            period, self.geofence
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping ingest loop after {} cycles", ctx.cycle_count);
                    break;
                }
                _ = interval.tick() => {}
            }

            match self.run_cycle(&mut ctx).await {
                Ok(report) => info!(
                    "Cycle {}: fetched {}, upserted {}, filtered {}, malformed {}, write failures {}, pruned {} in {:?}",
                    ctx.cycle_count,
                    report.fetched,
                    report.upserted,
                    report.filtered,
                    report.malformed,
                    report.write_failures,
                    report.pruned,
                    report.duration
                ),
                Err(e) => warn!("{}{}", e, retry_hint(&e.source)),
            }
        }

        ctx
    }
}

/// Extra context for the log line of an aborted cycle.
fn retry_hint(error: &SourceError) -> String {
    match error {
        SourceError::RateLimited {
            retry_after: Some(wait),
        } => format!(" (upstream asks to wait {:?}; next attempt on schedule)", wait),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft_state::AircraftState;
    use crate::errors::StoreWriteError;
    use crate::state_store::InMemoryStateStore;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::{HashSet, VecDeque};
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn test_box() -> BoundingBox {
        BoundingBox::new(33.0, 33.8, -112.4, -111.8)
    }

    fn vector(icao24: &str, lat: Option<f64>, lon: Option<f64>) -> Value {
        json!([
            icao24, "TEST123 ", "United States", 1700000000, 1700000000, lon, lat, 1200.0,
            false, 110.0, 45.0, 1.5, null, 1250.0, "1200", false, 0
        ])
    }

    fn inside(icao24: &str) -> Value {
        vector(icao24, Some(33.4348), Some(-112.0101))
    }

    fn outside(icao24: &str) -> Value {
        vector(icao24, Some(34.0), Some(-112.0))
    }

    fn snapshot(states: Vec<Value>) -> Snapshot {
        Snapshot { time: None, states }
    }

    /// Plays back scripted fetch results, then empty snapshots.
    #[derive(Default)]
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<Snapshot, SourceError>>>,
        reauth_result: Mutex<Option<SourceError>>,
        fetches: AtomicUsize,
        reauths: AtomicUsize,
        notify_after: Option<(usize, Arc<Notify>)>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Snapshot, SourceError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch_snapshot(&self, _bbox: &BoundingBox) -> Result<Snapshot, SourceError> {
            let count = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, notify)) = &self.notify_after
                && count >= *after
            {
                notify.notify_one();
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Snapshot::default()))
        }

        async fn reauthenticate(&self) -> Result<(), SourceError> {
            self.reauths.fetch_add(1, Ordering::SeqCst);
            match self.reauth_result.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    /// Delegates to an in-memory store but rejects writes for chosen keys.
    struct FlakyStore {
        inner: InMemoryStateStore,
        reject: HashSet<String>,
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn upsert(&self, state: &AircraftState) -> Result<(), StoreWriteError> {
            if self.reject.contains(&state.icao24) {
                return Err(StoreWriteError::Pool("connection reset".to_string()));
            }
            self.inner.upsert(state).await
        }

        async fn list_all(&self) -> Result<Vec<AircraftState>, StoreWriteError> {
            self.inner.list_all().await
        }

        async fn list_recent(&self, limit: i64) -> Result<Vec<AircraftState>, StoreWriteError> {
            self.inner.list_recent(limit).await
        }

        async fn count(&self) -> Result<i64, StoreWriteError> {
            self.inner.count().await
        }

        async fn prune_to(&self, max_rows: i64) -> Result<usize, StoreWriteError> {
            self.inner.prune_to(max_rows).await
        }
    }

    #[tokio::test]
    async fn test_partial_batch_counts() {
        let mut states: Vec<Value> = (0..7).map(|i| inside(&format!("aaa00{}", i))).collect();
        states.extend((0..3).map(|i| outside(&format!("bbb00{}", i))));
        let source = ScriptedSource::new(vec![Ok(snapshot(states))]);
        let store = FlakyStore {
            inner: InMemoryStateStore::new(),
            reject: HashSet::from(["aaa003".to_string()]),
        };
        let cycle = IngestCycle::new(source, store, test_box());
        let mut ctx = CycleContext::new();

        let report = cycle.run_cycle(&mut ctx).await.unwrap();
        assert_eq!(report.fetched, 10);
        assert_eq!(report.filtered, 3);
        assert_eq!(report.write_failures, 1);
        assert_eq!(report.upserted, 6);
        assert_eq!(report.malformed, 0);
        assert_eq!(cycle.store().count().await.unwrap(), 6);
        assert!(cycle.store().inner.get("aaa003").is_none());
        assert!(cycle.store().inner.get("bbb000").is_none());
        assert_eq!(ctx.phase, CyclePhase::Idle);
        assert_eq!(ctx.successful_cycles, 1);
        assert_eq!(ctx.last_report.as_ref().map(|r| r.upserted), Some(6));
    }

    #[tokio::test]
    async fn test_failed_fetch_writes_nothing() {
        let source = ScriptedSource::new(vec![
            Ok(snapshot(vec![inside("abc123")])),
            Err(SourceError::Status {
                status: 503,
                body: "down".to_string(),
            }),
        ]);
        let cycle = IngestCycle::new(source, InMemoryStateStore::new(), test_box());
        let mut ctx = CycleContext::new();

        cycle.run_cycle(&mut ctx).await.unwrap();
        let before = cycle.store().get("abc123").unwrap();

        let err = cycle.run_cycle(&mut ctx).await.unwrap_err();
        assert_eq!(err.cycle, 2);
        assert!(matches!(err.source, SourceError::Status { status: 503, .. }));
        assert_eq!(cycle.store().count().await.unwrap(), 1);
        assert_eq!(cycle.store().get("abc123").unwrap(), before);
        assert_eq!(ctx.failed_cycles, 1);
        assert_eq!(ctx.successful_cycles, 1);
        assert_eq!(ctx.phase, CyclePhase::Idle);
    }

    #[tokio::test]
    async fn test_unauthorized_reauthenticates_and_retries_once() {
        let source = ScriptedSource::new(vec![
            Err(SourceError::Unauthorized),
            Ok(snapshot(vec![inside("abc123")])),
        ]);
        let cycle = IngestCycle::new(source, InMemoryStateStore::new(), test_box());
        let mut ctx = CycleContext::new();

        let report = cycle.run_cycle(&mut ctx).await.unwrap();
        assert_eq!(report.upserted, 1);
        assert_eq!(cycle.source.reauths.load(Ordering::SeqCst), 1);
        assert_eq!(cycle.source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_unauthorized_aborts_cycle() {
        let source = ScriptedSource::new(vec![
            Err(SourceError::Unauthorized),
            Err(SourceError::Unauthorized),
            Ok(snapshot(vec![inside("abc123")])),
        ]);
        let cycle = IngestCycle::new(source, InMemoryStateStore::new(), test_box());
        let mut ctx = CycleContext::new();

        let err = cycle.run_cycle(&mut ctx).await.unwrap_err();
        assert!(matches!(err.source, SourceError::Unauthorized));
        assert_eq!(cycle.source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(cycle.source.reauths.load(Ordering::SeqCst), 1);
        assert_eq!(cycle.store().count().await.unwrap(), 0);

        // next tick starts fresh
        let report = cycle.run_cycle(&mut ctx).await.unwrap();
        assert_eq!(report.upserted, 1);
    }

    #[tokio::test]
    async fn test_failed_initial_token_request_gets_one_retry() {
        let source = ScriptedSource::new(vec![
            Err(SourceError::Auth("token endpoint returned 503".into())),
            Ok(snapshot(vec![inside("abc123")])),
        ]);
        let cycle = IngestCycle::new(source, InMemoryStateStore::new(), test_box());

        let report = cycle.run_cycle(&mut CycleContext::new()).await.unwrap();
        assert_eq!(report.upserted, 1);
        assert_eq!(cycle.source.reauths.load(Ordering::SeqCst), 1);
        assert_eq!(cycle.source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_reauthentication_aborts_without_refetch() {
        let source = ScriptedSource::new(vec![Err(SourceError::Unauthorized)]);
        *source.reauth_result.lock().unwrap() = Some(SourceError::Auth("bad secret".into()));
        let cycle = IngestCycle::new(source, InMemoryStateStore::new(), test_box());

        let err = cycle.run_cycle(&mut CycleContext::new()).await.unwrap_err();
        assert!(matches!(err.source, SourceError::Auth(_)));
        assert_eq!(cycle.source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_and_positionless_records_never_reach_store() {
        let mut missing_id = inside("ignored");
        missing_id[0] = Value::Null;
        let states = vec![
            missing_id,
            json!(["short"]),
            vector("nolat1", None, Some(-112.0)),
            vector("nolon1", Some(33.4), None),
            inside("abc123"),
        ];
        let source = ScriptedSource::new(vec![Ok(snapshot(states))]);
        let cycle = IngestCycle::new(source, InMemoryStateStore::new(), test_box());

        let report = cycle.run_cycle(&mut CycleContext::new()).await.unwrap();
        assert_eq!(report.malformed, 2);
        assert_eq!(report.filtered, 2);
        assert_eq!(report.upserted, 1);
        assert_eq!(cycle.store().count().await.unwrap(), 1);
        assert!(cycle.store().get("abc123").is_some());
    }

    #[tokio::test]
    async fn test_repeat_sighting_updates_in_place() {
        let mut moved = inside("ABC123");
        moved[1] = json!("NEWCALL");
        let source = ScriptedSource::new(vec![
            Ok(snapshot(vec![inside("abc123")])),
            Ok(snapshot(vec![moved])),
        ]);
        let cycle = IngestCycle::new(source, InMemoryStateStore::new(), test_box());
        let mut ctx = CycleContext::new();

        cycle.run_cycle(&mut ctx).await.unwrap();
        let first = cycle.store().get("abc123").unwrap();
        cycle.run_cycle(&mut ctx).await.unwrap();
        let second = cycle.store().get("abc123").unwrap();

        assert_eq!(cycle.store().count().await.unwrap(), 1);
        assert_eq!(second.callsign.as_deref(), Some("NEWCALL"));
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn test_aircraft_leaving_geofence_is_retained() {
        let source = ScriptedSource::new(vec![
            Ok(snapshot(vec![inside("abc123")])),
            Ok(snapshot(vec![outside("abc123")])),
        ]);
        let cycle = IngestCycle::new(source, InMemoryStateStore::new(), test_box());
        let mut ctx = CycleContext::new();

        cycle.run_cycle(&mut ctx).await.unwrap();
        let report = cycle.run_cycle(&mut ctx).await.unwrap();
        assert_eq!(report.filtered, 1);
        let row = cycle.store().get("abc123").unwrap();
        assert_eq!(row.latitude, Some(33.4348));
    }

    #[tokio::test]
    async fn test_max_rows_prunes_oldest() {
        let source = ScriptedSource::new(vec![
            Ok(snapshot(vec![inside("aaa111"), inside("bbb222")])),
            Ok(snapshot(vec![inside("ccc333")])),
        ]);
        let cycle =
            IngestCycle::new(source, InMemoryStateStore::new(), test_box()).with_max_rows(2);
        let mut ctx = CycleContext::new();

        cycle.run_cycle(&mut ctx).await.unwrap();
        let report = cycle.run_cycle(&mut ctx).await.unwrap();
        assert_eq!(report.pruned, 1);
        assert_eq!(cycle.store().count().await.unwrap(), 2);
        assert!(cycle.store().get("ccc333").is_some());
    }

    #[tokio::test]
    async fn test_run_survives_failed_cycles_until_shutdown() {
        let notify = Arc::new(Notify::new());
        let mut source = ScriptedSource::new(vec![
            Ok(snapshot(vec![inside("abc123")])),
            Err(SourceError::RateLimited {
                retry_after: Some(Duration::from_secs(60)),
            }),
            Ok(snapshot(vec![inside("def456")])),
        ]);
        source.notify_after = Some((3, notify.clone()));
        let cycle = IngestCycle::new(source, InMemoryStateStore::new(), test_box());

        let shutdown = async move { notify.notified().await };
        let ctx = cycle.run(Duration::from_millis(5), shutdown).await;

        assert!(ctx.cycle_count >= 3);
        assert_eq!(ctx.failed_cycles, 1);
        assert!(ctx.last_success_at.is_some());
        assert_eq!(cycle.store().count().await.unwrap(), 2);
    }
}

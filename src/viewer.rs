//! Read-only terminal view of the latest aircraft states.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::fmt::Write as _;
use std::future::Future;
use std::io::Write as _;
use tracing::warn;

use crate::aircraft_state::AircraftState;
use crate::config::ViewerConfig;
use crate::state_store::StateStore;

/// Works well over SSH terminals
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

const UPDATED_AT_FORMAT: &str = "%b %d, %Y %I:%M %p";

pub struct Viewer<T> {
    store: T,
    config: ViewerConfig,
}

impl<T: StateStore> Viewer<T> {
    pub fn new(store: T, config: ViewerConfig) -> Self {
        Self { store, config }
    }

    /// Render one frame from the store's current contents.
    pub async fn frame(&self, now: DateTime<Utc>) -> String {
        match self.store.list_recent(self.config.limit).await {
            Ok(rows) => render_table(&rows, self.config.limit, now, self.config.timezone),
            Err(e) => {
                warn!("Failed to read aircraft states: {}", e);
                format!(
                    "Most recent aircraft (limit={})\n\nStore unavailable: {}\n",
                    self.config.limit, e
                )
            }
        }
    }

    /// Redraw every refresh interval until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.config.refresh);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => return Ok(()),
                _ = interval.tick() => {}
            }
            let frame = self.frame(Utc::now()).await;
            let mut stdout = std::io::stdout().lock();
            write!(stdout, "{}{}", CLEAR_SCREEN, frame)?;
            stdout.flush()?;
        }
    }
}

/// Format rows as a fixed-width table, most recent first.
pub fn render_table(
    rows: &[AircraftState],
    limit: i64,
    now: DateTime<Utc>,
    timezone: Tz,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Most recent aircraft (limit={})\n", limit);
    let _ = writeln!(
        out,
        "{:<7} {:<9} {:<16} {:>9} {:>10} {:>7} {:>7} {:>6} {:>5} {:>6} {:<4} {:<6} {:<21} {:>6}",
        "ICAO24",
        "CALLSIGN",
        "COUNTRY",
        "LAT",
        "LON",
        "ALT m",
        "GEO m",
        "SPD",
        "TRK",
        "V/S",
        "GND",
        "SQUAWK",
        "UPDATED",
        "AGE"
    );

    if rows.is_empty() {
        let _ = writeln!(out, "(no aircraft seen yet)");
        return out;
    }

    for row in rows {
        let _ = writeln!(
            out,
            "{:<7} {:<9} {:<16} {:>9} {:>10} {:>7} {:>7} {:>6} {:>5} {:>6} {:<4} {:<6} {:<21} {:>6}",
            row.icao24,
            text(&row.callsign),
            truncate(&text(&row.origin_country), 16),
            float(row.latitude, 4),
            float(row.longitude, 4),
            float(row.baro_altitude, 0),
            float(row.geo_altitude, 0),
            float(row.velocity, 1),
            float(row.true_track, 0),
            float(row.vertical_rate, 1),
            flag(row.on_ground),
            text(&row.squawk),
            row.updated_at
                .with_timezone(&timezone)
                .format(UPDATED_AT_FORMAT)
                .to_string(),
            age(row.age(now)),
        );
    }
    out
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "-".to_string())
}

fn float(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_else(|| "-".to_string())
}

fn flag(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "yes",
        Some(false) => "no",
        None => "-",
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Compact age like `42s`, `5m`, `3h`
fn age(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m", secs / 60),
        _ => format!("{}h", secs / 3600),
    }
}

//! Runtime configuration
//!
//! Values come from an optional TOML file overlaid by environment variables
//! (a `.env` file is loaded into the environment first). Environment wins.

use anyhow::{Context, Result, bail};
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::geofence::BoundingBox;
use crate::opensky_client::Credentials;

pub const DEFAULT_POLL_SECONDS: u64 = 30;
pub const DEFAULT_VIEW_LIMIT: i64 = 10;
pub const DEFAULT_VIEW_REFRESH_SECONDS: u64 = 5;
pub const DEFAULT_VIEW_TZ: &str = "America/Phoenix";

/// TOML file layout. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub database_url: Option<String>,
    pub poll_seconds: Option<u64>,
    pub max_rows: Option<i64>,
    pub metrics_port: Option<u16>,
    pub geofence: Option<BoundingBox>,
    #[serde(default)]
    pub opensky: OpenSkyFileConfig,
    #[serde(default)]
    pub viewer: ViewerFileConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenSkyFileConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewerFileConfig {
    pub limit: Option<i64>,
    pub refresh_seconds: Option<u64>,
    pub timezone: Option<String>,
}

impl ConfigFile {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: ConfigFile =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub limit: i64,
    pub refresh: Duration,
    /// IANA zone `updated_at` is rendered in
    pub timezone: Tz,
}

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub credentials: Option<Credentials>,
    pub geofence: BoundingBox,
    pub poll_interval: Duration,
    /// Keep only this many most recently updated rows; 0 keeps everything
    pub max_rows: i64,
    pub metrics_port: Option<u16>,
    pub viewer: ViewerConfig,
}

impl AppConfig {
    /// Load `.env`, the optional config file, then the process environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();
        let file = match config_path {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge a parsed file with an environment lookup.
    pub fn resolve(file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = env("DATABASE_URL")
            .or(file.database_url)
            .unwrap_or_else(|| pg_conninfo_from_env(&env));

        let client_id = env("OPENSKY_CLIENT_ID").or(file.opensky.client_id);
        let client_secret = env("OPENSKY_CLIENT_SECRET").or(file.opensky.client_secret);
        let credentials = match (client_id, client_secret) {
            (Some(client_id), Some(client_secret)) => Some(Credentials {
                client_id,
                client_secret,
            }),
            (None, None) => None,
            _ => bail!("OPENSKY_CLIENT_ID and OPENSKY_CLIENT_SECRET must be set together"),
        };

        let base = file.geofence.unwrap_or_default();
        let geofence = BoundingBox {
            min_lat: parse_env(&env, "GEOFENCE_LAMIN")?.unwrap_or(base.min_lat),
            max_lat: parse_env(&env, "GEOFENCE_LAMAX")?.unwrap_or(base.max_lat),
            min_lon: parse_env(&env, "GEOFENCE_LOMIN")?.unwrap_or(base.min_lon),
            max_lon: parse_env(&env, "GEOFENCE_LOMAX")?.unwrap_or(base.max_lon),
        };
        geofence.validate()?;

        let poll_seconds = parse_env(&env, "POLL_SECONDS")?
            .or(file.poll_seconds)
            .unwrap_or(DEFAULT_POLL_SECONDS);
        if poll_seconds == 0 {
            bail!("POLL_SECONDS must be greater than zero");
        }

        let max_rows = parse_env(&env, "MAX_ROWS")?.or(file.max_rows).unwrap_or(0);
        if max_rows < 0 {
            bail!("MAX_ROWS must not be negative, got {}", max_rows);
        }

        let metrics_port = parse_env(&env, "METRICS_PORT")?.or(file.metrics_port);

        let limit = parse_env(&env, "VIEW_LIMIT")?
            .or(file.viewer.limit)
            .unwrap_or(DEFAULT_VIEW_LIMIT);
        if limit <= 0 {
            bail!("VIEW_LIMIT must be greater than zero, got {}", limit);
        }
        let refresh_seconds = parse_env(&env, "VIEW_REFRESH")?
            .or(file.viewer.refresh_seconds)
            .unwrap_or(DEFAULT_VIEW_REFRESH_SECONDS);
        if refresh_seconds == 0 {
            bail!("VIEW_REFRESH must be greater than zero");
        }
        let timezone = env("VIEW_TZ")
            .or(file.viewer.timezone)
            .unwrap_or_else(|| DEFAULT_VIEW_TZ.to_string());

        Ok(Self {
            database_url,
            credentials,
            geofence,
            poll_interval: Duration::from_secs(poll_seconds),
            max_rows,
            metrics_port,
            viewer: ViewerConfig {
                limit,
                refresh: Duration::from_secs(refresh_seconds),
                timezone: parse_timezone(&timezone)?,
            },
        })
    }
}

fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", key, raw, e)),
        _ => Ok(None),
    }
}

fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|e| anyhow::anyhow!("Invalid VIEW_TZ {:?}: {}", name, e))
}

/// libpq key/value connection string built from the standard PG* variables.
fn pg_conninfo_from_env(env: &impl Fn(&str) -> Option<String>) -> String {
    let params = [
        ("host", env("PGHOST").unwrap_or_else(|| "localhost".to_string())),
        ("port", env("PGPORT").unwrap_or_else(|| "5432".to_string())),
        ("dbname", env("PGDATABASE").unwrap_or_else(|| "flightlogs".to_string())),
        ("user", env("PGUSER").unwrap_or_else(|| "flightview".to_string())),
        ("password", env("PGPASSWORD").unwrap_or_else(|| "flightview".to_string())),
    ];
    params
        .iter()
        .map(|(key, value)| format!("{}={}", key, quote_conninfo(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_conninfo(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

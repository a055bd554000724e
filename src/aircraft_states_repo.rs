use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Timestamptz};
use diesel::upsert::excluded;
use tracing::debug;

use crate::aircraft_state::AircraftState;
use crate::db::{PgPool, PgPooledConnection};
use crate::errors::StoreWriteError;
use crate::schema::aircraft_states;
use crate::state_store::StateStore;

/// Keeps the stored clock from moving backwards when a write carries an
/// older `updated_at` than the row it replaces.
const MONOTONIC_UPDATED_AT: &str = "GREATEST(aircraft_states.updated_at, EXCLUDED.updated_at)";

const PRUNE_SQL: &str = "DELETE FROM aircraft_states \
     WHERE icao24 IN ( \
       SELECT icao24 FROM aircraft_states \
       ORDER BY updated_at DESC, icao24 ASC \
       OFFSET $1 \
     )";

/// PostgreSQL-backed [`StateStore`].
///
/// Each upsert is a single `INSERT ... ON CONFLICT DO UPDATE`, so Postgres
/// row locking serializes writers to the same `icao24` and leaves other keys
/// alone.
#[derive(Clone)]
pub struct AircraftStatesRepository {
    pool: PgPool,
}

impl AircraftStatesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn get_connection(pool: &PgPool) -> Result<PgPooledConnection, StoreWriteError> {
        pool.get()
            .map_err(|e| StoreWriteError::Pool(e.to_string()))
    }

    /// Run a blocking diesel closure on the blocking thread pool.
    async fn with_connection<T, F>(&self, f: F) -> Result<T, StoreWriteError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, StoreWriteError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::get_connection(&pool)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreWriteError::Task(e.to_string()))?
    }

    /// Look up a single aircraft
    pub async fn get(&self, icao24: &str) -> Result<Option<AircraftState>, StoreWriteError> {
        let key = icao24.to_string();
        self.with_connection(move |conn| {
            let row = aircraft_states::table
                .find(key)
                .select(AircraftState::as_select())
                .first(conn)
                .optional()?;
            Ok(row)
        })
        .await
    }
}

#[async_trait]
impl StateStore for AircraftStatesRepository {
    async fn upsert(&self, state: &AircraftState) -> Result<(), StoreWriteError> {
        let state = state.clone();
        self.with_connection(move |conn| {
            diesel::insert_into(aircraft_states::table)
                .values(&state)
                .on_conflict(aircraft_states::icao24)
                .do_update()
                .set((
                    aircraft_states::callsign.eq(excluded(aircraft_states::callsign)),
                    aircraft_states::origin_country.eq(excluded(aircraft_states::origin_country)),
                    aircraft_states::longitude.eq(excluded(aircraft_states::longitude)),
                    aircraft_states::latitude.eq(excluded(aircraft_states::latitude)),
                    aircraft_states::baro_altitude.eq(excluded(aircraft_states::baro_altitude)),
                    aircraft_states::on_ground.eq(excluded(aircraft_states::on_ground)),
                    aircraft_states::velocity.eq(excluded(aircraft_states::velocity)),
                    aircraft_states::true_track.eq(excluded(aircraft_states::true_track)),
                    aircraft_states::vertical_rate.eq(excluded(aircraft_states::vertical_rate)),
                    aircraft_states::geo_altitude.eq(excluded(aircraft_states::geo_altitude)),
                    aircraft_states::squawk.eq(excluded(aircraft_states::squawk)),
                    aircraft_states::spi.eq(excluded(aircraft_states::spi)),
                    aircraft_states::updated_at
                        .eq(diesel::dsl::sql::<Timestamptz>(MONOTONIC_UPDATED_AT)),
                ))
                .execute(conn)?;
            debug!("Upserted aircraft state {}", state.icao24);
            Ok(())
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<AircraftState>, StoreWriteError> {
        self.with_connection(|conn| {
            let rows = aircraft_states::table
                .order((
                    aircraft_states::updated_at.desc(),
                    aircraft_states::icao24.asc(),
                ))
                .select(AircraftState::as_select())
                .load(conn)?;
            Ok(rows)
        })
        .await
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<AircraftState>, StoreWriteError> {
        let limit = limit.max(0);
        self.with_connection(move |conn| {
            let rows = aircraft_states::table
                .order((
                    aircraft_states::updated_at.desc(),
                    aircraft_states::icao24.asc(),
                ))
                .limit(limit)
                .select(AircraftState::as_select())
                .load(conn)?;
            Ok(rows)
        })
        .await
    }

    async fn count(&self) -> Result<i64, StoreWriteError> {
        self.with_connection(|conn| {
            let count = aircraft_states::table.count().get_result::<i64>(conn)?;
            Ok(count)
        })
        .await
    }

    async fn prune_to(&self, max_rows: i64) -> Result<usize, StoreWriteError> {
        let max_rows = max_rows.max(0);
        self.with_connection(move |conn| {
            let deleted = diesel::sql_query(PRUNE_SQL)
                .bind::<BigInt, _>(max_rows)
                .execute(conn)?;
            Ok(deleted)
        })
        .await
    }
}

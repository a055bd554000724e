//! Latest-state store contract
//!
//! The ingest cycle is the only writer. Readers (the viewer) only ever call
//! the list methods.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::aircraft_state::AircraftState;
use crate::errors::StoreWriteError;

/// Keyed table of the latest state per `icao24`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert the state, or replace every field of the existing row for the
    /// same `icao24`. Atomic per key. The stored `updated_at` never moves
    /// backwards: a write carrying an older clock keeps the newer timestamp.
    async fn upsert(&self, state: &AircraftState) -> Result<(), StoreWriteError>;

    /// Every row, most recently updated first.
    async fn list_all(&self) -> Result<Vec<AircraftState>, StoreWriteError>;

    /// The `limit` most recently updated rows.
    async fn list_recent(&self, limit: i64) -> Result<Vec<AircraftState>, StoreWriteError>;

    async fn count(&self) -> Result<i64, StoreWriteError>;

    /// Delete all but the `max_rows` most recently updated rows.
    /// Returns how many rows were removed.
    async fn prune_to(&self, max_rows: i64) -> Result<usize, StoreWriteError>;
}

/// In-process store backed by a sharded concurrent map.
///
/// Writers to different keys land on different shards; the entry API holds
/// the shard lock for the whole replace, so a reader never sees a torn row.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: DashMap<String, AircraftState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, icao24: &str) -> Option<AircraftState> {
        self.states.get(icao24).map(|entry| entry.value().clone())
    }

    fn sorted_by_recency(&self) -> Vec<AircraftState> {
        let mut rows: Vec<AircraftState> = self
            .states
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.icao24.cmp(&b.icao24))
        });
        rows
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn upsert(&self, state: &AircraftState) -> Result<(), StoreWriteError> {
        match self.states.entry(state.icao24.clone()) {
            Entry::Occupied(mut occupied) => {
                let updated_at = occupied.get().updated_at.max(state.updated_at);
                let row = occupied.get_mut();
                *row = state.clone();
                row.updated_at = updated_at;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(state.clone());
            }
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<AircraftState>, StoreWriteError> {
        Ok(self.sorted_by_recency())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<AircraftState>, StoreWriteError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut rows = self.sorted_by_recency();
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count(&self) -> Result<i64, StoreWriteError> {
        Ok(self.states.len() as i64)
    }

    async fn prune_to(&self, max_rows: i64) -> Result<usize, StoreWriteError> {
        let keep = usize::try_from(max_rows).unwrap_or(0);
        let doomed: Vec<String> = self
            .sorted_by_recency()
            .into_iter()
            .skip(keep)
            .map(|row| row.icao24)
            .collect();
        for icao24 in &doomed {
            self.states.remove(icao24);
        }
        Ok(doomed.len())
    }
}

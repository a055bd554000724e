//! flightview - keeps the latest OpenSky state of every aircraft inside a
//! geofence in PostgreSQL, and renders it for terminal sessions.

pub mod aircraft_state;
pub mod aircraft_states_repo;
pub mod config;
pub mod db;
pub mod errors;
pub mod geofence;
pub mod ingest;
pub mod instance_lock;
pub mod logging;
pub mod metrics;
pub mod opensky_client;
pub mod schema;
pub mod state_store;
pub mod viewer;

pub use aircraft_state::AircraftState;
pub use geofence::BoundingBox;
pub use ingest::{CycleContext, CycleReport, IngestCycle};
pub use state_store::{InMemoryStateStore, StateStore};

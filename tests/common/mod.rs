//! Helpers for database-backed integration tests
//!
//! Each `TestDatabase` is a freshly created PostgreSQL database with the
//! migrations applied, dropped again when the value goes out of scope.
//! Tests using it are `#[ignore]`d by default; run them with a server
//! available:
//!
//! ```bash
//! TEST_DATABASE_URL=postgresql://localhost/flightview_test cargo test -- --ignored
//! ```

use anyhow::{Context, Result};
use diesel::prelude::*;
use flightview::db::{self, PgPool};
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

pub struct TestDatabase {
    db_name: String,
    pool: PgPool,
    admin_url: String,
}

impl TestDatabase {
    pub async fn new() -> Result<Self> {
        dotenvy::dotenv().ok();
        let base_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/flightview_test".to_string());
        let (admin_url, db_name) = database_info(&base_url);
        let test_url = replace_database(&base_url, &db_name);

        let create_admin_url = admin_url.clone();
        let create_name = db_name.clone();
        let pool = tokio::task::spawn_blocking(move || -> Result<PgPool> {
            let mut conn = PgConnection::establish(&create_admin_url).context(
                "Failed to connect to PostgreSQL for database creation. Is PostgreSQL running?",
            )?;
            // db_name is generated from digits and underscores only
            diesel::sql_query(format!("CREATE DATABASE \"{}\"", create_name))
                .execute(&mut conn)
                .with_context(|| format!("Failed to create database {}", create_name))?;

            let pool = db::create_pool(&test_url, 10);
            db::run_migrations(&pool)?;
            Ok(pool)
        })
        .await
        .context("Database creation task panicked")??;

        Ok(Self {
            db_name,
            pool,
            admin_url,
        })
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        // PostgreSQL 13+ for WITH (FORCE)
        let drop_sql = format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.db_name);
        let dropped = PgConnection::establish(&self.admin_url)
            .ok()
            .and_then(|mut conn| diesel::sql_query(&drop_sql).execute(&mut conn).ok());
        if dropped.is_none() {
            eprintln!(
                "Warning: failed to drop test database '{}'; drop it manually",
                self.db_name
            );
        }
    }
}

/// (admin url on the `postgres` database, unique test database name)
fn database_info(base_url: &str) -> (String, String) {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let db_name = format!(
        "flightview_test_{}_{}_{}",
        std::process::id(),
        NEXT_ID.fetch_add(1, Ordering::SeqCst),
        nanos
    );
    (replace_database(base_url, "postgres"), db_name)
}

/// Swap the trailing database name of a `postgresql://.../<db>` URL
fn replace_database(base_url: &str, db_name: &str) -> String {
    let (without_query, query) = match base_url.split_once('?') {
        Some((url, query)) => (url, Some(query)),
        None => (base_url, None),
    };
    let prefix = match without_query.rsplit_once('/') {
        Some((prefix, _)) => prefix,
        None => without_query,
    };
    match query {
        Some(query) => format!("{}/{}?{}", prefix, db_name, query),
        None => format!("{}/{}", prefix, db_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_database() {
        assert_eq!(
            replace_database("postgresql://u:p@localhost:5432/flightview_test", "postgres"),
            "postgresql://u:p@localhost:5432/postgres"
        );
        assert_eq!(
            replace_database("postgresql://localhost/flightview_test?sslmode=disable", "x"),
            "postgresql://localhost/x?sslmode=disable"
        );
    }

    #[test]
    fn test_database_names_are_unique() {
        let (_, a) = database_info("postgresql://localhost/flightview_test");
        let (_, b) = database_info("postgresql://localhost/flightview_test");
        assert_ne!(a, b);
        assert!(a.starts_with("flightview_test_"));
    }
}

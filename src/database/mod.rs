pub mod identity;
pub mod models;
pub mod queries;
pub mod schema;
pub mod sync_state;
pub mod upsert;

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::SyncError;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `database_url` and apply the schema.
    pub async fn new(database_url: &str) -> Result<Self, SyncError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Database { pool };
        db.run_migrations().await?;
        info!("Database ready at {}", database_url);
        Ok(db)
    }

    /// Private in-memory database; a single connection keeps every caller on the same store.
    pub async fn new_in_memory() -> Result<Self, SyncError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Database { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<(), SyncError> {
        for (name, sql) in schema::MIGRATIONS {
            debug!(migration = name, "Applying schema");
            sqlx::raw_sql(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Stored timestamp format; fixed width so text comparison is chronological.
pub fn to_db_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn opt_db_time(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(to_db_time)
}

pub fn from_db_time(value: &str) -> Result<DateTime<Utc>, SyncError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::invalid_timestamp(value, e))
}

pub fn opt_from_db_time(value: Option<String>) -> Result<Option<DateTime<Utc>>, SyncError> {
    value.as_deref().map(from_db_time).transpose()
}

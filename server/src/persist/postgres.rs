//! Postgres sink: one row per accepted reading
//!
//! Expects a table shaped like
//! ```text
//! device VARCHAR, ip VARCHAR, lux FLOAT, nh3 FLOAT, hs FLOAT, h FLOAT, t FLOAT, time TIMESTAMP
//! ```
//! The table is owned by the surrounding tooling; this sink only appends.

use super::{PersistError, ReadingSink};
use crate::config::{is_sql_identifier, DatabaseConfig};
use airsense_shared::Reading;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Appends readings through a pooled Postgres connection
pub struct PgSink {
    pool: PgPool,
    insert_sql: String,
}

impl PgSink {
    /// Build a pool that connects on first use, so the server can start
    /// while the database is still unreachable
    pub fn connect_lazy(url: &str, config: &DatabaseConfig) -> Result<Self, PersistError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.persist_timeout())
            .connect_lazy(url)?;

        Self::with_pool(pool, &config.table)
    }

    /// Use an existing pool, appending to `table`
    pub fn with_pool(pool: PgPool, table: &str) -> Result<Self, PersistError> {
        if !is_sql_identifier(table) {
            return Err(PersistError::Database(format!(
                "{table:?} is not a plain table name"
            )));
        }

        Ok(Self {
            pool,
            insert_sql: insert_statement(table),
        })
    }
}

fn insert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {table} (device, ip, lux, nh3, hs, h, t, time) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
    )
}

#[async_trait]
impl ReadingSink for PgSink {
    async fn persist(&self, reading: &Reading) -> Result<(), PersistError> {
        let m = &reading.measurements;

        sqlx::query(&self.insert_sql)
            .bind(reading.device.as_str())
            .bind(reading.ip.as_str())
            .bind(m.lux)
            .bind(m.nh3)
            .bind(m.hs)
            .bind(m.h)
            .bind(m.t)
            .bind(reading.received_at.naive_utc())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

impl From<sqlx::Error> for PersistError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.constraint().is_some() => {
                PersistError::Constraint(e.to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => PersistError::Connection(e.to_string()),
            sqlx::Error::Decode(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::TypeNotFound { .. } => PersistError::Serialization(e.to_string()),
            _ => PersistError::Database(e.to_string()),
        }
    }
}

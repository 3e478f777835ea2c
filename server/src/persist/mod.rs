//! Durable delivery of accepted readings
//!
//! This module handles:
//! - The `ReadingSink` abstraction over the external database
//! - Bounding each write with a timeout
//! - Handing failed writes to a background retry queue
//!
//! Persistence is best-effort relative to the in-memory store: a failed write
//! is logged and retried, never rolled back and never reported to the sensor.

mod postgres;
mod retry;

pub use postgres::PgSink;
pub use retry::{retry_queue, PendingWrite, RetryPolicy, RetryQueue, RetryReport, RetryWorker};

use airsense_shared::Reading;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Why a durable write failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistError {
    #[error("Database connection failed: {0}")]
    Connection(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Database(String),
}

/// Append-only destination for accepted readings
///
/// Implementations must tolerate concurrent calls from many handlers.
#[async_trait]
pub trait ReadingSink: Send + Sync {
    /// Append one reading
    async fn persist(&self, reading: &Reading) -> Result<(), PersistError>;

    /// Human-readable name for this sink
    fn name(&self) -> &'static str;
}

/// Sink used when no database is configured: readings stay in memory only
pub struct NullSink;

#[async_trait]
impl ReadingSink for NullSink {
    async fn persist(&self, reading: &Reading) -> Result<(), PersistError> {
        trace!("No database configured, not persisting {}", reading.device);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Run one write against `sink`, giving up after `timeout`
pub async fn persist_with_timeout(
    sink: &dyn ReadingSink,
    reading: &Reading,
    timeout: Duration,
) -> Result<(), PersistError> {
    match tokio::time::timeout(timeout, sink.persist(reading)).await {
        Ok(result) => result,
        Err(_) => Err(PersistError::Timeout(timeout)),
    }
}

/// Delivers committed readings to a sink, queueing failures for retry
#[derive(Clone)]
pub struct Delivery {
    sink: Arc<dyn ReadingSink>,
    timeout: Duration,
    retry: Option<RetryQueue>,
}

impl Delivery {
    /// Deliver straight to `sink`; failures are logged and dropped
    pub fn new(sink: Arc<dyn ReadingSink>, timeout: Duration) -> Self {
        Self {
            sink,
            timeout,
            retry: None,
        }
    }

    /// Queue failed writes on `retry`
    pub fn with_retry(mut self, retry: RetryQueue) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn sink_name(&self) -> &'static str {
        self.sink.name()
    }

    /// Attempt one write; on failure hand the reading to the retry queue
    pub async fn deliver(&self, reading: Arc<Reading>) -> Result<(), PersistError> {
        match persist_with_timeout(self.sink.as_ref(), &reading, self.timeout).await {
            Ok(()) => {
                debug!(
                    "Persisted reading from {} to {}",
                    reading.device,
                    self.sink.name()
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Failed to persist reading from {} ({}): {}",
                    reading.device, reading.received_at, e
                );
                if let Some(retry) = &self.retry {
                    retry.enqueue(reading, e.clone());
                }
                Err(e)
            }
        }
    }
}

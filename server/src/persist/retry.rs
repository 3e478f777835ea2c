//! Background retry of failed durable writes

use super::{persist_with_timeout, PersistError, ReadingSink};
use airsense_shared::Reading;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// A write that failed and is waiting for another attempt
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub reading: Arc<Reading>,
    /// Attempts made so far, including the one that first failed
    pub attempts: u32,
    pub last_error: PersistError,
}

impl PendingWrite {
    /// Check if this write may be attempted again
    pub fn can_retry(&self, max_attempts: u32) -> bool {
        self.attempts < max_attempts
    }
}

/// How the retry worker paces and bounds its attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Time between retry rounds
    pub interval: Duration,
    /// Total attempts per reading before it is abandoned
    pub max_attempts: u32,
    /// Bound on each individual attempt
    pub timeout: Duration,
    /// Writes that may wait in the queue
    pub capacity: usize,
}

/// Totals reported by the worker once its queue is closed and drained
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub delivered: u64,
    pub abandoned: u64,
}

/// Handle for queueing failed writes
#[derive(Clone)]
pub struct RetryQueue {
    tx: mpsc::Sender<PendingWrite>,
}

impl RetryQueue {
    /// Queue a reading whose first write failed with `error`
    ///
    /// Never waits: when the queue is full the reading is dropped and logged.
    pub fn enqueue(&self, reading: Arc<Reading>, error: PersistError) -> bool {
        let write = PendingWrite {
            reading,
            attempts: 1,
            last_error: error,
        };

        match self.tx.try_send(write) {
            Ok(()) => true,
            Err(TrySendError::Full(write)) => {
                error!(
                    "Retry queue full, dropping reading from {} at {}",
                    write.reading.device, write.reading.received_at
                );
                false
            }
            Err(TrySendError::Closed(write)) => {
                error!(
                    "Retry worker stopped, dropping reading from {} at {}",
                    write.reading.device, write.reading.received_at
                );
                false
            }
        }
    }
}

/// Create a retry queue and the worker that drains it
///
/// The worker does nothing until spawned: `tokio::spawn(worker.run())`.
pub fn retry_queue(sink: Arc<dyn ReadingSink>, policy: RetryPolicy) -> (RetryQueue, RetryWorker) {
    let (tx, rx) = mpsc::channel(policy.capacity.max(1));

    let worker = RetryWorker {
        sink,
        rx,
        pending: VecDeque::new(),
        policy,
        report: RetryReport::default(),
    };

    (RetryQueue { tx }, worker)
}

/// Re-attempts failed writes on a fixed interval
pub struct RetryWorker {
    sink: Arc<dyn ReadingSink>,
    rx: mpsc::Receiver<PendingWrite>,
    pending: VecDeque<PendingWrite>,
    policy: RetryPolicy,
    report: RetryReport,
}

impl RetryWorker {
    /// Run until every queue handle is dropped and nothing is left pending
    pub async fn run(mut self) -> RetryReport {
        let mut ticker = interval(self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let mut open = true;

        loop {
            tokio::select! {
                received = self.rx.recv(), if open => match received {
                    Some(write) => self.pending.push_back(write),
                    None => open = false,
                },
                _ = ticker.tick() => self.retry_pending().await,
            }

            if !open && self.pending.is_empty() {
                break;
            }
        }

        info!(
            "Retry worker finished: {} delivered, {} abandoned",
            self.report.delivered, self.report.abandoned
        );
        self.report
    }

    /// Give every pending write one more attempt
    async fn retry_pending(&mut self) {
        for _ in 0..self.pending.len() {
            let Some(mut write) = self.pending.pop_front() else {
                break;
            };

            if !write.can_retry(self.policy.max_attempts) {
                self.report.abandoned += 1;
                error!(
                    "Giving up on reading from {} at {} after {} attempts: {}",
                    write.reading.device,
                    write.reading.received_at,
                    write.attempts,
                    write.last_error
                );
                continue;
            }

            write.attempts += 1;

            match persist_with_timeout(self.sink.as_ref(), &write.reading, self.policy.timeout)
                .await
            {
                Ok(()) => {
                    self.report.delivered += 1;
                    info!(
                        "Persisted reading from {} on attempt {}",
                        write.reading.device, write.attempts
                    );
                }
                Err(e) => {
                    warn!(
                        "Retry {}/{} for {} failed: {}",
                        write.attempts, self.policy.max_attempts, write.reading.device, e
                    );
                    write.last_error = e;
                    self.pending.push_back(write);
                }
            }
        }
    }
}

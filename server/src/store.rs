//! In-memory readings store shared by every connection handler
//!
//! Holds the full history of accepted readings (in commit order) plus the
//! latest reading per device. All operations go through one `RwLock`, so a
//! reader sees either none or all of an append.

use airsense_shared::Reading;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Result of committing a reading
#[derive(Debug, Clone, PartialEq)]
pub enum Commit {
    /// Added to history and to the latest-by-device view
    Appended(Arc<Reading>),
    /// Same report as the device's latest reading within the dedup window;
    /// carries the reading already stored
    Duplicate(Arc<Reading>),
}

impl Commit {
    pub fn reading(&self) -> &Arc<Reading> {
        match self {
            Commit::Appended(r) | Commit::Duplicate(r) => r,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Commit::Duplicate(_))
    }
}

/// Accumulates all readings received since process start
pub struct ReadingsStore {
    inner: RwLock<StoreInner>,
    dedup_window: Option<Duration>,
}

#[derive(Default)]
struct StoreInner {
    /// Ordered by `received_at` (commit order)
    history: Vec<Arc<Reading>>,
    /// device -> most recent reading
    latest: HashMap<String, Arc<Reading>>,
}

impl ReadingsStore {
    /// Create an empty store that keeps every reading
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            dedup_window: None,
        }
    }

    /// Create an empty store that drops repeated reports within `window`
    pub fn with_dedup_window(window: Duration) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            dedup_window: Some(window),
        }
    }

    /// Commit a reading
    ///
    /// `received_at` is raised to the last committed time if a concurrent
    /// handler committed a later-stamped reading first, keeping history sorted.
    pub async fn append(&self, mut reading: Reading) -> Commit {
        let mut inner = self.inner.write().await;

        if let Some(last) = inner.history.last() {
            if reading.received_at < last.received_at {
                debug!(
                    "Clamping receive time of {} from {} to {}",
                    reading.device, reading.received_at, last.received_at
                );
                reading.received_at = last.received_at;
            }
        }

        if let Some(window) = self.dedup_window {
            if let Some(previous) = inner.latest.get(&reading.device) {
                let within_window = (reading.received_at - previous.received_at)
                    .to_std()
                    .map(|age| age <= window)
                    .unwrap_or(false);

                if within_window && previous.same_report(&reading) {
                    return Commit::Duplicate(previous.clone());
                }
            }
        }

        let reading = Arc::new(reading);
        inner.history.push(reading.clone());
        inner
            .latest
            .insert(reading.device.clone(), reading.clone());

        Commit::Appended(reading)
    }

    /// Most recent reading of every device
    pub async fn latest_by_device(&self) -> BTreeMap<String, Reading> {
        let inner = self.inner.read().await;
        inner
            .latest
            .iter()
            .map(|(device, reading)| (device.clone(), Reading::clone(reading)))
            .collect()
    }

    /// Most recent reading of one device
    pub async fn latest(&self, device: &str) -> Option<Reading> {
        let inner = self.inner.read().await;
        inner.latest.get(device).map(|r| Reading::clone(r))
    }

    /// Readings received in `[since, until)`, oldest first; `None` leaves a bound open
    pub async fn history(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<Reading> {
        let inner = self.inner.read().await;
        window(&inner.history, since, until)
            .iter()
            .map(|r| Reading::clone(r))
            .collect()
    }

    /// Like [`history`](Self::history), restricted to one device
    pub async fn history_for(
        &self,
        device: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<Reading> {
        let inner = self.inner.read().await;
        window(&inner.history, since, until)
            .iter()
            .filter(|r| r.device == device)
            .map(|r| Reading::clone(r))
            .collect()
    }

    /// Number of readings committed so far
    pub async fn len(&self) -> usize {
        self.inner.read().await.history.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.history.is_empty()
    }

    /// Number of distinct devices seen so far
    pub async fn device_count(&self) -> usize {
        self.inner.read().await.latest.len()
    }
}

impl Default for ReadingsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn window(
    history: &[Arc<Reading>],
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> &[Arc<Reading>] {
    let start = since.map_or(0, |since| {
        history.partition_point(|r| r.received_at < since)
    });
    let end = until.map_or(history.len(), |until| {
        history.partition_point(|r| r.received_at < until)
    });

    if start >= end {
        &[]
    } else {
        &history[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airsense_shared::Measurements;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 17, 20, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
    }

    fn reading(device: &str, t: f64, seconds: i64) -> Reading {
        Reading::new(
            device,
            "192.168.1.100",
            Measurements {
                lux: 150.0,
                nh3: 10.0,
                hs: 90.0,
                h: 70.0,
                t,
            },
            at(seconds),
        )
    }

    #[tokio::test]
    async fn test_latest_by_device_keeps_newest() {
        let store = ReadingsStore::new();

        store.append(reading("A", 21.0, 1)).await;
        store.append(reading("A", 22.0, 2)).await;
        store.append(reading("B", 30.0, 3)).await;

        let latest = store.latest_by_device().await;
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["A"].measurements.t, 22.0);
        assert_eq!(latest["A"].received_at, at(2));
        assert_eq!(latest["B"].measurements.t, 30.0);

        assert_eq!(store.len().await, 3);
        assert_eq!(store.device_count().await, 2);
        assert!(store.latest("C").await.is_none());
    }

    #[tokio::test]
    async fn test_history_is_ordered_and_half_open() {
        let store = ReadingsStore::new();
        for s in 0..10 {
            store.append(reading("A", s as f64, s)).await;
        }

        let all = store.history(None, None).await;
        assert_eq!(all.len(), 10);
        assert!(all.windows(2).all(|w| w[0].received_at <= w[1].received_at));

        let middle = store.history(Some(at(3)), Some(at(6))).await;
        let seconds: Vec<f64> = middle.iter().map(|r| r.measurements.t).collect();
        assert_eq!(seconds, vec![3.0, 4.0, 5.0]);

        assert_eq!(store.history(Some(at(8)), None).await.len(), 2);
        assert_eq!(store.history(None, Some(at(2))).await.len(), 2);
        assert!(store.history(Some(at(6)), Some(at(3))).await.is_empty());
    }

    #[tokio::test]
    async fn test_history_for_filters_device() {
        let store = ReadingsStore::new();
        store.append(reading("A", 1.0, 1)).await;
        store.append(reading("B", 2.0, 2)).await;
        store.append(reading("A", 3.0, 3)).await;

        let a = store.history_for("A", None, None).await;
        assert_eq!(a.len(), 2);
        assert!(a.iter().all(|r| r.device == "A"));
    }

    #[tokio::test]
    async fn test_out_of_order_stamp_is_clamped() {
        let store = ReadingsStore::new();
        store.append(reading("A", 1.0, 10)).await;

        // Stamped earlier by a handler that lost the race to the lock
        let commit = store.append(reading("B", 2.0, 5)).await;
        assert_eq!(commit.reading().received_at, at(10));

        let history = store.history(None, None).await;
        assert_eq!(history[1].device, "B");
        assert!(history[0].received_at <= history[1].received_at);
    }

    #[tokio::test]
    async fn test_dedup_window_drops_repeats() {
        let store = ReadingsStore::with_dedup_window(Duration::from_secs(30));

        assert!(!store.append(reading("A", 25.0, 0)).await.is_duplicate());
        let repeat = store.append(reading("A", 25.0, 20)).await;
        assert!(repeat.is_duplicate());
        assert_eq!(repeat.reading().received_at, at(0));

        // Different values, or outside the window, are new reports
        assert!(!store.append(reading("A", 26.0, 21)).await.is_duplicate());
        assert!(!store.append(reading("A", 26.0, 60)).await.is_duplicate());
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_without_dedup_every_append_lands() {
        let store = ReadingsStore::new();
        store.append(reading("A", 25.0, 0)).await;
        let repeat = store.append(reading("A", 25.0, 0)).await;
        assert!(!repeat.is_duplicate());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_appends_lose_nothing() {
        let store = Arc::new(ReadingsStore::new());

        let tasks = (0..100).map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .append(reading(&format!("sensor-{i}"), i as f64, 0))
                    .await;
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.expect("append task panicked");
        }

        assert_eq!(store.len().await, 100);
        let latest = store.latest_by_device().await;
        assert_eq!(latest.len(), 100);
        for i in 0..100 {
            assert_eq!(latest[&format!("sensor-{i}")].measurements.t, i as f64);
        }
    }
}

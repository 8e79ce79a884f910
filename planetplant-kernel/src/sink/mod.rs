/**
 * SINK D'ÉVÉNEMENTS - Contrat étroit vers le stockage des relevés/arrosages
 *
 * RÔLE :
 * Le noyau ne connaît pas le moteur de stockage (time-series, SQL...). Il
 * n'exige que trois opérations : écrire un relevé, écrire un événement
 * d'arrosage, relire les relevés récents d'un capteur. Plus une sonde
 * aller-retour pour le tableau de santé.
 *
 * FONCTIONNEMENT :
 * - `EventSink` = trait implémenté par chaque backend (memory, jsonl)
 * - `SinkHandle` = enveloppe best-effort partagée par ingest/moteur :
 *   écritures mises en file (bornée) et vidées dans l'ordre par un seul
 *   écrivain, chaque écriture bornée dans le temps; échecs loggés + comptés,
 *   jamais propagés à l'appelant
 * - File pleine -> écriture abandonnée et comptée (`dropped`)
 */

pub mod jsonl;
pub mod memory;

use crate::models::{IrrigationEvent, Reading};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub use jsonl::JsonlSink;
pub use memory::MemorySink;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// Description du backend (exposée par /system/health)
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SinkInfo {
    pub name: String,
    pub description: String,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn write_reading(&self, device_id: &str, reading: &Reading) -> Result<(), SinkError>;

    async fn write_irrigation_event(&self, event: &IrrigationEvent) -> Result<(), SinkError>;

    /// Relevés du capteur observés dans la fenêtre `window` précédant maintenant
    async fn query_recent(&self, device_id: &str, window: time::Duration) -> Result<Vec<Reading>, SinkError>;

    /// Aller-retour trivial (sonde de santé)
    async fn ping(&self) -> Result<(), SinkError>;

    fn info(&self) -> SinkInfo;
}

/// Résultat d'une sonde de connectivité stockage
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StorageCheck {
    pub reachable: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SinkCounters {
    pub writes_ok: u64,
    pub writes_failed: u64,
    /// Écritures abandonnées faute de place dans la file
    pub dropped: u64,
}

#[derive(Default)]
struct SinkStats {
    writes_ok: AtomicU64,
    writes_failed: AtomicU64,
    dropped: AtomicU64,
}

impl SinkStats {
    fn count(&self, what: &str, result: &Result<(), SinkError>) {
        match result {
            Ok(()) => {
                self.writes_ok.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.writes_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "[sink] {what} failed");
            }
        }
    }
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 1_024;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

enum PendingWrite {
    Reading { device_id: String, reading: Reading },
    Event(IrrigationEvent),
}

/// Vide la file dans l'ordre d'arrivée; s'arrête quand tous les handles
/// ont disparu
async fn drain_writes(sink: Arc<dyn EventSink>, stats: Arc<SinkStats>, mut rx: mpsc::Receiver<PendingWrite>, write_timeout: Duration) {
    while let Some(write) = rx.recv().await {
        let (what, outcome) = match &write {
            PendingWrite::Reading { device_id, reading } => {
                ("write_reading", tokio::time::timeout(write_timeout, sink.write_reading(device_id, reading)).await)
            }
            PendingWrite::Event(event) => (
                "write_irrigation_event",
                tokio::time::timeout(write_timeout, sink.write_irrigation_event(event)).await,
            ),
        };
        let result = outcome.unwrap_or(Err(SinkError::Timeout(write_timeout)));
        stats.count(what, &result);
    }
    debug!("[sink] writer stopped");
}

#[derive(Clone)]
pub struct SinkHandle {
    sink: Arc<dyn EventSink>,
    stats: Arc<SinkStats>,
    queue: mpsc::Sender<PendingWrite>,
}

impl SinkHandle {
    /// Doit être appelé dans un runtime tokio (démarre l'écrivain)
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self::with_limits(sink, DEFAULT_QUEUE_CAPACITY, DEFAULT_WRITE_TIMEOUT)
    }

    pub fn with_limits(sink: Arc<dyn EventSink>, queue_capacity: usize, write_timeout: Duration) -> Self {
        let stats = Arc::new(SinkStats::default());
        let (queue, rx) = mpsc::channel(queue_capacity.max(1));
        tokio::spawn(drain_writes(sink.clone(), stats.clone(), rx, write_timeout));
        Self { sink, stats, queue }
    }

    fn enqueue(&self, write: PendingWrite) {
        match self.queue.try_send(write) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("[sink] write queue full, write dropped");
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("[sink] writer stopped, write dropped");
            }
        }
    }

    /// Fire-and-forget : la mise à jour du registre n'attend pas le stockage
    pub fn record_reading(&self, device_id: &str, reading: Reading) {
        self.enqueue(PendingWrite::Reading { device_id: device_id.to_string(), reading });
    }

    pub fn record_event(&self, event: IrrigationEvent) {
        self.enqueue(PendingWrite::Event(event));
    }

    pub async fn recent_readings(&self, device_id: &str, window: time::Duration) -> Result<Vec<Reading>, SinkError> {
        self.sink.query_recent(device_id, window).await.map_err(|e| {
            warn!(device_id, error = %e, "[sink] query_recent failed");
            e
        })
    }

    /// Sonde bornée par `timeout`; un dépassement compte comme injoignable
    pub async fn check(&self, timeout: Duration) -> StorageCheck {
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.sink.ping()).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let check = match outcome {
            Ok(Ok(())) => StorageCheck { reachable: true, latency_ms, error: None },
            Ok(Err(e)) => StorageCheck { reachable: false, latency_ms, error: Some(e.to_string()) },
            Err(_) => StorageCheck {
                reachable: false,
                latency_ms,
                error: Some(format!("check timed out after {}ms", timeout.as_millis())),
            },
        };
        debug!(?check, "[sink] storage check");
        check
    }

    pub fn counters(&self) -> SinkCounters {
        SinkCounters {
            writes_ok: self.stats.writes_ok.load(Ordering::Relaxed),
            writes_failed: self.stats.writes_failed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn info(&self) -> SinkInfo {
        self.sink.info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::TriggerType;
    use parking_lot::Mutex;
    use time::macros::datetime;

    struct BrokenSink;

    #[async_trait]
    impl EventSink for BrokenSink {
        async fn write_reading(&self, _: &str, _: &Reading) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("down".into()))
        }
        async fn write_irrigation_event(&self, _: &IrrigationEvent) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("down".into()))
        }
        async fn query_recent(&self, _: &str, _: time::Duration) -> Result<Vec<Reading>, SinkError> {
            Err(SinkError::Unavailable("down".into()))
        }
        async fn ping(&self) -> Result<(), SinkError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }
        fn info(&self) -> SinkInfo {
            SinkInfo { name: "broken".into(), description: String::new() }
        }
    }

    fn reading() -> Reading {
        Reading {
            moisture: Some(40.0),
            temperature: Some(21.0),
            humidity: Some(50.0),
            light: None,
            observed_at: datetime!(2024-05-01 10:00 UTC),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn failures_are_counted_not_propagated() {
        let handle = SinkHandle::new(Arc::new(BrokenSink));
        handle.record_reading("p", reading());
        settle().await;
        assert_eq!(handle.counters(), SinkCounters { writes_ok: 0, writes_failed: 1, dropped: 0 });
        assert!(handle.recent_readings("p", time::Duration::hours(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn storage_check_times_out() {
        let handle = SinkHandle::new(Arc::new(BrokenSink));
        let check = handle.check(Duration::from_secs(2)).await;
        assert!(!check.reachable);
        assert!(check.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn successful_writes_are_counted() {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:05 UTC)));
        let handle = SinkHandle::new(Arc::new(MemorySink::new(10, clock)));
        handle.record_reading("p", reading());
        settle().await;
        assert_eq!(handle.counters().writes_ok, 1);
        let check = handle.check(Duration::from_secs(2)).await;
        assert!(check.reachable);
    }

    /// Stockage figé : aucune écriture ne se termine
    struct StuckSink;

    #[async_trait]
    impl EventSink for StuckSink {
        async fn write_reading(&self, _: &str, _: &Reading) -> Result<(), SinkError> {
            std::future::pending().await
        }
        async fn write_irrigation_event(&self, _: &IrrigationEvent) -> Result<(), SinkError> {
            std::future::pending().await
        }
        async fn query_recent(&self, _: &str, _: time::Duration) -> Result<Vec<Reading>, SinkError> {
            Ok(Vec::new())
        }
        async fn ping(&self) -> Result<(), SinkError> {
            Ok(())
        }
        fn info(&self) -> SinkInfo {
            SinkInfo { name: "stuck".into(), description: String::new() }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_storage_is_bounded() {
        let handle = SinkHandle::with_limits(Arc::new(StuckSink), 2, Duration::from_secs(60));
        for _ in 0..5 {
            handle.record_reading("p", reading());
        }
        assert_eq!(handle.counters().dropped, 3);

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(handle.counters(), SinkCounters { writes_ok: 0, writes_failed: 2, dropped: 3 });
    }

    #[derive(Default)]
    struct OrderedSink {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventSink for OrderedSink {
        async fn write_reading(&self, device_id: &str, reading: &Reading) -> Result<(), SinkError> {
            tokio::task::yield_now().await;
            self.seen.lock().push(format!("{device_id}:{}", reading.moisture.unwrap_or_default()));
            Ok(())
        }
        async fn write_irrigation_event(&self, event: &IrrigationEvent) -> Result<(), SinkError> {
            self.seen.lock().push(format!("{}:event", event.device_id));
            Ok(())
        }
        async fn query_recent(&self, _: &str, _: time::Duration) -> Result<Vec<Reading>, SinkError> {
            Ok(Vec::new())
        }
        async fn ping(&self) -> Result<(), SinkError> {
            Ok(())
        }
        fn info(&self) -> SinkInfo {
            SinkInfo { name: "ordered".into(), description: String::new() }
        }
    }

    #[tokio::test]
    async fn writes_land_in_submission_order() {
        let sink = Arc::new(OrderedSink::default());
        let handle = SinkHandle::new(sink.clone());
        for moisture in [10.0, 20.0, 30.0] {
            handle.record_reading("p", Reading { moisture: Some(moisture), ..reading() });
        }
        let at = datetime!(2024-05-01 10:00 UTC);
        handle.record_event(IrrigationEvent::new("p", at, TriggerType::Manual, 5_000, true, "manual"));
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*sink.seen.lock(), vec!["p:10", "p:20", "p:30", "p:event"]);
        assert_eq!(handle.counters().writes_ok, 4);
    }
}

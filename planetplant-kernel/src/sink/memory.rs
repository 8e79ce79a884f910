/**
 * SINK MÉMOIRE - Backend par défaut, borné par capteur
 *
 * Garde les N derniers relevés de chaque capteur (FIFO) et les derniers
 * événements d'arrosage. Rien ne survit au redémarrage.
 */

use super::{EventSink, SinkError, SinkInfo};
use crate::clock::SharedClock;
use crate::models::{IrrigationEvent, Reading};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

pub struct MemorySink {
    capacity: usize,
    clock: SharedClock,
    readings: Mutex<HashMap<String, VecDeque<Reading>>>,
    events: Mutex<VecDeque<IrrigationEvent>>,
}

impl MemorySink {
    pub fn new(capacity: usize, clock: SharedClock) -> Self {
        Self {
            capacity: capacity.max(1),
            clock,
            readings: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Événements d'arrosage conservés (ordre d'écriture)
    pub fn events(&self) -> Vec<IrrigationEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn reading_count(&self, device_id: &str) -> usize {
        self.readings.lock().get(device_id).map_or(0, |r| r.len())
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn write_reading(&self, device_id: &str, reading: &Reading) -> Result<(), SinkError> {
        let mut readings = self.readings.lock();
        let series = readings.entry(device_id.to_string()).or_default();
        series.push_back(reading.clone());
        while series.len() > self.capacity {
            series.pop_front();
        }
        Ok(())
    }

    async fn write_irrigation_event(&self, event: &IrrigationEvent) -> Result<(), SinkError> {
        let mut events = self.events.lock();
        events.push_back(event.clone());
        while events.len() > self.capacity {
            events.pop_front();
        }
        Ok(())
    }

    async fn query_recent(&self, device_id: &str, window: time::Duration) -> Result<Vec<Reading>, SinkError> {
        let since = self.clock.now() - window;
        let readings = self.readings.lock();
        Ok(readings
            .get(device_id)
            .map(|series| series.iter().filter(|r| r.observed_at >= since).cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn info(&self) -> SinkInfo {
        SinkInfo {
            name: "memory".into(),
            description: format!("in-process ring buffer ({} readings per device)", self.capacity),
        }
    }
}

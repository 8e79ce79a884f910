/**
 * INGESTION - Message broker -> registre -> sink -> bus
 *
 * RÔLE : Traite chaque message entrant reçu par la passerelle MQTT.
 *
 * FONCTIONNEMENT :
 * 1. Route le topic (télémétrie / statut / heartbeat / pompe) et extrait l'id capteur
 * 2. Décode + valide le JSON; en cas d'échec : warning, message abandonné,
 *    état du capteur inchangé
 * 3. Met à jour le registre (seul écrivain de l'état)
 * 4. Relevés : envoi au sink en tâche de fond + notification ReadingUpdated
 * 5. Pompe : état marche/arrêt dans la connectivité + notification PumpReported
 *
 * Le sink et le registre sont indépendants : un stockage en panne ne bloque
 * ni n'annule la mise à jour du registre.
 */

use crate::clock::SharedClock;
use crate::contracts::{
    decode_heartbeat, decode_pump, decode_status, decode_telemetry, ContractError, Route, StatusUpdate, TelemetrySample, TopicKind,
    TopicRouter,
};
use crate::events::{CoreEvent, EventBus};
use crate::models::Reading;
use crate::registry::SharedDeviceRegistry;
use crate::sink::SinkHandle;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Applied(Route),
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    UnknownTopic,
    Malformed(String),
    OutOfRange(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct IngestCounters {
    pub received: u64,
    pub applied: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct IngestStats {
    received: AtomicU64,
    applied: AtomicU64,
    dropped: AtomicU64,
}

pub struct Ingestor {
    router: TopicRouter,
    registry: SharedDeviceRegistry,
    sink: SinkHandle,
    bus: EventBus,
    clock: SharedClock,
    stats: IngestStats,
}

impl Ingestor {
    pub fn new(router: TopicRouter, registry: SharedDeviceRegistry, sink: SinkHandle, bus: EventBus, clock: SharedClock) -> Self {
        Self { router, registry, sink, bus, clock, stats: IngestStats::default() }
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> IngestOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let outcome = match self.router.route(topic) {
            Ok(route) => match self.apply(&route, payload) {
                Ok(()) => IngestOutcome::Applied(route),
                Err(e) => {
                    warn!(topic, kind = route.kind.as_str(), error = %e, "[ingest] payload rejected");
                    IngestOutcome::Dropped(match e {
                        ContractError::OutOfRange { .. } => DropReason::OutOfRange(e.to_string()),
                        other => DropReason::Malformed(other.to_string()),
                    })
                }
            },
            Err(_) => {
                debug!(topic, "[ingest] no route for topic");
                IngestOutcome::Dropped(DropReason::UnknownTopic)
            }
        };

        let counter = match outcome {
            IngestOutcome::Applied(_) => &self.stats.applied,
            IngestOutcome::Dropped(_) => &self.stats.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    fn apply(&self, route: &Route, payload: &[u8]) -> Result<(), ContractError> {
        let device_id = route.device_id.as_str();
        match route.kind {
            TopicKind::Telemetry => {
                let sample = decode_telemetry(payload)?;
                self.apply_telemetry(device_id, sample);
            }
            TopicKind::Status => {
                let status = decode_status(payload)?;
                self.registry.upsert_status(device_id, status);
            }
            TopicKind::Heartbeat => {
                let meta = decode_heartbeat(payload)?;
                self.registry.touch_heartbeat(device_id, meta);
            }
            TopicKind::Pump => {
                let report = decode_pump(payload)?;
                self.registry.record_pump(device_id, report);
                debug!(device_id, action = ?report.action, "[ingest] pump report applied");
                self.bus.emit(CoreEvent::PumpReported {
                    device_id: device_id.to_string(),
                    action: report.action,
                    duration_ms: report.duration_ms,
                    at: self.clock.now(),
                });
            }
        }
        Ok(())
    }

    fn apply_telemetry(&self, device_id: &str, sample: TelemetrySample) {
        let reading = Reading {
            moisture: Some(sample.moisture),
            temperature: Some(sample.temperature),
            humidity: Some(sample.humidity),
            light: sample.light,
            observed_at: self.clock.now(),
        };

        // Enveloppe firmware : état de la carte rangé dans la connectivité
        let mut extras = StatusUpdate { signal_quality: sample.signal_quality, ..Default::default() };
        if let Some(heap) = sample.free_heap {
            extras.attributes.insert("free_heap".into(), json!(heap));
        }
        if let Some(uptime) = sample.uptime_ms {
            extras.attributes.insert("uptime_ms".into(), json!(uptime));
        }
        self.registry
            .upsert_telemetry(device_id, reading.clone(), sample.location, sample.pump_active, extras);

        debug!(device_id, moisture = sample.moisture, "[ingest] reading applied");
        self.sink.record_reading(device_id, reading.clone());
        self.bus.emit(CoreEvent::ReadingUpdated { device_id: device_id.to_string(), reading });
    }

    pub fn counters(&self) -> IngestCounters {
        IngestCounters {
            received: self.stats.received.load(Ordering::Relaxed),
            applied: self.stats.applied.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TopicsConf;
    use crate::models::IrrigationPolicy;
    use crate::registry::DeviceRegistry;
    use crate::sink::MemorySink;
    use proptest::prelude::*;
    use std::sync::Arc;
    use time::macros::datetime;

    fn setup() -> (Ingestor, SharedDeviceRegistry, Arc<MemorySink>, EventBus) {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00 UTC)));
        let bus = EventBus::default();
        let registry = Arc::new(DeviceRegistry::new(
            IrrigationPolicy::default(),
            std::time::Duration::from_secs(300),
            clock.clone(),
            bus.clone(),
        ));
        let memory = Arc::new(MemorySink::new(100, clock.clone()));
        let router = TopicRouter::from_config(&TopicsConf::default()).unwrap();
        let ingestor = Ingestor::new(router, registry.clone(), SinkHandle::new(memory.clone()), bus.clone(), clock);
        (ingestor, registry, memory, bus)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn telemetry_updates_registry_sink_and_bus() {
        let (ingestor, registry, memory, bus) = setup();
        let mut rx = bus.subscribe();
        let outcome = ingestor.handle_message(
            "sensors/plant-1/data",
            br#"{"temperature":23.5,"humidity":55,"moisture":18,"location":"salon"}"#,
        );
        assert!(matches!(outcome, IngestOutcome::Applied(ref r) if r.kind == TopicKind::Telemetry));

        let device = registry.get("plant-1").unwrap();
        assert_eq!(device.moisture(), Some(18.0));
        assert_eq!(device.location_label.as_deref(), Some("salon"));

        settle().await;
        assert_eq!(memory.reading_count("plant-1"), 1);

        let mut saw_reading = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, CoreEvent::ReadingUpdated { .. }) {
                saw_reading = true;
            }
        }
        assert!(saw_reading);
    }

    #[tokio::test]
    async fn firmware_envelope_fills_connectivity() {
        let (ingestor, registry, _memory, _bus) = setup();
        ingestor.handle_message(
            "sensors/esp-01/data",
            br#"{"device_id":"esp-01","sensors":{"temperature":21,"humidity":40,"moisture":35,"light":512,"pump_active":false},"status":{"wifi_rssi":-61,"free_heap":181000,"uptime":3600000}}"#,
        );
        let device = registry.get("esp-01").unwrap();
        assert_eq!(device.connectivity.signal_quality, Some(-61.0));
        assert_eq!(device.connectivity.attributes.get("free_heap"), Some(&json!(181000)));
        assert_eq!(device.last_reading.unwrap().light, Some(512.0));
        assert!(!device.connectivity.pump.active);
    }

    #[tokio::test]
    async fn pump_feedback_is_recorded_and_announced() {
        let (ingestor, registry, _memory, bus) = setup();
        let mut rx = bus.subscribe();
        let outcome = ingestor.handle_message("sensors/esp-01/pump", br#"{"device_id":"esp-01","action":"started","duration":5000,"pump_active":true}"#);
        assert!(matches!(outcome, IngestOutcome::Applied(ref r) if r.kind == TopicKind::Pump));
        ingestor.handle_message("sensors/esp-01/pump", br#"{"action":"stopped","duration":4870,"pump_active":false}"#);

        let pump = registry.get("esp-01").unwrap().connectivity.pump;
        assert!(!pump.active);
        assert_eq!(pump.last_run_ms, Some(4_870));
        assert!(pump.last_started_at.is_some());

        let mut actions = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let CoreEvent::PumpReported { action, .. } = ev {
                actions.push(action);
            }
        }
        assert_eq!(actions, vec![crate::models::PumpAction::Started, crate::models::PumpAction::Stopped]);

        let dropped = ingestor.handle_message("sensors/esp-01/pump", br#"{"action":"boost"}"#);
        assert!(matches!(dropped, IngestOutcome::Dropped(DropReason::Malformed(_))));
    }

    #[tokio::test]
    async fn status_and_heartbeat_are_routed() {
        let (ingestor, registry, _memory, _bus) = setup();
        ingestor.handle_message("devices/p/heartbeat", br#"{"batteryLevel":77,"wifiStrength":-50}"#);
        ingestor.handle_message("sensors/p/status", br#"{"status":"online","ipAddress":"10.0.0.5","firmware":"1.2"}"#);
        let device = registry.get("p").unwrap();
        assert_eq!(device.connectivity.battery_level, Some(77.0));
        assert_eq!(device.connectivity.ip_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(device.connectivity.attributes.get("firmware"), Some(&json!("1.2")));
        assert_eq!(ingestor.counters(), IngestCounters { received: 2, applied: 2, dropped: 0 });
    }

    #[tokio::test]
    async fn malformed_and_unknown_are_dropped() {
        let (ingestor, registry, _memory, _bus) = setup();
        assert_eq!(ingestor.handle_message("garden/p/data", b"{}"), IngestOutcome::Dropped(DropReason::UnknownTopic));
        assert!(matches!(
            ingestor.handle_message("sensors/p/data", b"not json"),
            IngestOutcome::Dropped(DropReason::Malformed(_))
        ));
        assert!(matches!(
            ingestor.handle_message("sensors/p/data", br#"{"temperature":"hot","humidity":1,"moisture":1}"#),
            IngestOutcome::Dropped(DropReason::Malformed(_))
        ));
        assert!(registry.get("p").is_none());
        assert_eq!(ingestor.counters().dropped, 3);
    }

    #[tokio::test]
    async fn out_of_range_telemetry_leaves_state_unchanged() {
        let (ingestor, registry, _memory, _bus) = setup();
        ingestor.handle_message("sensors/p/data", br#"{"temperature":20,"humidity":50,"moisture":40}"#);
        let before = registry.get("p").unwrap();

        let outcome = ingestor.handle_message("sensors/p/data", br#"{"temperature":20,"humidity":50,"moisture":140}"#);
        assert!(matches!(outcome, IngestOutcome::Dropped(DropReason::OutOfRange(_))));
        assert_eq!(registry.get("p").unwrap(), before);
    }

    fn out_of_range_payload() -> impl Strategy<Value = String> {
        let bad_temp = prop_oneof![-1000.0f64..-50.01, 100.01f64..1000.0];
        let bad_pct = prop_oneof![-1000.0f64..-0.01, 100.01f64..1000.0];
        prop_oneof![
            bad_temp.prop_map(|t| format!(r#"{{"temperature":{t},"humidity":50,"moisture":40}}"#)),
            bad_pct.clone().prop_map(|h| format!(r#"{{"temperature":20,"humidity":{h},"moisture":40}}"#)),
            bad_pct.prop_map(|m| format!(r#"{{"temperature":20,"humidity":50,"moisture":{m}}}"#)),
        ]
    }

    proptest! {
        #[test]
        fn any_out_of_range_field_is_a_no_op(payload in out_of_range_payload()) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let (ingestor, registry, _memory, _bus) = setup();
                ingestor.handle_message("sensors/p/data", br#"{"temperature":20,"humidity":50,"moisture":40}"#);
                let before = registry.get("p").unwrap();
                ingestor.handle_message("sensors/p/data", payload.as_bytes());
                assert_eq!(registry.get("p").unwrap(), before);
            });
        }
    }
}

/*!
Test Harness pour le noyau PlanetPlant

Câble les vrais composants (registre, ingestion, moteur, santé, façade) sur :
- une horloge manuelle (le temps n'avance que sur demande)
- un transport factice (`FakeTransport`)
- un sink mémoire, ou n'importe quel `EventSink` fourni par le test
*/

use crate::mqtt_stub::{FakeTransport, PlantMessageBuilder};
use async_trait::async_trait;
use planetplant_kernel::clock::ManualClock;
use planetplant_kernel::config::{HealthConf, TopicsConf};
use planetplant_kernel::contracts::TopicRouter;
use planetplant_kernel::engine::IrrigationEngine;
use planetplant_kernel::events::{CoreEvent, EventBus};
use planetplant_kernel::health::HealthAggregator;
use planetplant_kernel::ingest::{IngestOutcome, Ingestor};
use planetplant_kernel::models::{IrrigationEvent, IrrigationPolicy, Reading};
use planetplant_kernel::registry::DeviceRegistry;
use planetplant_kernel::service::PlantService;
use planetplant_kernel::sink::{EventSink, MemorySink, SinkError, SinkHandle, SinkInfo};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::broadcast;

/// Instant de départ par défaut : midi, hors heures calmes
pub const HARNESS_START: OffsetDateTime = time::macros::datetime!(2024-05-01 12:00 UTC);

pub struct TestHarness {
    pub clock: Arc<ManualClock>,
    pub bus: EventBus,
    pub transport: Arc<FakeTransport>,
    pub registry: Arc<DeviceRegistry>,
    pub ingestor: Arc<Ingestor>,
    pub engine: Arc<IrrigationEngine>,
    pub health: Arc<HealthAggregator>,
    pub service: Arc<PlantService>,
    pub sink: SinkHandle,
    topics: TopicsConf,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    fn topic(&self, template: &str, device_id: &str) -> String {
        template.replacen('+', device_id, 1)
    }

    /// Simule un message brut reçu du broker
    pub fn send_raw(&self, topic: &str, payload: &[u8]) -> IngestOutcome {
        self.ingestor.handle_message(topic, payload)
    }

    pub fn send_json(&self, topic: &str, payload: &Value) -> IngestOutcome {
        self.send_raw(topic, payload.to_string().as_bytes())
    }

    pub fn send_telemetry(&self, device_id: &str, temperature: f64, humidity: f64, moisture: f64) -> IngestOutcome {
        let topic = self.topic(&self.topics.telemetry, device_id);
        self.send_json(&topic, &PlantMessageBuilder::telemetry(temperature, humidity, moisture))
    }

    pub fn send_heartbeat(&self, device_id: &str, battery_level: f64, wifi_strength: f64) -> IngestOutcome {
        let topic = self.topic(&self.topics.heartbeat, device_id);
        self.send_json(&topic, &PlantMessageBuilder::heartbeat(battery_level, wifi_strength))
    }

    pub fn send_status(&self, device_id: &str, status: &str) -> IngestOutcome {
        let topic = self.topic(&self.topics.status, device_id);
        self.send_json(&topic, &PlantMessageBuilder::status(status))
    }

    pub fn send_pump(&self, device_id: &str, started: bool, duration_ms: u32) -> IngestOutcome {
        let topic = self.topic(&self.topics.pump, device_id);
        self.send_json(&topic, &PlantMessageBuilder::pump(device_id, started, duration_ms))
    }

    pub fn health_topic(&self) -> &str {
        &self.topics.health
    }

    pub fn advance(&self, by: time::Duration) {
        self.clock.advance(by);
    }

    pub fn now(&self) -> OffsetDateTime {
        use planetplant_kernel::clock::Clock;
        self.clock.now()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.bus.subscribe()
    }

    /// Attend qu'une condition devienne vraie (tâches de fond du sink...)
    pub async fn wait_until<F>(&self, timeout_ms: u64, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tracing::warn!("[harness] timeout waiting for condition");
        condition()
    }

    /// Vide les événements déjà émis sur un abonnement
    pub fn drain(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    /// Assert qu'un champ a une valeur donnée dans la dernière commande d'un capteur
    pub fn assert_last_command_field(&self, device_id: &str, field_path: &str, expected: &Value) -> anyhow::Result<()> {
        let commands = self.transport.commands_for(device_id);
        let Some(last) = commands.last() else {
            anyhow::bail!("no command published for {device_id}");
        };
        let msg = serde_json::to_value(last)?;
        match get_nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!("Field '{}' mismatch: expected {:?}, got {:?}", field_path, expected, actual),
            None => anyhow::bail!("Field '{}' not found in last command for {}", field_path, device_id),
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(obj) => obj.get(part),
        _ => None,
    })
}

pub struct HarnessBuilder {
    start: OffsetDateTime,
    defaults: IrrigationPolicy,
    staleness: Duration,
    sink: Option<Arc<dyn EventSink>>,
    health: HealthConf,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            start: HARNESS_START,
            defaults: IrrigationPolicy::default(),
            staleness: Duration::from_secs(300),
            sink: None,
            health: HealthConf::default(),
        }
    }
}

impl HarnessBuilder {
    pub fn starting_at(mut self, start: OffsetDateTime) -> Self {
        self.start = start;
        self
    }

    pub fn with_defaults(mut self, policy: IrrigationPolicy) -> Self {
        self.defaults = policy;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_health(mut self, conf: HealthConf) -> Self {
        self.health = conf;
        self
    }

    pub fn build(self) -> TestHarness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let topics = TopicsConf::default();
        let clock = Arc::new(ManualClock::new(self.start));
        let bus = EventBus::default();
        let transport = Arc::new(FakeTransport::with_topics(&topics));
        let sink: Arc<dyn EventSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(MemorySink::new(1_000, clock.clone())),
        };
        let sink = SinkHandle::new(sink);
        let registry = Arc::new(DeviceRegistry::new(self.defaults, self.staleness, clock.clone(), bus.clone()));
        let router = TopicRouter::from_config(&topics).unwrap_or_else(|e| panic!("invalid test topics: {e}"));
        let ingestor = Arc::new(Ingestor::new(router, registry.clone(), sink.clone(), bus.clone(), clock.clone()));
        let engine = Arc::new(IrrigationEngine::new(
            registry.clone(),
            transport.clone(),
            sink.clone(),
            bus.clone(),
            clock.clone(),
            Duration::from_secs(300),
        ));
        let health = Arc::new(HealthAggregator::new(
            transport.clone(),
            registry.clone(),
            engine.clone(),
            sink.clone(),
            ingestor.clone(),
            bus.clone(),
            clock.clone(),
            self.health,
        ));
        let service = Arc::new(PlantService::new(
            registry.clone(),
            engine.clone(),
            health.clone(),
            sink.clone(),
            transport.clone(),
            bus.clone(),
            clock.clone(),
        ));

        TestHarness { clock, bus, transport, registry, ingestor, engine, health, service, sink, topics }
    }
}

/// Sink toujours en panne : vérifie que le stockage ne bloque rien
#[derive(Default)]
pub struct FailingSink {
    pub attempts: AtomicU64,
}

#[async_trait]
impl EventSink for FailingSink {
    async fn write_reading(&self, _device_id: &str, _reading: &Reading) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(SinkError::Unavailable("database offline".into()))
    }

    async fn write_irrigation_event(&self, _event: &IrrigationEvent) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(SinkError::Unavailable("database offline".into()))
    }

    async fn query_recent(&self, _device_id: &str, _window: time::Duration) -> Result<Vec<Reading>, SinkError> {
        Err(SinkError::Unavailable("database offline".into()))
    }

    async fn ping(&self) -> Result<(), SinkError> {
        Err(SinkError::Unavailable("database offline".into()))
    }

    fn info(&self) -> SinkInfo {
        SinkInfo { name: "failing".into(), description: "always unavailable".into() }
    }
}

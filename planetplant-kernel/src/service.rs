/**
 * SURFACE DE REQUÊTE - Façade du noyau pour les couches externes (CLI/API/UI)
 *
 * RÔLE : Point d'entrée unique des opérations exposées : santé, liste des
 * capteurs, arrosage manuel, arrêt de pompe, mise à jour de politique,
 * historiques.
 * Chaque composant est construit une fois au démarrage puis injecté ici.
 */

use crate::clock::SharedClock;
use crate::engine::{EvaluationOutcome, GateReason, SharedIrrigationEngine};
use crate::events::{CoreEvent, EventBus};
use crate::health::{HealthSnapshot, HealthSummary, SharedHealthAggregator};
use crate::models::{Device, DeviceCommand, IrrigationEvent, PolicyPatch, Reading, TriggerType, ValidationError};
use crate::mqtt::SharedTransport;
use crate::registry::SharedDeviceRegistry;
use crate::sink::{SinkError, SinkHandle};
use rumqttc::QoS;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Arrosage manuel refusé, avec la raison structurée
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("irrigation refused: {reason}")]
pub struct IrrigationRefused {
    pub reason: GateReason,
    /// Tentative tracée quand la commande n'a pas pu partir
    pub event: Option<IrrigationEvent>,
}

pub struct PlantService {
    registry: SharedDeviceRegistry,
    engine: SharedIrrigationEngine,
    health: SharedHealthAggregator,
    sink: SinkHandle,
    transport: SharedTransport,
    bus: EventBus,
    clock: SharedClock,
}

pub type SharedPlantService = Arc<PlantService>;

impl PlantService {
    pub fn new(
        registry: SharedDeviceRegistry,
        engine: SharedIrrigationEngine,
        health: SharedHealthAggregator,
        sink: SinkHandle,
        transport: SharedTransport,
        bus: EventBus,
        clock: SharedClock,
    ) -> Self {
        Self { registry, engine, health, sink, transport, bus, clock }
    }

    pub async fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot().await
    }

    pub fn health_history(&self) -> Vec<HealthSummary> {
        self.health.history()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.registry.all()
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.registry.get(device_id)
    }

    pub async fn request_irrigation(&self, device_id: &str) -> Result<IrrigationEvent, IrrigationRefused> {
        match self.engine.evaluate(device_id, TriggerType::Manual).await {
            EvaluationOutcome::Watered(event) => Ok(event),
            EvaluationOutcome::Skipped(reason) => Err(IrrigationRefused { reason, event: None }),
            EvaluationOutcome::Failed(event) => Err(IrrigationRefused {
                reason: GateReason::TransportUnavailable,
                event: Some(event),
            }),
        }
    }

    /// Arrêt immédiat de la pompe. Hors portes de décision : seul un
    /// capteur inconnu ou un lien coupé empêchent l'envoi
    pub async fn stop_irrigation(&self, device_id: &str) -> Result<(), IrrigationRefused> {
        if self.registry.get(device_id).is_none() {
            return Err(IrrigationRefused { reason: GateReason::UnknownDevice, event: None });
        }
        let command = DeviceCommand::stop(self.clock.now());
        if self.transport.publish_command(device_id, &command, QoS::AtLeastOnce).await {
            info!(device_id, "[service] stop command sent");
            Ok(())
        } else {
            warn!(device_id, "[service] stop not sent, link down");
            Err(IrrigationRefused { reason: GateReason::TransportUnavailable, event: None })
        }
    }

    /// Valide puis applique; la nouvelle politique est poussée au capteur
    /// (best-effort, un lien coupé n'annule pas la mise à jour)
    pub async fn update_policy(&self, device_id: &str, patch: &PolicyPatch) -> Result<Device, ValidationError> {
        let device = self.registry.update_config(device_id, patch)?;
        let command = DeviceCommand::config(&device.policy, self.clock.now());
        if self.transport.publish_command(device_id, &command, QoS::AtLeastOnce).await {
            info!(device_id, "[service] config pushed to device");
        } else {
            warn!(device_id, "[service] config not pushed, link down");
        }
        Ok(device)
    }

    pub fn recent_events(&self, device_id: &str, limit: usize) -> Vec<IrrigationEvent> {
        self.engine.recent_events(device_id, limit)
    }

    pub async fn recent_readings(&self, device_id: &str, window: time::Duration) -> Result<Vec<Reading>, SinkError> {
        self.sink.recent_readings(device_id, window).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthConf, TopicsConf};
    use crate::contracts::TopicRouter;
    use crate::engine::IrrigationEngine;
    use crate::health::HealthAggregator;
    use crate::ingest::Ingestor;
    use crate::models::CommandKind;
    use crate::sink::MemorySink;
    use crate::test_support::{clock_at, noon, reading, registry, StubTransport};
    use std::time::Duration;

    fn service() -> (Arc<StubTransport>, SharedDeviceRegistry, PlantService) {
        let clock = clock_at(noon());
        let bus = EventBus::default();
        let registry = registry(clock.clone(), bus.clone());
        let transport = StubTransport::new();
        let sink = SinkHandle::new(Arc::new(MemorySink::new(10, clock.clone())));
        let engine = Arc::new(IrrigationEngine::new(
            registry.clone(),
            transport.clone(),
            sink.clone(),
            bus.clone(),
            clock.clone(),
            Duration::from_secs(300),
        ));
        let router = TopicRouter::from_config(&TopicsConf::default()).unwrap();
        let ingestor = Arc::new(Ingestor::new(router, registry.clone(), sink.clone(), bus.clone(), clock.clone()));
        let health = Arc::new(HealthAggregator::new(
            transport.clone(),
            registry.clone(),
            engine.clone(),
            sink.clone(),
            ingestor,
            bus.clone(),
            clock.clone(),
            HealthConf::default(),
        ));
        let svc = PlantService::new(registry.clone(), engine, health, sink, transport.clone(), bus, clock);
        (transport, registry, svc)
    }

    #[tokio::test]
    async fn manual_irrigation_reports_structured_reason() {
        let (transport, registry, svc) = service();
        registry.upsert_reading("p", reading(70.0, noon()));

        let event = svc.request_irrigation("p").await.unwrap();
        assert_eq!(event.trigger_type, TriggerType::Manual);
        let refused = svc.request_irrigation("p").await.unwrap_err();
        assert_eq!(refused.reason, GateReason::Cooldown);
        assert_eq!(refused.to_string(), "irrigation refused: cooldown");

        transport.set_up(false);
        let unknown = svc.request_irrigation("ghost").await.unwrap_err();
        assert_eq!(unknown.reason, GateReason::UnknownDevice);
        assert_eq!(svc.recent_events("p", 5).len(), 1);
    }

    #[tokio::test]
    async fn policy_update_pushes_config_command() {
        let (transport, registry, svc) = service();
        registry.upsert_reading("p", reading(50.0, noon()));
        let patch = PolicyPatch { moisture_min: Some(35.0), ..Default::default() };
        let device = svc.update_policy("p", &patch).await.unwrap();
        assert_eq!(device.policy.moisture_min, 35.0);

        let commands = transport.commands.lock();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].1.command, CommandKind::Config);
        assert_eq!(commands[0].1.config.as_ref().unwrap()["moisture_min"], 35.0);
    }

    #[tokio::test]
    async fn rejected_policy_sends_nothing() {
        let (transport, registry, svc) = service();
        registry.upsert_reading("p", reading(50.0, noon()));
        let patch = PolicyPatch { duration_ms: Some(500), ..Default::default() };
        assert_eq!(svc.update_policy("p", &patch).await.unwrap_err(), ValidationError::DurationOutOfBounds(500));
        assert_eq!(transport.sent(), 0);
    }

    #[tokio::test]
    async fn stop_bypasses_gates_but_needs_link() {
        let (transport, registry, svc) = service();
        registry.upsert_reading("p", reading(70.0, noon()));
        svc.request_irrigation("p").await.unwrap();

        // en cooldown, l'arrêt part quand même
        svc.stop_irrigation("p").await.unwrap();
        {
            let commands = transport.commands.lock();
            assert_eq!(commands.len(), 2);
            assert_eq!(commands[1].1.action.as_deref(), Some("stop"));
            assert_eq!(commands[1].1.duration, None);
        }

        assert_eq!(svc.stop_irrigation("ghost").await.unwrap_err().reason, GateReason::UnknownDevice);
        transport.set_up(false);
        assert_eq!(svc.stop_irrigation("p").await.unwrap_err().reason, GateReason::TransportUnavailable);
        assert_eq!(transport.sent(), 2);
    }
}

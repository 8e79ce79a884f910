/**
 * BUS D'ÉVÉNEMENTS INTERNE - Notifications de changement pour les couches externes
 *
 * RÔLE : Canal broadcast explicite auquel l'UI/API s'abonne (dashboard temps
 * réel, websockets...). Le noyau ne connaît aucun mécanisme de diffusion.
 *
 * Un abonné trop lent perd les plus anciens messages (Lagged), jamais
 * l'émetteur n'est bloqué.
 */

use crate::health::HealthSummary;
use crate::models::{IrrigationEvent, IrrigationPolicy, PumpAction, Reading};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    DeviceProvisioned {
        device_id: String,
    },
    ReadingUpdated {
        device_id: String,
        reading: Reading,
    },
    DeviceStatusChanged {
        device_id: String,
        online: bool,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    PolicyUpdated {
        device_id: String,
        policy: IrrigationPolicy,
    },
    IrrigationRecorded {
        event: IrrigationEvent,
    },
    /// Retour terrain de la pompe (arrosage auto, manuel ou bouton local)
    PumpReported {
        device_id: String,
        action: PumpAction,
        duration_ms: Option<u32>,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    HealthUpdated {
        summary: HealthSummary,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Diffuse un événement; sans abonné il est simplement perdu
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(CoreEvent::DeviceProvisioned { device_id: "plant-1".into() });
        assert_eq!(rx.recv().await.unwrap(), CoreEvent::DeviceProvisioned { device_id: "plant-1".into() });
    }

    #[test]
    fn emit_without_subscriber_is_harmless() {
        EventBus::new(4).emit(CoreEvent::DeviceProvisioned { device_id: "x".into() });
    }

    #[test]
    fn events_are_tagged_for_consumers() {
        let json = serde_json::to_value(CoreEvent::DeviceProvisioned { device_id: "p".into() }).unwrap();
        assert_eq!(json["type"], "device_provisioned");
    }
}

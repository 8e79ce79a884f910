//! Doubles de test partagés par les modules du noyau.

use crate::clock::ManualClock;
use crate::events::EventBus;
use crate::models::{DeviceCommand, IrrigationPolicy, Reading};
use crate::mqtt::{LinkState, Transport};
use crate::registry::DeviceRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::macros::datetime;
use time::OffsetDateTime;

/// Transport en mémoire : enregistre les commandes, lien pilotable
pub struct StubTransport {
    up: AtomicBool,
    pub commands: Mutex<Vec<(String, DeviceCommand)>>,
    pub health: Mutex<Vec<String>>,
}

impl StubTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { up: AtomicBool::new(true), commands: Mutex::new(Vec::new()), health: Mutex::new(Vec::new()) })
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn sent(&self) -> usize {
        self.commands.lock().len()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn publish_command(&self, device_id: &str, command: &DeviceCommand, _qos: QoS) -> bool {
        if !self.up.load(Ordering::SeqCst) {
            return false;
        }
        self.commands.lock().push((device_id.to_string(), command.clone()));
        true
    }

    async fn publish_health(&self, payload: String) -> bool {
        if !self.up.load(Ordering::SeqCst) {
            return false;
        }
        self.health.lock().push(payload);
        true
    }

    fn link_state(&self) -> LinkState {
        if self.up.load(Ordering::SeqCst) {
            LinkState::Connected
        } else {
            LinkState::Reconnecting { attempt: 1 }
        }
    }

    fn reconnects(&self) -> u32 {
        0
    }
}

pub fn noon() -> OffsetDateTime {
    datetime!(2024-05-01 12:00 UTC)
}

pub fn clock_at(at: OffsetDateTime) -> Arc<ManualClock> {
    Arc::new(ManualClock::new(at))
}

pub fn registry(clock: Arc<ManualClock>, bus: EventBus) -> Arc<DeviceRegistry> {
    Arc::new(DeviceRegistry::new(
        IrrigationPolicy::default(),
        std::time::Duration::from_secs(300),
        clock,
        bus,
    ))
}

pub fn reading(moisture: f64, at: OffsetDateTime) -> Reading {
    Reading { moisture: Some(moisture), temperature: Some(23.5), humidity: Some(55.0), light: None, observed_at: at }
}

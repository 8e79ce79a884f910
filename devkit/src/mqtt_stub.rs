/*!
Transport MQTT factice pour tester le noyau sans broker

Implémente `Transport` : enregistre tout ce qui serait publié (topic calculé
comme le ferait la vraie passerelle) et permet de simuler une coupure du lien.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use planetplant_kernel::config::TopicsConf;
use planetplant_kernel::contracts::TopicRouter;
use planetplant_kernel::models::{rfc3339, DeviceCommand};
use planetplant_kernel::mqtt::{LinkState, Transport};
use rumqttc::QoS;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone)]
pub struct FakeTransport {
    router: TopicRouter,
    health_topic: String,
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    link: Arc<Mutex<LinkState>>,
    reconnects: Arc<AtomicU32>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::with_topics(&TopicsConf::default())
    }

    pub fn with_topics(topics: &TopicsConf) -> Self {
        Self {
            router: TopicRouter::from_config(topics).unwrap_or_else(|e| panic!("invalid test topics: {e}")),
            health_topic: topics.health.clone(),
            published_messages: Arc::new(Mutex::new(Vec::new())),
            link: Arc::new(Mutex::new(LinkState::Connected)),
            reconnects: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Simule une perte du broker (publications refusées)
    pub fn disconnect(&self) {
        let attempt = self.reconnects.fetch_add(1, Ordering::Relaxed) + 1;
        *self.link.lock() = LinkState::Reconnecting { attempt };
    }

    pub fn reconnect(&self) {
        *self.link.lock() = LinkState::Connected;
    }

    pub fn set_link(&self, state: LinkState) {
        *self.link.lock() = state;
    }

    fn record(&self, topic: String, payload: Vec<u8>, qos: QoS) {
        self.published_messages.lock().push(MockMessage { topic, payload, qos, retain: false });
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Commandes reçues par un capteur, décodées
    pub fn commands_for(&self, device_id: &str) -> Vec<DeviceCommand> {
        let prefix = self.router.command_topic(device_id, "");
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic.starts_with(&prefix))
            .filter_map(|msg| serde_json::from_slice(&msg.payload).ok())
            .collect()
    }

    pub fn get_last_json_message(&self, topic: &str) -> anyhow::Result<Option<Value>> {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn publish_command(&self, device_id: &str, command: &DeviceCommand, qos: QoS) -> bool {
        if !self.link_state().is_connected() {
            return false;
        }
        let Ok(payload) = serde_json::to_vec(command) else { return false };
        let topic = self.router.command_topic(device_id, command.command.as_str());
        tracing::info!("[mock] published to {}: {} bytes", topic, payload.len());
        self.record(topic, payload, qos);
        true
    }

    async fn publish_health(&self, payload: String) -> bool {
        if !self.link_state().is_connected() {
            return false;
        }
        self.record(self.health_topic.clone(), payload.into_bytes(), QoS::AtMostOnce);
        true
    }

    fn link_state(&self) -> LinkState {
        *self.link.lock()
    }

    fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

/// Messages capteurs formatés comme les envoie le firmware
pub struct PlantMessageBuilder;

impl PlantMessageBuilder {
    /// Télémétrie plate `sensors/{id}/data`
    pub fn telemetry(temperature: f64, humidity: f64, moisture: f64) -> Value {
        serde_json::json!({
            "temperature": temperature,
            "humidity": humidity,
            "moisture": moisture,
        })
    }

    /// Enveloppe complète émise par la carte ESP32
    pub fn firmware_telemetry(device_id: &str, temperature: f64, humidity: f64, moisture: f64, pump_active: bool) -> Value {
        serde_json::json!({
            "device_id": device_id,
            "timestamp": rfc3339(OffsetDateTime::now_utc()),
            "sensors": {
                "temperature": temperature,
                "humidity": humidity,
                "moisture": moisture,
                "light": 420,
                "pump_active": pump_active
            },
            "status": {
                "wifi_rssi": -58,
                "free_heap": 180_000,
                "uptime": 3_600_000
            }
        })
    }

    pub fn heartbeat(battery_level: f64, wifi_strength: f64) -> Value {
        serde_json::json!({
            "batteryLevel": battery_level,
            "wifiStrength": wifi_strength,
            "timestamp": rfc3339(OffsetDateTime::now_utc()),
        })
    }

    /// Retour pompe `sensors/{id}/pump` (démarrage ou arrêt effectif)
    pub fn pump(device_id: &str, started: bool, duration_ms: u32) -> Value {
        serde_json::json!({
            "device_id": device_id,
            "timestamp": rfc3339(OffsetDateTime::now_utc()),
            "action": if started { "started" } else { "stopped" },
            "duration": duration_ms,
            "pump_active": started,
        })
    }

    pub fn status(status: &str) -> Value {
        serde_json::json!({ "status": status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planetplant_kernel::models::CommandKind;

    #[tokio::test]
    async fn test_commands_are_routed_per_device() {
        let transport = FakeTransport::new();
        let at = time::macros::datetime!(2024-05-01 12:00 UTC);
        assert!(transport.publish_command("plant-1", &DeviceCommand::water(5_000, at), QoS::AtLeastOnce).await);

        let messages = transport.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "commands/plant-1/water");

        let commands = transport.commands_for("plant-1");
        assert_eq!(commands[0].command, CommandKind::Water);
        assert_eq!(commands[0].duration, Some(5_000));
        assert!(transport.commands_for("plant-2").is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_link_refuses_publish() {
        let transport = FakeTransport::new();
        transport.disconnect();
        let at = time::macros::datetime!(2024-05-01 12:00 UTC);
        assert!(!transport.publish_command("p", &DeviceCommand::water(5_000, at), QoS::AtLeastOnce).await);
        assert!(!transport.publish_health("{}".into()).await);
        assert_eq!(transport.reconnects(), 1);
        assert!(transport.get_published_messages().is_empty());
    }

    #[test]
    fn test_message_builders() {
        let telemetry = PlantMessageBuilder::telemetry(23.5, 55.0, 18.0);
        assert_eq!(telemetry["moisture"], 18.0);

        let fw = PlantMessageBuilder::firmware_telemetry("esp-01", 21.0, 40.0, 35.0, false);
        assert_eq!(fw["sensors"]["pump_active"], false);
        assert_eq!(PlantMessageBuilder::heartbeat(80.0, -60.0)["batteryLevel"], 80.0);
        assert_eq!(PlantMessageBuilder::pump("esp-01", false, 4_800)["action"], "stopped");
    }
}

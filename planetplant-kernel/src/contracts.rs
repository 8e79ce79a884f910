/**
 * CONTRATS MQTT - Routage des topics et schémas des messages capteurs
 *
 * RÔLE : Associe chaque topic entrant à un type de message (télémétrie,
 * statut, heartbeat, pompe) et à l'identifiant capteur extrait du segment `+`,
 * puis décode et valide le JSON dans une structure stricte.
 *
 * FONCTIONNEMENT :
 * - TopicPattern : "sensors/+/data" -> device_id = segment à la position du `+`
 * - Télémétrie : corps plat {temperature, humidity, moisture, light?} ou
 *   enveloppe firmware ESP32 {device_id, sensors:{...}, status:{...}}
 * - Pompe : {action: started|stopped, duration, pump_active}, publié par le
 *   firmware à chaque marche réelle (bouton local compris)
 * - Plages physiques : température -50..100 °C, humidité/sol 0..100 %
 * - Un type JSON incorrect est refusé, jamais converti
 */

use crate::config::TopicsConf;
use crate::models::PumpAction;
use serde::Deserialize;
use std::collections::BTreeMap;

pub const TEMPERATURE_RANGE: (f64, f64) = (-50.0, 100.0);
pub const PERCENT_RANGE: (f64, f64) = (0.0, 100.0);

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("invalid topic pattern '{0}': expected exactly one '+' segment")]
    InvalidPattern(String),
    #[error("no route for topic '{0}'")]
    UnknownTopic(String),
    #[error("invalid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{field}={value} outside [{min}, {max}]")]
    OutOfRange { field: &'static str, value: f64, min: f64, max: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Telemetry,
    Status,
    Heartbeat,
    Pump,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Telemetry => "telemetry",
            TopicKind::Status => "status",
            TopicKind::Heartbeat => "heartbeat",
            TopicKind::Pump => "pump",
        }
    }
}

/// Filtre MQTT avec un segment joker `+` portant l'identifiant capteur
#[derive(Debug, Clone)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<String>,
    device_index: usize,
}

impl TopicPattern {
    pub fn parse(raw: &str) -> Result<Self, ContractError> {
        let segments: Vec<String> = raw.split('/').map(str::to_string).collect();
        let wildcards: Vec<usize> = segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_str() == "+")
            .map(|(i, _)| i)
            .collect();
        if wildcards.len() != 1 || segments.iter().any(|s| s == "#") {
            return Err(ContractError::InvalidPattern(raw.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
            device_index: wildcards[0],
        })
    }

    /// Filtre à utiliser pour l'abonnement
    pub fn filter(&self) -> &str {
        &self.raw
    }

    /// Extrait l'identifiant capteur si le topic correspond
    pub fn device_id<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        for (i, (part, expected)) in parts.iter().zip(&self.segments).enumerate() {
            if i == self.device_index {
                if part.is_empty() {
                    return None;
                }
            } else if part != expected {
                return None;
            }
        }
        Some(parts[self.device_index])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub kind: TopicKind,
    pub device_id: String,
}

/// Table de routage des topics entrants + gabarit des topics de commande
#[derive(Debug, Clone)]
pub struct TopicRouter {
    routes: Vec<(TopicKind, TopicPattern)>,
    command_template: String,
}

impl TopicRouter {
    pub fn from_config(topics: &TopicsConf) -> Result<Self, ContractError> {
        Ok(Self {
            routes: vec![
                (TopicKind::Telemetry, TopicPattern::parse(&topics.telemetry)?),
                (TopicKind::Status, TopicPattern::parse(&topics.status)?),
                (TopicKind::Heartbeat, TopicPattern::parse(&topics.heartbeat)?),
                (TopicKind::Pump, TopicPattern::parse(&topics.pump)?),
            ],
            command_template: topics.command.clone(),
        })
    }

    pub fn route(&self, topic: &str) -> Result<Route, ContractError> {
        self.routes
            .iter()
            .find_map(|(kind, pattern)| {
                pattern.device_id(topic).map(|id| Route {
                    kind: *kind,
                    device_id: id.to_string(),
                })
            })
            .ok_or_else(|| ContractError::UnknownTopic(topic.to_string()))
    }

    pub fn subscriptions(&self) -> Vec<(TopicKind, String)> {
        self.routes
            .iter()
            .map(|(kind, p)| (*kind, p.filter().to_string()))
            .collect()
    }

    /// Ex: "commands/{device_id}/{command}" -> "commands/plant-1/water"
    pub fn command_topic(&self, device_id: &str, command: &str) -> String {
        self.command_template
            .replace("{device_id}", device_id)
            .replace("{command}", command)
    }
}

// ===== Payloads entrants =====

#[derive(Debug, Deserialize)]
struct FlatTelemetry {
    temperature: f64,
    humidity: f64,
    moisture: f64,
    light: Option<f64>,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FirmwareSensors {
    temperature: f64,
    humidity: f64,
    moisture: f64,
    light: Option<f64>,
    pump_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FirmwareStatus {
    wifi_rssi: Option<f64>,
    free_heap: Option<u64>,
    uptime: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FirmwareTelemetry {
    sensors: FirmwareSensors,
    status: Option<FirmwareStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TelemetryPayload {
    Flat(FlatTelemetry),
    Firmware(FirmwareTelemetry),
}

/// Relevé validé, prêt à être appliqué au registre
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub temperature: f64,
    pub humidity: f64,
    pub moisture: f64,
    pub light: Option<f64>,
    pub location: Option<String>,
    /// Présent uniquement dans l'enveloppe firmware
    pub signal_quality: Option<f64>,
    pub pump_active: Option<bool>,
    pub free_heap: Option<u64>,
    pub uptime_ms: Option<u64>,
}

fn check_range(field: &'static str, value: f64, (min, max): (f64, f64)) -> Result<(), ContractError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ContractError::OutOfRange { field, value, min, max })
    }
}

impl TelemetrySample {
    fn validate(self) -> Result<Self, ContractError> {
        check_range("temperature", self.temperature, TEMPERATURE_RANGE)?;
        check_range("humidity", self.humidity, PERCENT_RANGE)?;
        check_range("moisture", self.moisture, PERCENT_RANGE)?;
        if let Some(light) = self.light {
            check_range("light", light, (0.0, f64::MAX))?;
        }
        Ok(self)
    }
}

pub fn decode_telemetry(payload: &[u8]) -> Result<TelemetrySample, ContractError> {
    let sample = match serde_json::from_slice::<TelemetryPayload>(payload)? {
        TelemetryPayload::Flat(t) => TelemetrySample {
            temperature: t.temperature,
            humidity: t.humidity,
            moisture: t.moisture,
            light: t.light,
            location: t.location,
            signal_quality: None,
            pump_active: None,
            free_heap: None,
            uptime_ms: None,
        },
        TelemetryPayload::Firmware(fw) => {
            let status = fw.status.unwrap_or(FirmwareStatus { wifi_rssi: None, free_heap: None, uptime: None });
            TelemetrySample {
                temperature: fw.sensors.temperature,
                humidity: fw.sensors.humidity,
                moisture: fw.sensors.moisture,
                light: fw.sensors.light,
                location: None,
                signal_quality: status.wifi_rssi,
                pump_active: fw.sensors.pump_active,
                free_heap: status.free_heap,
                uptime_ms: status.uptime,
            }
        }
    };
    sample.validate()
}

#[derive(Debug, Deserialize)]
struct StatusIn {
    status: Option<String>,
    #[serde(alias = "batteryLevel")]
    battery_level: Option<f64>,
    #[serde(alias = "wifiStrength", alias = "wifi_rssi", alias = "signalQuality")]
    signal_quality: Option<f64>,
    #[serde(alias = "ipAddress")]
    ip_address: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

/// Statut libre fusionné dans la connectivité du capteur
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub reported_status: Option<String>,
    pub battery_level: Option<f64>,
    pub signal_quality: Option<f64>,
    pub ip_address: Option<String>,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl StatusUpdate {
    /// Annonce de départ (last will du capteur) : ne compte pas comme contact
    pub fn is_offline_announcement(&self) -> bool {
        self.reported_status.as_deref() == Some("offline")
    }
}

pub fn decode_status(payload: &[u8]) -> Result<StatusUpdate, ContractError> {
    let mut st: StatusIn = serde_json::from_slice(payload)?;
    if let Some(battery) = st.battery_level {
        check_range("battery_level", battery, PERCENT_RANGE)?;
    }
    st.extra.remove("device_id");
    st.extra.remove("timestamp");
    Ok(StatusUpdate {
        reported_status: st.status,
        battery_level: st.battery_level,
        signal_quality: st.signal_quality,
        ip_address: st.ip_address,
        attributes: st.extra,
    })
}

#[derive(Debug, Deserialize)]
struct HeartbeatIn {
    #[serde(alias = "batteryLevel")]
    battery_level: Option<f64>,
    #[serde(alias = "wifiStrength", alias = "wifi_rssi", alias = "signalQuality")]
    signal_quality: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeartbeatMeta {
    pub battery_level: Option<f64>,
    pub signal_quality: Option<f64>,
}

pub fn decode_heartbeat(payload: &[u8]) -> Result<HeartbeatMeta, ContractError> {
    let hb: HeartbeatIn = serde_json::from_slice(payload)?;
    if let Some(battery) = hb.battery_level {
        check_range("battery_level", battery, PERCENT_RANGE)?;
    }
    Ok(HeartbeatMeta {
        battery_level: hb.battery_level,
        signal_quality: hb.signal_quality,
    })
}

#[derive(Debug, Deserialize)]
struct PumpIn {
    action: PumpAction,
    duration: Option<u32>,
    pump_active: Option<bool>,
}

/// Marche/arrêt réel de la pompe rapporté par le capteur
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpReport {
    pub action: PumpAction,
    /// Durée prévue (started) ou effective (stopped)
    pub duration_ms: Option<u32>,
    pub active: bool,
}

pub fn decode_pump(payload: &[u8]) -> Result<PumpReport, ContractError> {
    let p: PumpIn = serde_json::from_slice(payload)?;
    Ok(PumpReport {
        action: p.action,
        duration_ms: p.duration,
        active: p.pump_active.unwrap_or(p.action == PumpAction::Started),
    })
}

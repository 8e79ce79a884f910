/**
 * MODÈLES - Capteurs/plantes, relevés, politique d'arrosage, événements
 *
 * RÔLE : Types partagés par le registre, le moteur de décision, la santé et
 * l'API. Les horodatages sont sérialisés en RFC3339.
 *
 * INVARIANTS :
 * - IrrigationPolicy : 0 <= moisture_min < moisture_max <= 100,
 *   duration_ms dans [1000, 30000], heures calmes dans [0, 23]
 * - Une mise à jour de politique refusée ne modifie rien (pas d'écriture partielle)
 * - IrrigationEvent est immuable une fois créé
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

pub const MIN_DURATION_MS: u32 = 1_000;
pub const MAX_DURATION_MS: u32 = 30_000;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must be within [0, 100], got {value}")]
    MoistureOutOfRange { field: &'static str, value: f64 },
    #[error("moisture_min ({min}) must be lower than moisture_max ({max})")]
    MoistureOrder { min: f64, max: f64 },
    #[error("duration_ms must be within [1000, 30000], got {0}")]
    DurationOutOfBounds(u32),
    #[error("{field} must be within [0, 23], got {value}")]
    HourOutOfRange { field: &'static str, value: u8 },
    #[error("device not found: {0}")]
    UnknownDevice(String),
}

/// Dernier relevé connu d'un capteur
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub moisture: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connectivity {
    pub online: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen_at: Option<OffsetDateTime>,
    pub signal_quality: Option<f64>,
    pub battery_level: Option<f64>,
    /// Statut annoncé par le capteur lui-même (online, offline, ...)
    pub reported_status: Option<String>,
    pub ip_address: Option<String>,
    /// Champs de statut libres fusionnés tels quels
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub pump: PumpState,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self {
            online: false,
            last_seen_at: None,
            signal_quality: None,
            battery_level: None,
            reported_status: None,
            ip_address: None,
            attributes: BTreeMap::new(),
            pump: PumpState::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpAction {
    Started,
    Stopped,
}

/// État de la pompe tel que rapporté par le capteur (bouton local compris)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PumpState {
    pub active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_stopped_at: Option<OffsetDateTime>,
    /// Durée effective de la dernière marche terminée
    pub last_run_ms: Option<u32>,
}

impl PumpState {
    pub fn apply(&mut self, action: PumpAction, duration_ms: Option<u32>, active: bool, at: OffsetDateTime) {
        self.active = active;
        match action {
            PumpAction::Started => self.last_started_at = Some(at),
            PumpAction::Stopped => {
                self.last_stopped_at = Some(at);
                if duration_ms.is_some() {
                    self.last_run_ms = duration_ms;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IrrigationStats {
    pub total_activations: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_activated_at: Option<OffsetDateTime>,
    /// Compteur du jour `activation_day` (calendrier local)
    pub activations_today: u32,
    pub activation_day: Option<Date>,
}

impl IrrigationStats {
    /// Activations réussies pour le jour donné
    pub fn activations_on(&self, day: Date) -> u32 {
        if self.activation_day == Some(day) {
            self.activations_today
        } else {
            0
        }
    }

    pub fn record(&mut self, at: OffsetDateTime) {
        let day = at.date();
        self.activations_today = self.activations_on(day) + 1;
        self.activation_day = Some(day);
        self.total_activations += 1;
        self.last_activated_at = Some(at);
    }
}

/// Fenêtre quotidienne sans arrosage automatique, [start_hour, end_hour)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl QuietHours {
    /// Gère les fenêtres à cheval sur minuit (22h -> 6h).
    /// start == end : fenêtre vide.
    pub fn contains(&self, hour: u8) -> bool {
        if self.start_hour > self.end_hour {
            hour >= self.start_hour || hour < self.end_hour
        } else {
            self.start_hour <= hour && hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrrigationPolicy {
    pub moisture_min: f64,
    pub moisture_max: f64,
    pub duration_ms: u32,
    pub max_activations_per_day: u32,
    pub quiet_hours: QuietHours,
    pub cooldown_ms: u64,
    /// Arrosage automatique actif (le déclenchement manuel reste possible)
    pub auto_enabled: bool,
}

impl Default for IrrigationPolicy {
    fn default() -> Self {
        Self {
            moisture_min: 30.0,
            moisture_max: 80.0,
            duration_ms: 10_000,
            max_activations_per_day: 6,
            quiet_hours: QuietHours { start_hour: 22, end_hour: 6 },
            cooldown_ms: 300_000,
            auto_enabled: true,
        }
    }
}

impl IrrigationPolicy {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [("moisture_min", self.moisture_min), ("moisture_max", self.moisture_max)] {
            // NaN échoue aussi à ce test
            if !(0.0..=100.0).contains(&value) {
                return Err(ValidationError::MoistureOutOfRange { field, value });
            }
        }
        if self.moisture_min >= self.moisture_max {
            return Err(ValidationError::MoistureOrder {
                min: self.moisture_min,
                max: self.moisture_max,
            });
        }
        if !(MIN_DURATION_MS..=MAX_DURATION_MS).contains(&self.duration_ms) {
            return Err(ValidationError::DurationOutOfBounds(self.duration_ms));
        }
        for (field, value) in [
            ("quiet_hours.start_hour", self.quiet_hours.start_hour),
            ("quiet_hours.end_hour", self.quiet_hours.end_hour),
        ] {
            if value > 23 {
                return Err(ValidationError::HourOutOfRange { field, value });
            }
        }
        Ok(())
    }

    /// Applique une mise à jour partielle sur une copie puis la valide.
    /// `self` n'est jamais modifié.
    pub fn patched(&self, patch: &PolicyPatch) -> Result<IrrigationPolicy, ValidationError> {
        let mut next = self.clone();
        if let Some(v) = patch.moisture_min { next.moisture_min = v; }
        if let Some(v) = patch.moisture_max { next.moisture_max = v; }
        if let Some(v) = patch.duration_ms { next.duration_ms = v; }
        if let Some(v) = patch.max_activations_per_day { next.max_activations_per_day = v; }
        if let Some(v) = patch.quiet_hours { next.quiet_hours = v; }
        if let Some(v) = patch.cooldown_ms { next.cooldown_ms = v; }
        if let Some(v) = patch.auto_enabled { next.auto_enabled = v; }
        next.validate()?;
        Ok(next)
    }
}

/// Mise à jour partielle d'une politique (API, configuration)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyPatch {
    pub moisture_min: Option<f64>,
    pub moisture_max: Option<f64>,
    pub duration_ms: Option<u32>,
    pub max_activations_per_day: Option<u32>,
    pub quiet_hours: Option<QuietHours>,
    pub cooldown_ms: Option<u64>,
    pub auto_enabled: Option<bool>,
}

/// Capteur/plante suivi par le registre
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub display_name: String,
    pub location_label: Option<String>,
    pub policy: IrrigationPolicy,
    pub connectivity: Connectivity,
    pub last_reading: Option<Reading>,
    pub irrigation_stats: IrrigationStats,
}

impl Device {
    pub fn new(id: &str, policy: IrrigationPolicy) -> Self {
        Self {
            id: id.to_string(),
            display_name: id.to_string(),
            location_label: None,
            policy,
            connectivity: Connectivity::default(),
            last_reading: None,
            irrigation_stats: IrrigationStats::default(),
        }
    }

    pub fn moisture(&self) -> Option<f64> {
        self.last_reading.as_ref().and_then(|r| r.moisture)
    }

    /// Humidité du sol connue et sous le seuil minimum
    pub fn is_moisture_deficient(&self) -> bool {
        self.moisture().is_some_and(|m| m < self.policy.moisture_min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Automatic,
    Scheduled,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Automatic => "automatic",
            TriggerType::Scheduled => "scheduled",
        }
    }
}

/// Trace d'une tentative d'arrosage (append-only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrrigationEvent {
    pub id: Uuid,
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub triggered_at: OffsetDateTime,
    pub trigger_type: TriggerType,
    pub duration_ms: u32,
    pub success: bool,
    pub reason: String,
}

impl IrrigationEvent {
    pub fn new(
        device_id: &str,
        triggered_at: OffsetDateTime,
        trigger_type: TriggerType,
        duration_ms: u32,
        success: bool,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            triggered_at,
            trigger_type,
            duration_ms,
            success,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Water,
    Config,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Water => "water",
            CommandKind::Config => "config",
        }
    }
}

// Commande kernel -> capteur, publiée sur commands/{device_id}/{command}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub command_id: Uuid,
    pub command: CommandKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    pub timestamp: String,
}

impl DeviceCommand {
    pub fn water(duration_ms: u32, at: OffsetDateTime) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            command: CommandKind::Water,
            action: Some("start".to_string()),
            duration: Some(duration_ms),
            config: None,
            timestamp: rfc3339(at),
        }
    }

    /// Arrêt immédiat de la pompe (même topic que `water`)
    pub fn stop(at: OffsetDateTime) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            command: CommandKind::Water,
            action: Some("stop".to_string()),
            duration: None,
            config: None,
            timestamp: rfc3339(at),
        }
    }

    pub fn config(policy: &IrrigationPolicy, at: OffsetDateTime) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            command: CommandKind::Config,
            action: None,
            duration: None,
            config: serde_json::to_value(policy).ok(),
            timestamp: rfc3339(at),
        }
    }
}

pub fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

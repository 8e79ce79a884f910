use crate::models::{IrrigationPolicy, PolicyPatch, ValidationError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid irrigation policy: {0}")]
    Policy(#[from] ValidationError),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub registry: RegistryConf,
    pub engine: EngineConf,
    pub health: HealthConf,
    pub storage: StorageConf,
    pub http: HttpConf,
    /// Politique appliquée aux capteurs auto-provisionnés
    pub defaults: IrrigationPolicy,
    /// Capteurs pré-enregistrés au démarrage
    pub devices: Vec<DeviceSeed>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub request_capacity: usize,
    pub topics: TopicsConf,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "planetplant-kernel".into(),
            keep_alive_secs: 60,
            username: None,
            password: None,
            connect_timeout_ms: 10_000,
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 10,
            request_capacity: 64,
            topics: TopicsConf::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TopicsConf {
    pub telemetry: String,
    pub status: String,
    pub heartbeat: String,
    /// Rapports de pompe du firmware (started/stopped)
    pub pump: String,
    pub command: String, // ex: "commands/{device_id}/{command}"
    pub system_status: String,
    pub health: String,
}

impl Default for TopicsConf {
    fn default() -> Self {
        Self {
            telemetry: "sensors/+/data".into(),
            status: "sensors/+/status".into(),
            heartbeat: "devices/+/heartbeat".into(),
            pump: "sensors/+/pump".into(),
            command: "commands/{device_id}/{command}".into(),
            system_status: "planetplant/system/status".into(),
            health: "planetplant/system/health".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RegistryConf {
    pub staleness_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConf {
    fn default() -> Self {
        Self { staleness_secs: 300, sweep_interval_secs: 60 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConf {
    pub tick_interval_secs: u64,
    /// Décalage de l'heure locale (heures calmes, quota du jour)
    pub utc_offset_hours: i8,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self { tick_interval_secs: 300, utc_offset_hours: 0 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConf {
    pub interval_secs: u64,
    pub latency_threshold_ms: u64,
    pub check_timeout_ms: u64,
    pub history_capacity: usize,
}

impl Default for HealthConf {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            latency_threshold_ms: 2_000,
            check_timeout_ms: 2_000,
            history_capacity: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Jsonl,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConf {
    pub kind: StorageKind,
    pub data_dir: String,
    /// Relevés conservés par capteur (sink mémoire)
    pub memory_capacity: usize,
    /// Écritures en attente au-delà desquelles les nouvelles sont abandonnées
    pub write_queue_capacity: usize,
    pub write_timeout_ms: u64,
}

impl Default for StorageConf {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            data_dir: "./data".into(),
            memory_capacity: 1_000,
            write_queue_capacity: 1_024,
            write_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceSeed {
    pub id: String,
    pub display_name: Option<String>,
    pub location: Option<String>,
    /// Surcharge partielle de `defaults`
    pub policy: Option<PolicyPatch>,
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults.validate()?;
        for seed in &self.devices {
            if seed.id.trim().is_empty() {
                return Err(ConfigError::Invalid("device id must not be empty".into()));
            }
            if let Some(patch) = &seed.policy {
                self.defaults.patched(patch)?;
            }
        }
        if self.mqtt.max_reconnect_attempts == 0 {
            return Err(ConfigError::Invalid("mqtt.max_reconnect_attempts must be >= 1".into()));
        }
        for (field, value) in [
            ("mqtt.reconnect_interval_ms", self.mqtt.reconnect_interval_ms),
            ("registry.staleness_secs", self.registry.staleness_secs),
            ("registry.sweep_interval_secs", self.registry.sweep_interval_secs),
            ("engine.tick_interval_secs", self.engine.tick_interval_secs),
            ("health.interval_secs", self.health.interval_secs),
            ("storage.write_timeout_ms", self.storage.write_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be > 0")));
            }
        }
        if self.health.history_capacity == 0 {
            return Err(ConfigError::Invalid("health.history_capacity must be >= 1".into()));
        }
        if self.storage.write_queue_capacity == 0 {
            return Err(ConfigError::Invalid("storage.write_queue_capacity must be >= 1".into()));
        }
        if !(-12..=14).contains(&self.engine.utc_offset_hours) {
            return Err(ConfigError::Invalid("engine.utc_offset_hours must be within [-12, 14]".into()));
        }
        Ok(())
    }

    /// Surcharges par variables d'environnement (.env compris)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("PLANETPLANT_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = std::env::var("PLANETPLANT_MQTT_PORT").ok().and_then(|p| p.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Ok(user) = std::env::var("PLANETPLANT_MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Ok(pass) = std::env::var("PLANETPLANT_MQTT_PASSWORD") {
            self.mqtt.password = Some(pass);
        }
        if let Ok(bind) = std::env::var("PLANETPLANT_HTTP_BIND") {
            self.http.bind = bind;
        }
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    let cfg: KernelConfig = serde_yaml::from_str(txt)?;
    cfg.validate()?;
    Ok(cfg)
}

pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var("PLANETPLANT_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await?;
        parse_config(&txt)?
    } else {
        tracing::warn!("[config] no {path}, using default configuration");
        KernelConfig::default()
    };
    cfg.apply_env_overrides();
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.max_reconnect_attempts, 10);
        assert_eq!(cfg.registry.staleness_secs, 300);
        assert_eq!(cfg.health.history_capacity, 100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config(
            r#"
mqtt:
  host: broker.lan
engine:
  utc_offset_hours: 2
defaults:
  moisture_min: 25
devices:
  - id: plant-1
    display_name: Basilic
    policy:
      cooldown_ms: 600000
"#,
        )
        .unwrap();
        assert_eq!(cfg.mqtt.host, "broker.lan");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.engine.utc_offset_hours, 2);
        assert_eq!(cfg.defaults.moisture_min, 25.0);
        assert_eq!(cfg.defaults.moisture_max, 80.0);
        assert_eq!(cfg.devices[0].policy.as_ref().unwrap().cooldown_ms, Some(600_000));
    }

    #[test]
    fn test_invalid_default_policy_rejected() {
        let err = parse_config("defaults:\n  moisture_min: 90\n  moisture_max: 40\n").unwrap_err();
        assert!(matches!(err, ConfigError::Policy(_)));
    }

    #[test]
    fn test_invalid_seed_policy_rejected() {
        let err = parse_config("devices:\n  - id: p\n    policy:\n      duration_ms: 60000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Policy(ValidationError::DurationOutOfBounds(60_000))));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for yaml in [
            "engine:\n  tick_interval_secs: 0\n",
            "registry:\n  sweep_interval_secs: 0\n",
            "registry:\n  staleness_secs: 0\n",
            "health:\n  interval_secs: 0\n",
            "mqtt:\n  reconnect_interval_ms: 0\n",
            "storage:\n  write_queue_capacity: 0\n",
        ] {
            assert!(matches!(parse_config(yaml), Err(ConfigError::Invalid(_))), "{yaml}");
        }
    }

    #[test]
    fn test_storage_kind_parses() {
        let cfg = parse_config("storage:\n  kind: jsonl\n  data_dir: /var/lib/planetplant\n").unwrap();
        assert_eq!(cfg.storage.kind, StorageKind::Jsonl);
    }
}

/**
 * SANTÉ SYSTÈME - Agrégation transport / stockage / moteur / registre
 *
 * RÔLE :
 * Calcule un instantané de santé global sans modifier les composants
 * interrogés, dérive les alertes et garde un historique borné des résumés
 * (tendance pour le dashboard).
 *
 * FONCTIONNEMENT :
 * - transport : connecté = healthy, tout autre état = unhealthy
 * - storage : sonde aller-retour bornée; erreur, timeout ou latence au-delà
 *   du seuil = unhealthy
 * - engine : ordonnanceur arrêté = unhealthy, dernier tick plus vieux que
 *   deux intervalles = degraded
 * - registry : un capteur hors ligne ou plus de 50% en déficit = degraded
 * - overall = pire statut des composants; une alerte par composant non sain
 *   (critical si unhealthy, warning si degraded)
 * - publication périodique (1 min) sur le broker + notification sur le bus
 */

use crate::clock::SharedClock;
use crate::config::HealthConf;
use crate::engine::SharedIrrigationEngine;
use crate::events::{CoreEvent, EventBus};
use crate::ingest::{IngestCounters, Ingestor};
use crate::models::Device;
use crate::mqtt::{LinkState, SharedTransport};
use crate::registry::SharedDeviceRegistry;
use crate::sink::{SinkCounters, SinkHandle, SinkInfo, StorageCheck};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub detail: String,
}

impl ComponentHealth {
    fn new(status: HealthStatus, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub component: String,
    pub severity: AlertSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub deficient: usize,
}

impl DeviceSummary {
    pub fn from_devices(devices: &[Device]) -> Self {
        let online = devices.iter().filter(|d| d.connectivity.online).count();
        Self {
            total: devices.len(),
            online,
            offline: devices.len() - online,
            deficient: devices.iter().filter(|d| d.is_moisture_deficient()).count(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub overall: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub alerts: Vec<Alert>,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    pub devices: DeviceSummary,
    pub link: LinkState,
    pub mqtt_reconnects: u32,
    pub storage: StorageCheck,
    pub storage_backend: SinkInfo,
    pub sink: SinkCounters,
    pub ingest: IngestCounters,
    pub uptime_seconds: u64,
    pub memory_usage_mb: Option<f32>,
}

impl HealthSnapshot {
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            observed_at: self.observed_at,
            overall: self.overall,
            alert_count: self.alerts.len(),
        }
    }
}

/// Entrée de l'historique de tendance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    pub overall: HealthStatus,
    pub alert_count: usize,
}

pub fn transport_health(link: LinkState, reconnects: u32) -> ComponentHealth {
    match link {
        LinkState::Connected => ComponentHealth::new(HealthStatus::Healthy, format!("connected ({reconnects} reconnects)")),
        LinkState::Connecting => ComponentHealth::new(HealthStatus::Unhealthy, "connecting to broker"),
        LinkState::Reconnecting { attempt } => {
            ComponentHealth::new(HealthStatus::Unhealthy, format!("broker unreachable, reconnect attempt {attempt}"))
        }
        LinkState::Failed => ComponentHealth::new(HealthStatus::Unhealthy, "reconnection abandoned"),
        LinkState::ShutDown => ComponentHealth::new(HealthStatus::Unhealthy, "connection shut down"),
    }
}

pub fn storage_health(check: &StorageCheck, latency_threshold_ms: u64) -> ComponentHealth {
    match &check.error {
        Some(e) => ComponentHealth::new(HealthStatus::Unhealthy, format!("storage unreachable: {e}")),
        None if check.latency_ms > latency_threshold_ms => ComponentHealth::new(
            HealthStatus::Unhealthy,
            format!("round-trip {}ms above {}ms", check.latency_ms, latency_threshold_ms),
        ),
        None => ComponentHealth::new(HealthStatus::Healthy, format!("round-trip {}ms", check.latency_ms)),
    }
}

pub fn engine_health(running: bool, last_tick: Option<OffsetDateTime>, interval: Duration, now: OffsetDateTime) -> ComponentHealth {
    if !running {
        return ComponentHealth::new(HealthStatus::Unhealthy, "scheduler not running");
    }
    let Some(last) = last_tick else {
        return ComponentHealth::new(HealthStatus::Healthy, "scheduler running, no tick yet");
    };
    let age = now - last;
    let max_age = time::Duration::try_from(interval * 2).unwrap_or(time::Duration::MAX);
    if age > max_age {
        ComponentHealth::new(HealthStatus::Degraded, format!("last tick {}s ago", age.whole_seconds()))
    } else {
        ComponentHealth::new(HealthStatus::Healthy, format!("last tick {}s ago", age.whole_seconds().max(0)))
    }
}

pub fn registry_health(devices: &DeviceSummary) -> ComponentHealth {
    let detail = format!(
        "{} devices, {} offline, {} moisture-deficient",
        devices.total, devices.offline, devices.deficient
    );
    let status = if devices.offline > 0 || devices.deficient * 2 > devices.total {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    ComponentHealth::new(status, detail)
}

/// Une alerte par composant non sain, critiques d'abord
pub fn derive_alerts(components: &BTreeMap<String, ComponentHealth>) -> Vec<Alert> {
    let mut alerts: Vec<Alert> = components
        .iter()
        .filter_map(|(name, c)| {
            let severity = match c.status {
                HealthStatus::Healthy => return None,
                HealthStatus::Degraded => AlertSeverity::Warning,
                HealthStatus::Unhealthy => AlertSeverity::Critical,
            };
            Some(Alert { component: name.clone(), severity, message: c.detail.clone() })
        })
        .collect();
    alerts.sort_by_key(|a| a.severity != AlertSeverity::Critical);
    alerts
}

pub fn overall_status(components: &BTreeMap<String, ComponentHealth>) -> HealthStatus {
    components.values().map(|c| c.status).max().unwrap_or(HealthStatus::Healthy)
}

pub struct HealthAggregator {
    transport: SharedTransport,
    registry: SharedDeviceRegistry,
    engine: SharedIrrigationEngine,
    sink: SinkHandle,
    ingestor: Arc<Ingestor>,
    bus: EventBus,
    clock: SharedClock,
    conf: HealthConf,
    started: Instant,
    history: Mutex<VecDeque<HealthSummary>>,
}

pub type SharedHealthAggregator = Arc<HealthAggregator>;

impl HealthAggregator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: SharedTransport,
        registry: SharedDeviceRegistry,
        engine: SharedIrrigationEngine,
        sink: SinkHandle,
        ingestor: Arc<Ingestor>,
        bus: EventBus,
        clock: SharedClock,
        conf: HealthConf,
    ) -> Self {
        Self {
            transport,
            registry,
            engine,
            sink,
            ingestor,
            bus,
            clock,
            conf,
            started: Instant::now(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Interroge chaque composant, agrège, archive le résumé
    pub async fn snapshot(&self) -> HealthSnapshot {
        let storage = self.sink.check(Duration::from_millis(self.conf.check_timeout_ms)).await;
        let now = self.clock.now();
        let link = self.transport.link_state();
        let reconnects = self.transport.reconnects();
        let devices = DeviceSummary::from_devices(&self.registry.all());

        let mut components = BTreeMap::new();
        components.insert("transport".to_string(), transport_health(link, reconnects));
        components.insert("storage".to_string(), storage_health(&storage, self.conf.latency_threshold_ms));
        components.insert(
            "engine".to_string(),
            engine_health(self.engine.is_running(), self.engine.last_tick(), self.engine.tick_interval(), now),
        );
        components.insert("registry".to_string(), registry_health(&devices));

        let snapshot = HealthSnapshot {
            overall: overall_status(&components),
            alerts: derive_alerts(&components),
            components,
            observed_at: now,
            devices,
            link,
            mqtt_reconnects: reconnects,
            storage,
            storage_backend: self.sink.info(),
            sink: self.sink.counters(),
            ingest: self.ingestor.counters(),
            uptime_seconds: self.started.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
        };

        let summary = snapshot.summary();
        {
            let mut history = self.history.lock();
            history.push_back(summary.clone());
            while history.len() > self.conf.history_capacity {
                history.pop_front();
            }
        }
        self.bus.emit(CoreEvent::HealthUpdated { summary });
        snapshot
    }

    /// Résumés retenus, du plus ancien au plus récent
    pub fn history(&self) -> Vec<HealthSummary> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn spawn_health_publisher(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let every = Duration::from_secs(self.conf.interval_secs.max(1));
        info!("[health] publishing system health every {}s", every.as_secs());
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let snapshot = self.snapshot().await;
                        if snapshot.overall != HealthStatus::Healthy {
                            warn!(overall = ?snapshot.overall, alerts = snapshot.alerts.len(), "[health] system not healthy");
                        }
                        match serde_json::to_string(&snapshot) {
                            Ok(payload) => {
                                if self.transport.publish_health(payload).await {
                                    debug!("[health] published (uptime: {}s, devices: {})",
                                        snapshot.uptime_seconds, snapshot.devices.total);
                                }
                            }
                            Err(e) => warn!("[health] cannot encode snapshot: {e}"),
                        }
                    }
                }
            }
            debug!("[health] publisher stopped");
        })
    }
}

fn get_memory_usage_mb() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let kb = status
            .lines()
            .find(|l| l.starts_with("VmRSS:"))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()?;
        Some(kb as f32 / 1024.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

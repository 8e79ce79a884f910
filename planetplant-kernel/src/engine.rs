/**
 * MOTEUR D'ARROSAGE - Décision par capteur + ordonnanceur périodique
 *
 * RÔLE :
 * Décide si un arrosage est permis maintenant, publie la commande via la
 * passerelle et trace chaque tentative. Ne doit jamais sur-arroser.
 *
 * FONCTIONNEMENT :
 * - `decide` = fonction pure (capteur + déclencheur + heure locale)
 *   1. automatique/planifié : hors ligne, pas de relevé, pas de déficit,
 *      automatisme désactivé, heures calmes
 *   2. tous déclencheurs : quota journalier puis cooldown
 *   Premier verrou qui échoue = raison rapportée
 * - `evaluate` : une évaluation à la fois par capteur (verrou async), relit
 *   une copie cohérente du registre, publie, trace l'événement
 * - Publication échouée -> événement en échec "transport unavailable", les
 *   compteurs ne bougent pas; pas de nouvel essai avant le tick suivant
 * - `spawn_scheduler` : tick toutes les 5 min, capteurs évalués en parallèle
 */

use crate::clock::SharedClock;
use crate::events::{CoreEvent, EventBus};
use crate::models::{Device, DeviceCommand, IrrigationEvent, QuietHours, TriggerType};
use crate::mqtt::SharedTransport;
use crate::registry::SharedDeviceRegistry;
use crate::sink::SinkHandle;
use futures::future::join_all;
use parking_lot::Mutex;
use rumqttc::QoS;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Raison pour laquelle un arrosage n'a pas eu lieu
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    UnknownDevice,
    Offline,
    NoReading,
    NoDeficit,
    AutoDisabled,
    InvalidPolicy,
    QuietHours,
    DailyCap,
    Cooldown,
    TransportUnavailable,
}

impl GateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateReason::UnknownDevice => "unknown_device",
            GateReason::Offline => "offline",
            GateReason::NoReading => "no_reading",
            GateReason::NoDeficit => "no_deficit",
            GateReason::AutoDisabled => "auto_disabled",
            GateReason::InvalidPolicy => "invalid_policy",
            GateReason::QuietHours => "quiet_hours",
            GateReason::DailyCap => "daily_cap",
            GateReason::Cooldown => "cooldown",
            GateReason::TransportUnavailable => "transport_unavailable",
        }
    }
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Irrigate { duration_ms: u32 },
    Skip(GateReason),
}

pub fn in_quiet_hours(quiet: &QuietHours, now: OffsetDateTime) -> bool {
    quiet.contains(now.hour())
}

/// Évalue la chaîne de verrous pour un capteur à l'instant `now` (heure locale)
pub fn decide(device: &Device, trigger: TriggerType, now: OffsetDateTime) -> Decision {
    let policy = &device.policy;
    if policy.validate().is_err() {
        return Decision::Skip(GateReason::InvalidPolicy);
    }

    if trigger != TriggerType::Manual {
        if !device.connectivity.online {
            return Decision::Skip(GateReason::Offline);
        }
        match device.moisture() {
            None => return Decision::Skip(GateReason::NoReading),
            Some(m) if m >= policy.moisture_min => return Decision::Skip(GateReason::NoDeficit),
            Some(_) => {}
        }
        if !policy.auto_enabled {
            return Decision::Skip(GateReason::AutoDisabled);
        }
        if in_quiet_hours(&policy.quiet_hours, now) {
            return Decision::Skip(GateReason::QuietHours);
        }
    }

    let stats = &device.irrigation_stats;
    if stats.activations_on(now.date()) >= policy.max_activations_per_day {
        return Decision::Skip(GateReason::DailyCap);
    }
    if let Some(last) = stats.last_activated_at {
        let cooldown = time::Duration::milliseconds(policy.cooldown_ms.min(i64::MAX as u64) as i64);
        if now - last < cooldown {
            return Decision::Skip(GateReason::Cooldown);
        }
    }

    Decision::Irrigate { duration_ms: policy.duration_ms }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    Skipped(GateReason),
    Watered(IrrigationEvent),
    Failed(IrrigationEvent),
}

impl EvaluationOutcome {
    pub fn is_watered(&self) -> bool {
        matches!(self, EvaluationOutcome::Watered(_))
    }
}

/// Plancher de l'intervalle du moteur (`interval(0)` panique)
pub const MIN_TICK_INTERVAL: Duration = Duration::from_secs(1);

pub struct IrrigationEngine {
    registry: SharedDeviceRegistry,
    transport: SharedTransport,
    sink: SinkHandle,
    bus: EventBus,
    clock: SharedClock,
    tick_interval: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    journal: Mutex<HashMap<String, VecDeque<IrrigationEvent>>>,
    journal_capacity: usize,
    running: AtomicBool,
    last_tick: Mutex<Option<OffsetDateTime>>,
}

pub type SharedIrrigationEngine = Arc<IrrigationEngine>;

impl IrrigationEngine {
    pub fn new(
        registry: SharedDeviceRegistry,
        transport: SharedTransport,
        sink: SinkHandle,
        bus: EventBus,
        clock: SharedClock,
        tick_interval: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            sink,
            bus,
            clock,
            tick_interval: tick_interval.max(MIN_TICK_INTERVAL),
            locks: Mutex::new(HashMap::new()),
            journal: Mutex::new(HashMap::new()),
            journal_capacity: 200,
            running: AtomicBool::new(false),
            last_tick: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    fn device_lock(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub async fn evaluate(&self, device_id: &str, trigger: TriggerType) -> EvaluationOutcome {
        // Capteur inconnu : aucun verrou créé pour lui
        if self.registry.get(device_id).is_none() {
            return EvaluationOutcome::Skipped(GateReason::UnknownDevice);
        }
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let Some(device) = self.registry.get(device_id) else {
            return EvaluationOutcome::Skipped(GateReason::UnknownDevice);
        };
        let now = self.clock.now();

        let duration_ms = match decide(&device, trigger, now) {
            Decision::Irrigate { duration_ms } => duration_ms,
            Decision::Skip(GateReason::InvalidPolicy) => {
                error!(device_id, policy = ?device.policy, "[engine] invalid policy reached the engine, device skipped");
                return EvaluationOutcome::Skipped(GateReason::InvalidPolicy);
            }
            Decision::Skip(reason) => {
                debug!(device_id, trigger = trigger.as_str(), %reason, "[engine] irrigation gated");
                return EvaluationOutcome::Skipped(reason);
            }
        };

        let command = DeviceCommand::water(duration_ms, now);
        let sent = self.transport.publish_command(device_id, &command, QoS::AtLeastOnce).await;

        let event = if sent {
            self.registry.record_activation(device_id, now);
            let reason = match (trigger, device.moisture()) {
                (TriggerType::Manual, _) => "manual request".to_string(),
                (_, Some(m)) => format!("moisture {m:.1}% below {:.1}%", device.policy.moisture_min),
                (_, None) => trigger.as_str().to_string(),
            };
            info!(device_id, duration_ms, trigger = trigger.as_str(), "[engine] watering started");
            IrrigationEvent::new(device_id, now, trigger, duration_ms, true, reason)
        } else {
            warn!(device_id, trigger = trigger.as_str(), "[engine] transport unavailable, watering not sent");
            IrrigationEvent::new(device_id, now, trigger, duration_ms, false, "transport unavailable")
        };

        self.journal_push(event.clone());
        self.sink.record_event(event.clone());
        self.bus.emit(CoreEvent::IrrigationRecorded { event: event.clone() });

        if sent {
            EvaluationOutcome::Watered(event)
        } else {
            EvaluationOutcome::Failed(event)
        }
    }

    fn journal_push(&self, event: IrrigationEvent) {
        let mut journal = self.journal.lock();
        let entries = journal.entry(event.device_id.clone()).or_default();
        entries.push_back(event);
        while entries.len() > self.journal_capacity {
            entries.pop_front();
        }
    }

    /// Derniers événements d'un capteur, le plus récent en premier
    pub fn recent_events(&self, device_id: &str, limit: usize) -> Vec<IrrigationEvent> {
        self.journal
            .lock()
            .get(device_id)
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Un passage du moteur sur tous les capteurs connus
    pub async fn run_tick(&self) -> Vec<(String, EvaluationOutcome)> {
        *self.last_tick.lock() = Some(self.clock.now());
        let ids: Vec<String> = self.registry.all().into_iter().map(|d| d.id).collect();

        let outcomes = join_all(ids.iter().map(|id| self.evaluate(id, TriggerType::Automatic))).await;
        let watered = outcomes.iter().filter(|o| o.is_watered()).count();
        debug!("[engine] tick evaluated {} devices, {} watered", ids.len(), watered);
        ids.into_iter().zip(outcomes).collect()
    }

    pub fn spawn_scheduler(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        info!("[engine] scheduler started (every {}s)", self.tick_interval.as_secs());
        tokio::spawn(async move {
            self.running.store(true, Ordering::SeqCst);
            let mut interval = tokio::time::interval(self.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.run_tick().await;
                    }
                }
            }
            self.running.store(false, Ordering::SeqCst);
            info!("[engine] scheduler stopped");
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn last_tick(&self) -> Option<OffsetDateTime> {
        *self.last_tick.lock()
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }
}

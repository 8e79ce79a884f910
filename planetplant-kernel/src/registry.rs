/**
 * REGISTRE DES CAPTEURS - Source de vérité unique de l'état des plantes
 *
 * RÔLE : Table en mémoire des capteurs connus : dernier relevé, connectivité,
 * statistiques d'arrosage, politique. Seul composant autorisé à muter l'état
 * d'un capteur; les autres lisent des copies (snapshots).
 *
 * FONCTIONNEMENT :
 * - Une fiche = un Mutex dédié : deux mises à jour d'un même capteur ne
 *   s'entrelacent jamais, deux capteurs différents ne se bloquent pas
 * - Capteur inconnu -> auto-provisionné avec la politique par défaut
 * - last_seen_at ne recule jamais
 * - Balayage périodique : online -> offline si silence > fenêtre d'inactivité,
 *   une seule notification par transition
 */

use crate::clock::SharedClock;
use crate::config::DeviceSeed;
use crate::contracts::{HeartbeatMeta, PumpReport, StatusUpdate};
use crate::events::{CoreEvent, EventBus};
use crate::models::{Connectivity, Device, IrrigationPolicy, PolicyPatch, Reading, ValidationError};
use crate::state::{new_rw_state, new_state, Shared, SharedRw};
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct DeviceRegistry {
    devices: SharedRw<HashMap<String, Shared<Device>>>,
    defaults: IrrigationPolicy,
    staleness: Duration,
    clock: SharedClock,
    bus: EventBus,
}

pub type SharedDeviceRegistry = Arc<DeviceRegistry>;

impl DeviceRegistry {
    pub fn new(defaults: IrrigationPolicy, staleness: std::time::Duration, clock: SharedClock, bus: EventBus) -> Self {
        Self {
            devices: new_rw_state(HashMap::new()),
            defaults,
            staleness: Duration::try_from(staleness).unwrap_or(Duration::minutes(5)),
            clock,
            bus,
        }
    }

    /// Pré-enregistre un capteur depuis la configuration (reste offline
    /// jusqu'au premier message)
    pub fn register_seed(&self, seed: &DeviceSeed) -> Result<Device, ValidationError> {
        let policy = match &seed.policy {
            Some(patch) => self.defaults.patched(patch)?,
            None => self.defaults.clone(),
        };
        let mut device = Device::new(&seed.id, policy);
        if let Some(name) = &seed.display_name {
            device.display_name = name.clone();
        }
        device.location_label = seed.location.clone();

        let mut map = self.devices.write();
        let record = map
            .entry(seed.id.clone())
            .or_insert_with(|| new_state(device));
        let snapshot = record.lock().clone();
        info!("[registry] registered device {}", seed.id);
        Ok(snapshot)
    }

    /// Fiche du capteur, créée à la volée si inconnue
    fn record(&self, device_id: &str) -> Shared<Device> {
        if let Some(record) = self.devices.read().get(device_id) {
            return record.clone();
        }
        let mut map = self.devices.write();
        if let Some(record) = map.get(device_id) {
            return record.clone();
        }
        let record = new_state(Device::new(device_id, self.defaults.clone()));
        map.insert(device_id.to_string(), record.clone());
        drop(map);

        info!(device_id, "[registry] auto-provisioned unknown device");
        self.bus.emit(CoreEvent::DeviceProvisioned { device_id: device_id.to_string() });
        record
    }

    /// Applique une mutation sous le verrou de la fiche; notifie un retour en ligne
    fn mutate<F>(&self, device_id: &str, contact: bool, apply: F) -> Device
    where
        F: FnOnce(&mut Device),
    {
        let record = self.record(device_id);
        let now = self.clock.now();
        let (snapshot, came_online) = {
            let mut device = record.lock();
            let mut came_online = false;
            if contact {
                let seen = match device.connectivity.last_seen_at {
                    Some(prev) if prev > now => prev,
                    _ => now,
                };
                device.connectivity.last_seen_at = Some(seen);
                if !device.connectivity.online {
                    device.connectivity.online = true;
                    came_online = true;
                }
            }
            apply(&mut *device);
            (device.clone(), came_online)
        };

        if came_online {
            info!(device_id, "[registry] device online");
            self.bus.emit(CoreEvent::DeviceStatusChanged {
                device_id: device_id.to_string(),
                online: true,
                at: now,
            });
        }
        snapshot
    }

    pub fn upsert_reading(&self, device_id: &str, reading: Reading) -> Device {
        self.mutate(device_id, true, |device| {
            device.last_reading = Some(reading);
        })
    }

    pub fn upsert_status(&self, device_id: &str, status: StatusUpdate) -> Device {
        let contact = !status.is_offline_announcement();
        if !contact {
            debug!(device_id, "[registry] device announced offline");
        }
        self.mutate(device_id, contact, |device| merge_status(&mut device.connectivity, status))
    }

    pub fn touch_heartbeat(&self, device_id: &str, meta: HeartbeatMeta) -> Device {
        self.mutate(device_id, true, |device| {
            if meta.battery_level.is_some() {
                device.connectivity.battery_level = meta.battery_level;
            }
            if meta.signal_quality.is_some() {
                device.connectivity.signal_quality = meta.signal_quality;
            }
        })
    }

    /// Relevé, localisation annoncée et état de la carte appliqués sous un
    /// seul verrou : un lecteur ne voit jamais un relevé sans son contexte
    pub fn upsert_telemetry(
        &self,
        device_id: &str,
        reading: Reading,
        location: Option<String>,
        pump_active: Option<bool>,
        extras: StatusUpdate,
    ) -> Device {
        self.mutate(device_id, true, |device| {
            device.last_reading = Some(reading);
            if device.location_label.is_none() {
                device.location_label = location;
            }
            if let Some(active) = pump_active {
                device.connectivity.pump.active = active;
            }
            merge_status(&mut device.connectivity, extras);
        })
    }

    /// Marche/arrêt réel de la pompe rapporté par le capteur
    pub fn record_pump(&self, device_id: &str, report: PumpReport) -> Device {
        let at = self.clock.now();
        self.mutate(device_id, true, |device| {
            device.connectivity.pump.apply(report.action, report.duration_ms, report.active, at);
        })
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        let record = self.devices.read().get(device_id).cloned()?;
        let snapshot = record.lock().clone();
        Some(snapshot)
    }

    /// Copie de tous les capteurs, triés par identifiant
    pub fn all(&self) -> Vec<Device> {
        let records: Vec<Shared<Device>> = self.devices.read().values().cloned().collect();
        let mut devices: Vec<Device> = records.iter().map(|r| r.lock().clone()).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Met à jour la politique d'arrosage; en cas de refus la politique
    /// précédente reste intacte
    pub fn update_config(&self, device_id: &str, patch: &PolicyPatch) -> Result<Device, ValidationError> {
        let record = self
            .devices
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownDevice(device_id.to_string()))?;

        let snapshot = {
            let mut device = record.lock();
            let next = device.policy.patched(patch).map_err(|e| {
                warn!(device_id, error = %e, "[registry] policy update rejected");
                e
            })?;
            device.policy = next;
            device.clone()
        };

        info!(device_id, "[registry] policy updated");
        self.bus.emit(CoreEvent::PolicyUpdated {
            device_id: device_id.to_string(),
            policy: snapshot.policy.clone(),
        });
        Ok(snapshot)
    }

    /// Enregistre une activation réussie (appelé par le moteur de décision)
    pub fn record_activation(&self, device_id: &str, at: OffsetDateTime) -> Option<Device> {
        let record = self.devices.read().get(device_id).cloned()?;
        let mut device = record.lock();
        device.irrigation_stats.record(at);
        Some(device.clone())
    }

    /// Passe offline les capteurs silencieux depuis plus que la fenêtre
    /// d'inactivité; retourne les identifiants qui viennent de basculer
    pub fn sweep(&self) -> Vec<String> {
        let now = self.clock.now();
        let records: Vec<(String, Shared<Device>)> = self
            .devices
            .read()
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();

        let mut flipped = Vec::new();
        for (id, record) in records {
            let mut device = record.lock();
            if !device.connectivity.online {
                continue;
            }
            let stale = match device.connectivity.last_seen_at {
                Some(seen) => now - seen > self.staleness,
                None => true,
            };
            if stale {
                device.connectivity.online = false;
                flipped.push(id);
            }
        }

        for id in &flipped {
            warn!(device_id = %id, "[registry] device offline (silent > {}s)", self.staleness.whole_seconds());
            self.bus.emit(CoreEvent::DeviceStatusChanged {
                device_id: id.clone(),
                online: false,
                at: now,
            });
        }
        flipped
    }

    /// Balayage d'inactivité périodique (toutes les minutes par défaut)
    pub fn spawn_sweeper(self: Arc<Self>, every: std::time::Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let every = every.max(std::time::Duration::from_secs(1));
        info!("[registry] starting staleness sweep (every {}s)", every.as_secs());
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.sweep();
                    }
                }
            }
            debug!("[registry] sweep stopped");
        })
    }
}

fn merge_status(conn: &mut Connectivity, status: StatusUpdate) {
    if status.reported_status.is_some() {
        conn.reported_status = status.reported_status;
    }
    if status.battery_level.is_some() {
        conn.battery_level = status.battery_level;
    }
    if status.signal_quality.is_some() {
        conn.signal_quality = status.signal_quality;
    }
    if status.ip_address.is_some() {
        conn.ip_address = status.ip_address;
    }
    conn.attributes.extend(status.attributes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::models::QuietHours;
    use proptest::prelude::*;
    use time::macros::datetime;

    fn setup() -> (Arc<ManualClock>, EventBus, DeviceRegistry) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00 UTC)));
        let bus = EventBus::default();
        let registry = DeviceRegistry::new(
            IrrigationPolicy::default(),
            std::time::Duration::from_secs(300),
            clock.clone(),
            bus.clone(),
        );
        (clock, bus, registry)
    }

    fn reading(moisture: f64, at: OffsetDateTime) -> Reading {
        Reading { moisture: Some(moisture), temperature: Some(20.0), humidity: Some(50.0), light: None, observed_at: at }
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn unknown_device_is_auto_provisioned() {
        let (clock, bus, registry) = setup();
        let mut rx = bus.subscribe();
        let device = registry.upsert_reading("plant-1", reading(42.0, clock.now()));

        assert_eq!(device.policy, IrrigationPolicy::default());
        assert!(device.connectivity.online);
        assert_eq!(device.moisture(), Some(42.0));
        let events = drain(&mut rx);
        assert!(events.contains(&CoreEvent::DeviceProvisioned { device_id: "plant-1".into() }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn last_seen_never_moves_backwards() {
        let (clock, _bus, registry) = setup();
        registry.touch_heartbeat("p", HeartbeatMeta::default());
        let first = registry.get("p").unwrap().connectivity.last_seen_at;

        clock.advance(Duration::minutes(-10));
        registry.touch_heartbeat("p", HeartbeatMeta { battery_level: Some(80.0), signal_quality: None });
        let device = registry.get("p").unwrap();
        assert_eq!(device.connectivity.last_seen_at, first);
        assert_eq!(device.connectivity.battery_level, Some(80.0));
    }

    #[test]
    fn sweep_flips_offline_once_per_transition() {
        let (clock, bus, registry) = setup();
        registry.upsert_reading("plant-1", reading(50.0, clock.now()));
        let mut rx = bus.subscribe();

        clock.advance(Duration::minutes(4));
        assert!(registry.sweep().is_empty());

        clock.advance(Duration::minutes(2));
        assert_eq!(registry.sweep(), vec!["plant-1".to_string()]);
        assert!(!registry.get("plant-1").unwrap().connectivity.online);

        clock.advance(Duration::minutes(1));
        assert!(registry.sweep().is_empty());

        let offline: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, CoreEvent::DeviceStatusChanged { online: false, .. }))
            .collect();
        assert_eq!(offline.len(), 1);
    }

    #[test]
    fn contact_after_offline_notifies_online() {
        let (clock, bus, registry) = setup();
        registry.touch_heartbeat("p", HeartbeatMeta::default());
        clock.advance(Duration::minutes(6));
        registry.sweep();

        let mut rx = bus.subscribe();
        registry.touch_heartbeat("p", HeartbeatMeta::default());
        registry.touch_heartbeat("p", HeartbeatMeta::default());
        let online: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, CoreEvent::DeviceStatusChanged { online: true, .. }))
            .collect();
        assert_eq!(online.len(), 1);
    }

    #[test]
    fn offline_announcement_is_not_contact() {
        let (clock, _bus, registry) = setup();
        registry.touch_heartbeat("p", HeartbeatMeta::default());
        let seen = registry.get("p").unwrap().connectivity.last_seen_at;

        clock.advance(Duration::minutes(3));
        let status = StatusUpdate { reported_status: Some("offline".into()), ..Default::default() };
        let device = registry.upsert_status("p", status);
        assert_eq!(device.connectivity.last_seen_at, seen);
        assert_eq!(device.connectivity.reported_status.as_deref(), Some("offline"));
    }

    #[test]
    fn seeded_device_starts_offline_with_overrides() {
        let (_clock, _bus, registry) = setup();
        let seed = DeviceSeed {
            id: "basilic".into(),
            display_name: Some("Basilic".into()),
            location: Some("cuisine".into()),
            policy: Some(PolicyPatch { moisture_min: Some(40.0), ..Default::default() }),
        };
        let device = registry.register_seed(&seed).unwrap();
        assert!(!device.connectivity.online);
        assert_eq!(device.display_name, "Basilic");
        assert_eq!(device.policy.moisture_min, 40.0);

        registry.upsert_telemetry("basilic", reading(50.0, OffsetDateTime::UNIX_EPOCH), Some("balcon".into()), None, StatusUpdate::default());
        assert_eq!(registry.get("basilic").unwrap().location_label.as_deref(), Some("cuisine"));
    }

    #[test]
    fn telemetry_lands_as_one_update() {
        let (clock, bus, registry) = setup();
        let mut rx = bus.subscribe();
        let extras = StatusUpdate { signal_quality: Some(-61.0), ..Default::default() };
        let device = registry.upsert_telemetry("esp-01", reading(35.0, clock.now()), Some("serre".into()), Some(true), extras);

        assert_eq!(device.moisture(), Some(35.0));
        assert_eq!(device.location_label.as_deref(), Some("serre"));
        assert_eq!(device.connectivity.signal_quality, Some(-61.0));
        assert!(device.connectivity.pump.active);

        let online: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, CoreEvent::DeviceStatusChanged { online: true, .. }))
            .collect();
        assert_eq!(online.len(), 1);
    }

    #[test]
    fn pump_reports_update_connectivity() {
        use crate::models::PumpAction;

        let (clock, _bus, registry) = setup();
        let started = clock.now();
        registry.record_pump("p", PumpReport { action: PumpAction::Started, duration_ms: Some(5_000), active: true });
        clock.advance(Duration::seconds(5));
        let device = registry.record_pump("p", PumpReport { action: PumpAction::Stopped, duration_ms: Some(4_900), active: false });

        let pump = &device.connectivity.pump;
        assert!(!pump.active);
        assert_eq!(pump.last_started_at, Some(started));
        assert_eq!(pump.last_run_ms, Some(4_900));
        assert!(device.connectivity.online);
    }

    #[test]
    fn update_config_unknown_device() {
        let (_clock, _bus, registry) = setup();
        let err = registry.update_config("ghost", &PolicyPatch::default()).unwrap_err();
        assert_eq!(err, ValidationError::UnknownDevice("ghost".into()));
    }

    #[test]
    fn update_config_applies_valid_patch() {
        let (clock, bus, registry) = setup();
        registry.upsert_reading("p", reading(50.0, clock.now()));
        let mut rx = bus.subscribe();
        let patch = PolicyPatch {
            quiet_hours: Some(QuietHours { start_hour: 21, end_hour: 7 }),
            cooldown_ms: Some(60_000),
            ..Default::default()
        };
        let device = registry.update_config("p", &patch).unwrap();
        assert_eq!(device.policy.cooldown_ms, 60_000);
        assert_eq!(device.policy.quiet_hours.start_hour, 21);
        assert!(matches!(rx.try_recv(), Ok(CoreEvent::PolicyUpdated { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_flips_silent_devices() {
        let (clock, bus, registry) = setup();
        let registry = Arc::new(registry);
        registry.upsert_reading("quiet", reading(50.0, clock.now()));
        registry.upsert_reading("chatty", reading(50.0, clock.now()));
        let mut rx = bus.subscribe();

        let token = CancellationToken::new();
        let handle = registry.clone().spawn_sweeper(std::time::Duration::from_secs(60), token.clone());
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(registry.get("quiet").unwrap().connectivity.online);

        clock.advance(Duration::minutes(6));
        registry.touch_heartbeat("chatty", HeartbeatMeta::default());
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;

        assert!(!registry.get("quiet").unwrap().connectivity.online);
        assert!(registry.get("chatty").unwrap().connectivity.online);
        let offline: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, CoreEvent::DeviceStatusChanged { online: false, .. }))
            .collect();
        assert_eq!(offline.len(), 1);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_survives_zero_interval() {
        let (_clock, _bus, registry) = setup();
        let token = CancellationToken::new();
        let handle = Arc::new(registry).spawn_sweeper(std::time::Duration::ZERO, token.clone());
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert!(!handle.is_finished());
        token.cancel();
        handle.await.unwrap();
    }

    proptest! {
        #[test]
        fn rejected_policy_update_leaves_policy_identical(
            min in 0.0f64..=100.0,
            delta in 0.0f64..=50.0,
            duration in prop_oneof![0u32..1_000, 30_001u32..100_000],
            bad_order in any::<bool>(),
        ) {
            let (clock, _bus, registry) = setup();
            registry.upsert_reading("p", reading(50.0, clock.now()));
            let before = registry.get("p").unwrap().policy;

            let patch = if bad_order {
                PolicyPatch { moisture_min: Some(min), moisture_max: Some(min - delta), ..Default::default() }
            } else {
                PolicyPatch { moisture_min: Some(10.0), moisture_max: Some(90.0), duration_ms: Some(duration), ..Default::default() }
            };
            prop_assert!(registry.update_config("p", &patch).is_err());
            prop_assert_eq!(registry.get("p").unwrap().policy, before);
        }
    }
}

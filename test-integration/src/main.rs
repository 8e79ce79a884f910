//! Simulateur de capteurs PlanetPlant : publie télémétrie, heartbeat et statut
//! comme la carte ESP32, et réagit aux commandes d'arrosage du noyau.
//!
//! Une connexion MQTT par plante, comme sur le terrain : chaque client porte
//! son propre testament (`sensors/{id}/status` offline), le broker l'émet
//! pour chaque plante quand le simulateur meurt.
//!
//! Variables : SIM_BROKER, SIM_PORT, SIM_PLANTS (nombre), SIM_INTERVAL_SECS.

use anyhow::Result;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;
use tokio::time::{interval, sleep, sleep_until, Duration};

// ===== Configuration =====
const DEFAULT_BROKER: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 1883;
const CLIENT_PREFIX: &str = "planetplant-sensor-sim";
const MAX_PUMP_MS: u32 = 30_000;

// ===== Data Structures =====
#[derive(Debug, Deserialize)]
struct WaterCommand {
    action: Option<String>,
    duration: Option<u32>,
}

#[derive(Debug)]
struct SimPlant {
    id: String,
    temperature: f64,
    humidity: f64,
    moisture: f64,
    /// Début et fin prévue de l'arrosage en cours
    pump: Option<(tokio::time::Instant, tokio::time::Instant)>,
    watered_ms: u64,
}

impl SimPlant {
    fn new(index: usize) -> Self {
        Self {
            id: format!("plant-{}", index + 1),
            temperature: 21.0 + index as f64,
            humidity: 55.0,
            // plantes de plus en plus sèches pour exercer le moteur
            moisture: (60.0 - 15.0 * index as f64).max(12.0),
            pump: None,
            watered_ms: 0,
        }
    }

    /// Le sol sèche lentement, l'air suit une petite oscillation
    fn drift(&mut self, tick: u64) {
        self.moisture = (self.moisture - 0.8).max(0.0);
        self.temperature = 21.0 + ((tick as f64) / 6.0).sin() * 2.5;
        self.humidity = (55.0 + ((tick as f64) / 9.0).cos() * 8.0).clamp(0.0, 100.0);
    }

    fn start_pump(&mut self, duration_ms: u32) -> u32 {
        let duration_ms = duration_ms.min(MAX_PUMP_MS);
        let now = tokio::time::Instant::now();
        self.pump = Some((now, now + Duration::from_millis(duration_ms as u64)));
        duration_ms
    }

    /// Coupe la pompe; ~1% d'humidité du sol par seconde de marche
    fn stop_pump(&mut self) -> Option<u32> {
        let (since, _) = self.pump.take()?;
        let ran_ms = since.elapsed().as_millis().min(MAX_PUMP_MS as u128) as u32;
        self.moisture = (self.moisture + ran_ms as f64 / 1000.0).min(100.0);
        self.watered_ms += ran_ms as u64;
        Some(ran_ms)
    }

    fn telemetry(&self, uptime_ms: u128) -> serde_json::Value {
        json!({
            "device_id": self.id,
            "timestamp": uptime_ms as u64,
            "sensors": {
                "temperature": (self.temperature * 10.0).round() / 10.0,
                "humidity": (self.humidity * 10.0).round() / 10.0,
                "moisture": self.moisture.round(),
                "light": 64,
                "pump_active": self.pump.is_some()
            },
            "status": {
                "wifi_rssi": -61,
                "free_heap": 181_000,
                "uptime": uptime_ms as u64
            }
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let broker = std::env::var("SIM_BROKER").unwrap_or_else(|_| DEFAULT_BROKER.to_string());
    let port: u16 = env_or("SIM_PORT", DEFAULT_PORT);
    let count: usize = env_or("SIM_PLANTS", 3);
    let every: u64 = env_or("SIM_INTERVAL_SECS", 30);
    info!("starting sensor simulator: {count} plants -> {broker}:{port}, every {every}s");

    let started = Instant::now();
    let tasks: Vec<_> = (0..count)
        .map(|index| tokio::spawn(run_plant(SimPlant::new(index), broker.clone(), port, every, started)))
        .collect();

    for task in tasks {
        match task.await {
            Ok(Err(e)) => error!("plant task stopped: {e}"),
            Err(e) => error!("plant task panicked: {e}"),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}

/// Une carte simulée : sa propre session MQTT, son testament, ses commandes
async fn run_plant(mut plant: SimPlant, broker: String, port: u16, every: u64, started: Instant) -> Result<()> {
    let mut mqttoptions = MqttOptions::new(format!("{CLIENT_PREFIX}-{}", plant.id), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_last_will(LastWill::new(
        format!("sensors/{}/status", plant.id),
        json!({ "device_id": plant.id, "status": "offline" }).to_string(),
        QoS::AtLeastOnce,
        false,
    ));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 16);

    let mut ticker = interval(Duration::from_secs(every.max(1)));
    let mut tick: u64 = 0;

    // Boucle principale
    loop {
        let pump_deadline = plant.pump.map(|(_, until)| until);
        tokio::select! {
            _ = ticker.tick() => {
                tick += 1;
                let uptime = started.elapsed().as_millis();
                plant.drift(tick);
                let topic = format!("sensors/{}/data", plant.id);
                if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, plant.telemetry(uptime).to_string()).await {
                    error!("publish telemetry for {} failed: {e}", plant.id);
                }
                let hb = json!({ "device_id": plant.id, "status": "online", "wifi_rssi": -61, "batteryLevel": 92 });
                let _ = client.publish(format!("devices/{}/heartbeat", plant.id), QoS::AtMostOnce, false, hb.to_string()).await;
                debug!("{} moisture={:.0}% watered={}ms", plant.id, plant.moisture, plant.watered_ms);
            }
            _ = async {
                match pump_deadline {
                    Some(until) => sleep_until(until).await,
                    None => std::future::pending().await,
                }
            } => {
                if let Some(ran_ms) = plant.stop_pump() {
                    info!("{}: pump off after {ran_ms}ms", plant.id);
                    publish_pump(&client, &plant.id, "stopped", ran_ms).await;
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("{}: connected to broker", plant.id);
                    client.subscribe(format!("commands/{}/water", plant.id), QoS::AtLeastOnce).await?;
                    client.subscribe(format!("commands/{}/config", plant.id), QoS::AtLeastOnce).await?;
                    let status = json!({ "device_id": plant.id, "status": "online", "ip_address": "10.0.0.42" });
                    client.publish(format!("sensors/{}/status", plant.id), QoS::AtLeastOnce, false, status.to_string()).await?;
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if let Err(e) = handle_command(&client, &publish.topic, &publish.payload, &mut plant).await {
                        error!("error handling command from {}: {e}", publish.topic);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("{}: MQTT connection error: {e}. Reconnecting...", plant.id);
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}

async fn publish_pump(client: &AsyncClient, device_id: &str, action: &str, duration_ms: u32) {
    let report = json!({
        "device_id": device_id,
        "action": action,
        "duration": duration_ms,
        "pump_active": action == "started",
    });
    if let Err(e) = client.publish(format!("sensors/{device_id}/pump"), QoS::AtLeastOnce, false, report.to_string()).await {
        error!("publish pump report for {device_id} failed: {e}");
    }
}

async fn handle_command(client: &AsyncClient, topic: &str, payload: &[u8], plant: &mut SimPlant) -> Result<()> {
    let mut parts = topic.split('/');
    let (Some("commands"), Some(device_id), Some(kind)) = (parts.next(), parts.next(), parts.next()) else {
        warn!("unknown topic: {topic}");
        return Ok(());
    };
    if device_id != plant.id {
        debug!("command for another plant: {device_id}");
        return Ok(());
    }

    match kind {
        "water" => {
            let cmd: WaterCommand = serde_json::from_slice(payload)?;
            match cmd.action.as_deref() {
                Some("start") => {
                    let duration = plant.start_pump(cmd.duration.unwrap_or(10_000));
                    info!("{device_id}: pump on for {duration}ms");
                    publish_pump(client, device_id, "started", duration).await;
                }
                Some("stop") => {
                    if let Some(ran_ms) = plant.stop_pump() {
                        info!("{device_id}: pump stopped on request after {ran_ms}ms");
                        publish_pump(client, device_id, "stopped", ran_ms).await;
                    }
                }
                other => warn!("{device_id}: unsupported water action {other:?}"),
            }
        }
        "config" => info!("{device_id}: configuration update received"),
        other => warn!("{device_id}: unsupported command {other}"),
    }
    Ok(())
}

/**
 * PASSERELLE MQTT - Connexion broker, abonnements capteurs, commandes sortantes
 *
 * RÔLE :
 * Une seule connexion logique au broker. Reçoit télémétrie/statut/heartbeat
 * des capteurs (délégués à l'Ingestor) et publie les commandes d'arrosage et
 * de configuration.
 *
 * FONCTIONNEMENT :
 * - Last will retenu `offline` sur le topic système; `online` publié à chaque ConnAck
 * - Réabonnement aux trois classes de topics à chaque (re)connexion
 * - Erreur de boucle -> nouvel essai après un intervalle fixe, jusqu'à
 *   `max_reconnect_attempts`; au-delà la connexion est abandonnée (état
 *   Failed) sans arrêter le processus
 * - Broker absent au démarrage : passerelle rendue quand même, essais en
 *   tâche de fond, la santé signale le transport en critique
 * - Arrêt propre via CancellationToken : `offline` publié puis déconnexion
 * - État de lien exposé par un canal watch (lu par la santé et le moteur)
 */

use crate::config::{MqttConf, TopicsConf};
use crate::contracts::{ContractError, TopicRouter};
use crate::ingest::Ingestor;
use crate::models::{rfc3339, DeviceCommand};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
    ShutDown,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

/// Seule erreur fatale : la connexion au broker elle-même ne l'est jamais
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid topic configuration: {0}")]
    Topics(#[from] ContractError),
}

/// Capacité de publication utilisée par le moteur et la santé
#[async_trait]
pub trait Transport: Send + Sync {
    /// false (sans erreur) si la connexion est actuellement indisponible
    async fn publish_command(&self, device_id: &str, command: &DeviceCommand, qos: QoS) -> bool;

    async fn publish_health(&self, payload: String) -> bool;

    fn link_state(&self) -> LinkState;

    fn reconnects(&self) -> u32;
}

pub type SharedTransport = Arc<dyn Transport>;

fn status_payload(status: &str, at: Option<OffsetDateTime>) -> String {
    match at {
        Some(at) => json!({ "status": status, "timestamp": rfc3339(at) }).to_string(),
        None => json!({ "status": status }).to_string(),
    }
}

pub fn build_options(cfg: &MqttConf) -> MqttOptions {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(user, pass);
    }
    opts.set_last_will(LastWill::new(
        &cfg.topics.system_status,
        status_payload("offline", None),
        QoS::AtLeastOnce,
        true,
    ));
    opts
}

pub struct MqttGateway {
    client: AsyncClient,
    router: TopicRouter,
    topics: TopicsConf,
    link: watch::Receiver<LinkState>,
    reconnects: Arc<AtomicU32>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttGateway {
    /// Ouvre la connexion et attend le premier ConnAck (borné par
    /// `connect_timeout_ms`). Un broker injoignable n'est pas fatal : la
    /// passerelle est rendue quand même, la boucle poursuit ses essais en
    /// tâche de fond et l'état du lien (Reconnecting puis Failed) remonte
    /// dans la santé. Seuls des topics invalides sont refusés.
    pub async fn connect(cfg: &MqttConf, ingestor: Arc<Ingestor>, shutdown: CancellationToken) -> Result<Arc<Self>, ConnectError> {
        let router = TopicRouter::from_config(&cfg.topics)?;
        let (client, eventloop) = AsyncClient::new(build_options(cfg), cfg.request_capacity.max(10));
        let (link_tx, mut link_rx) = watch::channel(LinkState::Connecting);
        let reconnects = Arc::new(AtomicU32::new(0));

        info!("[mqtt] connecting to {}:{} as {}", cfg.host, cfg.port, cfg.client_id);
        let driver = EventLoopDriver {
            client: client.clone(),
            router: router.clone(),
            topics: cfg.topics.clone(),
            ingestor,
            link: link_tx,
            reconnects: reconnects.clone(),
            reconnect_interval: Duration::from_millis(cfg.reconnect_interval_ms.max(1)),
            max_attempts: cfg.max_reconnect_attempts,
        };
        let task = tokio::spawn(driver.run(eventloop, shutdown.child_token()));

        let timeout = Duration::from_millis(cfg.connect_timeout_ms);
        let _ = tokio::time::timeout(
            timeout,
            link_rx.wait_for(|s| matches!(s, LinkState::Connected | LinkState::Failed)),
        )
        .await;
        match *link_rx.borrow() {
            LinkState::Connected => {}
            LinkState::Failed => {
                error!("[mqtt] broker {}:{} unreachable, running without transport", cfg.host, cfg.port)
            }
            state => warn!(?state, "[mqtt] broker not reachable within {:?}, retrying in background", timeout),
        }

        Ok(Arc::new(Self {
            client,
            router,
            topics: cfg.topics.clone(),
            link: link_rx,
            reconnects,
            task: Mutex::new(Some(task)),
        }))
    }

    /// Attend la fin de la boucle (après annulation du token)
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn subscribe_link(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }
}

#[async_trait]
impl Transport for MqttGateway {
    async fn publish_command(&self, device_id: &str, command: &DeviceCommand, qos: QoS) -> bool {
        if !self.link_state().is_connected() {
            debug!(device_id, "[mqtt] link down, command not sent");
            return false;
        }
        let topic = self.router.command_topic(device_id, command.command.as_str());
        let payload = match serde_json::to_vec(command) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "[mqtt] cannot encode command");
                return false;
            }
        };
        // QoS 1 : le broker acquitte plus tard, ici la requête est mise en file
        match self.client.try_publish(&topic, qos, false, payload) {
            Ok(()) => {
                info!(device_id, topic = %topic, "[mqtt] command published");
                true
            }
            Err(e) => {
                warn!(device_id, error = %e, "[mqtt] command publish failed");
                false
            }
        }
    }

    async fn publish_health(&self, payload: String) -> bool {
        if !self.link_state().is_connected() {
            return false;
        }
        self.client
            .try_publish(&self.topics.health, QoS::AtMostOnce, false, payload)
            .map_err(|e| warn!(error = %e, "[mqtt] health publish failed"))
            .is_ok()
    }

    fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

struct EventLoopDriver {
    client: AsyncClient,
    router: TopicRouter,
    topics: TopicsConf,
    ingestor: Arc<Ingestor>,
    link: watch::Sender<LinkState>,
    reconnects: Arc<AtomicU32>,
    reconnect_interval: Duration,
    max_attempts: u32,
}

impl EventLoopDriver {
    async fn run(self, mut eventloop: EventLoop, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.graceful_disconnect(&mut eventloop).await;
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        attempt = 0;
                        self.on_connected();
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        self.ingestor.handle_message(&p.topic, &p.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        attempt += 1;
                        self.reconnects.fetch_add(1, Ordering::Relaxed);
                        if attempt > self.max_attempts {
                            error!("[mqtt] giving up after {} attempts: {e}", self.max_attempts);
                            self.link.send_replace(LinkState::Failed);
                            return;
                        }
                        warn!("[mqtt] connection error (attempt {attempt}/{}): {e}", self.max_attempts);
                        self.link.send_replace(LinkState::Reconnecting { attempt });
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                self.link.send_replace(LinkState::ShutDown);
                                break;
                            }
                            _ = tokio::time::sleep(self.reconnect_interval) => {}
                        }
                    }
                }
            }
        }
        debug!("[mqtt] event loop stopped");
    }

    fn on_connected(&self) {
        for (kind, filter) in self.router.subscriptions() {
            if let Err(e) = self.client.try_subscribe(&filter, QoS::AtLeastOnce) {
                warn!("[mqtt] subscribe {} ({}) failed: {e}", filter, kind.as_str());
            }
        }
        let online = status_payload("online", Some(OffsetDateTime::now_utc()));
        if let Err(e) = self.client.try_publish(&self.topics.system_status, QoS::AtLeastOnce, true, online) {
            warn!("[mqtt] online announcement failed: {e}");
        }
        self.link.send_replace(LinkState::Connected);
        info!("[mqtt] connected, subscribed to {} topic classes", self.router.subscriptions().len());
    }

    /// Publie `offline` (retenu) puis vide la file jusqu'au Disconnect
    async fn graceful_disconnect(&self, eventloop: &mut EventLoop) {
        if self.link.borrow().is_connected() {
            let offline = status_payload("offline", Some(OffsetDateTime::now_utc()));
            let _ = self.client.try_publish(&self.topics.system_status, QoS::AtLeastOnce, true, offline);
            let _ = self.client.try_disconnect();
            let flush = async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            };
            if tokio::time::timeout(Duration::from_secs(2), flush).await.is_err() {
                warn!("[mqtt] disconnect not flushed in time");
            }
        }
        self.link.send_replace(LinkState::ShutDown);
        info!("[mqtt] disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::events::EventBus;
    use crate::models::IrrigationPolicy;
    use crate::registry::DeviceRegistry;
    use crate::sink::{MemorySink, SinkHandle};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn link_state_serializes_with_tag() {
        let v = serde_json::to_value(LinkState::Reconnecting { attempt: 3 }).unwrap();
        assert_eq!(v, json!({"state": "reconnecting", "attempt": 3}));
        assert_eq!(serde_json::to_value(LinkState::Connected).unwrap(), json!({"state": "connected"}));
    }

    #[test]
    fn last_will_targets_system_topic() {
        let cfg = MqttConf::default();
        let opts = build_options(&cfg);
        let will = opts.last_will().unwrap();
        assert_eq!(will.topic, "planetplant/system/status");
        assert!(will.retain);
        assert_eq!(&will.message[..], br#"{"status":"offline"}"#);
    }

    fn ingestor(cfg: &MqttConf) -> Arc<Ingestor> {
        let clock = Arc::new(SystemClock::default());
        let bus = EventBus::default();
        let registry = Arc::new(DeviceRegistry::new(IrrigationPolicy::default(), Duration::from_secs(300), clock.clone(), bus.clone()));
        let router = TopicRouter::from_config(&cfg.topics).unwrap();
        let sink = SinkHandle::new(Arc::new(MemorySink::new(10, clock.clone())));
        Arc::new(Ingestor::new(router, registry, sink, bus, clock))
    }

    fn unreachable(connect_timeout_ms: u64, reconnect_interval_ms: u64, max_reconnect_attempts: u32) -> MqttConf {
        MqttConf {
            host: "127.0.0.1".into(),
            port: 1,
            connect_timeout_ms,
            reconnect_interval_ms,
            max_reconnect_attempts,
            ..MqttConf::default()
        }
    }

    #[tokio::test]
    async fn unreachable_broker_yields_failed_gateway() {
        let cfg = unreachable(3_000, 20, 2);
        let gateway = MqttGateway::connect(&cfg, ingestor(&cfg), CancellationToken::new()).await.unwrap();

        assert_eq!(gateway.link_state(), LinkState::Failed);
        assert_eq!(gateway.reconnects(), 3);
        assert!(!gateway.publish_health("{}".into()).await);
        let command = DeviceCommand::water(5_000, OffsetDateTime::now_utc());
        assert!(!gateway.publish_command("p", &command, QoS::AtLeastOnce).await);
        gateway.join().await;
    }

    #[tokio::test]
    async fn slow_broker_keeps_retrying_in_background() {
        let cfg = unreachable(50, 60_000, 10);
        let token = CancellationToken::new();
        let gateway = MqttGateway::connect(&cfg, ingestor(&cfg), token.clone()).await.unwrap();
        assert!(matches!(gateway.link_state(), LinkState::Connecting | LinkState::Reconnecting { .. }));

        token.cancel();
        gateway.join().await;
        assert_eq!(gateway.link_state(), LinkState::ShutDown);
    }

    #[tokio::test]
    async fn invalid_topics_are_fatal() {
        let good = MqttConf::default();
        let mut cfg = unreachable(50, 20, 1);
        cfg.topics.telemetry = "sensors/data".into();
        let result = MqttGateway::connect(&cfg, ingestor(&good), CancellationToken::new()).await;
        assert!(matches!(result, Err(ConnectError::Topics(_))));
    }

    /// Broker minimal : accepte une seule session, répond CONNACK puis coupe
    async fn one_shot_broker() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            drop(listener);
            let mut buf = [0u8; 512];
            let _ = socket.read(&mut buf).await;
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        port
    }

    #[tokio::test]
    async fn lost_session_exhausts_attempts_then_fails() {
        let port = one_shot_broker().await;
        let cfg = MqttConf { port, ..unreachable(3_000, 20, 2) };
        let gateway = MqttGateway::connect(&cfg, ingestor(&cfg), CancellationToken::new()).await.unwrap();
        assert_eq!(gateway.link_state(), LinkState::Connected);

        let mut link = gateway.subscribe_link();
        let failed = tokio::time::timeout(Duration::from_secs(5), link.wait_for(|s| *s == LinkState::Failed))
            .await
            .is_ok();
        assert!(failed);
        assert_eq!(gateway.reconnects(), 3);
        gateway.join().await;
    }
}

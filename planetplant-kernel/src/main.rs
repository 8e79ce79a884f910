/**
 * PLANETPLANT KERNEL - Point d'entrée du serveur d'irrigation
 *
 * RÔLE : Orchestration de tous les modules : config, stockage, MQTT, moteur,
 * santé, HTTP. Construit chaque composant une fois puis les relie.
 *
 * CYCLE DE VIE :
 * - Broker injoignable au démarrage -> le noyau démarre quand même, le
 *   transport est signalé critique dans la santé (topics invalides -> sortie)
 * - Ctrl-C -> annulation du token : tâches périodiques arrêtées, `offline`
 *   publié, serveur HTTP fermé proprement
 */

use anyhow::{Context, Result};
use planetplant_kernel::clock::{SharedClock, SystemClock};
use planetplant_kernel::config::{load_config, StorageKind};
use planetplant_kernel::contracts::TopicRouter;
use planetplant_kernel::engine::IrrigationEngine;
use planetplant_kernel::events::EventBus;
use planetplant_kernel::health::HealthAggregator;
use planetplant_kernel::http::{self, AppState};
use planetplant_kernel::ingest::Ingestor;
use planetplant_kernel::mqtt::{MqttGateway, SharedTransport};
use planetplant_kernel::registry::DeviceRegistry;
use planetplant_kernel::service::PlantService;
use planetplant_kernel::sink::{EventSink, JsonlSink, MemorySink, SinkHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("planetplant_kernel=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = load_config().await.context("failed to load configuration")?;
    info!("[kernel] starting (broker {}:{}, storage {:?})", cfg.mqtt.host, cfg.mqtt.port, cfg.storage.kind);

    let clock: SharedClock = Arc::new(SystemClock::with_offset_hours(cfg.engine.utc_offset_hours));
    let bus = EventBus::default();
    let shutdown = CancellationToken::new();

    // stockage
    let sink: Arc<dyn EventSink> = match cfg.storage.kind {
        StorageKind::Memory => Arc::new(MemorySink::new(cfg.storage.memory_capacity, clock.clone())),
        StorageKind::Jsonl => Arc::new(
            JsonlSink::open(&cfg.storage.data_dir, clock.clone())
                .await
                .context("failed to open jsonl storage")?,
        ),
    };
    let sink = SinkHandle::with_limits(
        sink,
        cfg.storage.write_queue_capacity,
        Duration::from_millis(cfg.storage.write_timeout_ms),
    );

    // registre + capteurs pré-configurés
    let registry = Arc::new(DeviceRegistry::new(
        cfg.defaults.clone(),
        Duration::from_secs(cfg.registry.staleness_secs),
        clock.clone(),
        bus.clone(),
    ));
    for seed in &cfg.devices {
        registry.register_seed(seed).context("invalid device seed")?;
    }

    // passerelle MQTT
    let router = TopicRouter::from_config(&cfg.mqtt.topics).context("invalid topic configuration")?;
    let ingestor = Arc::new(Ingestor::new(router, registry.clone(), sink.clone(), bus.clone(), clock.clone()));
    let gateway = MqttGateway::connect(&cfg.mqtt, ingestor.clone(), shutdown.clone())
        .await
        .context("invalid MQTT configuration")?;
    let transport: SharedTransport = gateway.clone();

    // moteur, santé, façade
    let engine = Arc::new(IrrigationEngine::new(
        registry.clone(),
        transport.clone(),
        sink.clone(),
        bus.clone(),
        clock.clone(),
        Duration::from_secs(cfg.engine.tick_interval_secs),
    ));
    let health = Arc::new(HealthAggregator::new(
        transport.clone(),
        registry.clone(),
        engine.clone(),
        sink.clone(),
        ingestor,
        bus.clone(),
        clock.clone(),
        cfg.health.clone(),
    ));
    let service = Arc::new(PlantService::new(registry.clone(), engine.clone(), health.clone(), sink, transport, bus, clock.clone()));

    // tâches périodiques
    let sweeper = registry.spawn_sweeper(Duration::from_secs(cfg.registry.sweep_interval_secs), shutdown.clone());
    let scheduler = engine.spawn_scheduler(shutdown.clone());
    let publisher = health.spawn_health_publisher(shutdown.clone());

    // arrêt sur Ctrl-C
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("[kernel] shutdown requested");
        }
        signal_token.cancel();
    });

    // HTTP
    let app = http::build_router(AppState { service, clock });
    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("cannot bind {}", cfg.http.bind))?;
    info!("[kernel] listening on http://{}", cfg.http.bind);
    let http_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { http_token.cancelled().await })
        .await
        .context("http server failed")?;

    let _ = tokio::join!(sweeper, scheduler, publisher);
    gateway.join().await;
    info!("[kernel] stopped");
    Ok(())
}

/**
 * TINYBRIDGE - Point d'entrée du bridge TinyBMS → Victron
 *
 * RÔLE : Orchestration de tous les modules : config, ingest série, CAN, MQTT,
 * WebSocket, trace et API HTTP. Chaque publisher tourne dans sa propre task
 * et ne partage avec les autres que le BridgeCore.
 */

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tinybridge_kernel::bridge::{spawn_link_monitor, BridgeCore};
use tinybridge_kernel::can::{CanPublisher, VirtualCanBus};
use tinybridge_kernel::clock::BootClock;
use tinybridge_kernel::config::load_config;
use tinybridge_kernel::http::{build_router, AppState};
use tinybridge_kernel::ingest::spawn_feed_server;
use tinybridge_kernel::mqtt::{spawn_mqtt_connection, MqttPublisher};
use tinybridge_kernel::trace::spawn_trace_writer;
use tinybridge_kernel::websocket::BroadcastServer;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tinybridge_kernel=info,tinybridge=info")),
        )
        .init();

    let config = load_config().await;
    let core = Arc::new(BridgeCore::new(config, Arc::new(BootClock::new())));
    let cfg = &core.config;

    // trace JSONL avant tout publisher pour ne perdre aucun événement
    if let Some(path) = cfg.trace.path.clone() {
        spawn_trace_writer(&core.bus, path);
    }

    // CAN : bus virtuel en mémoire, le driver matériel se branche sur CanTransport
    let can_bus = Arc::new(VirtualCanBus::new(cfg.can.rx_queue_capacity));
    tokio::spawn(CanPublisher::new(core.clone(), can_bus).run());

    spawn_link_monitor(core.clone(), Duration::from_millis(cfg.can.poll_interval_ms.max(10)));

    let mqtt = if cfg.mqtt.enabled && cfg.mqtt.is_configured() {
        let client = spawn_mqtt_connection(core.clone());
        let publisher = Arc::new(MqttPublisher::new(core.clone(), Arc::new(client)));
        tokio::spawn(publisher.clone().run());
        Some(publisher)
    } else {
        if cfg.mqtt.enabled {
            warn!("[mqtt] enabled but no broker host configured, publisher not started");
        }
        None
    };

    let ws = Arc::new(BroadcastServer::new(core.clone()));
    tokio::spawn(ws.clone().run());

    let (writes_tx, writes_rx) = mpsc::channel(cfg.uart.write_queue.max(1));
    match cfg.uart.feed_bind.clone() {
        Some(bind) => spawn_feed_server(core.clone(), bind, writes_rx),
        None => warn!("[ingest] no feed_bind configured, register writes will be refused"),
    }

    let app_state = AppState {
        core: core.clone(),
        ws,
        mqtt,
        writes: writes_tx,
        started_at: OffsetDateTime::now_utc(),
    };
    let app = build_router(app_state);

    let bind = core.config.http.bind.clone();
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("cannot bind http on {bind}"))?;
    info!("[http] listening on http://{bind}");
    axum::serve(listener, app).await.context("http server stopped")?;
    Ok(())
}

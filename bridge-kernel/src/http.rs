/**
 * API REST TINYBRIDGE - Serveur HTTP du bridge
 *
 * RÔLE :
 * Expose l'état du bridge (statut, alarmes, trace récente, catalogue MQTT,
 * matrice Victron) et le point d'entrée des écritures registres.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, routes en lecture sous /api, upgrade WebSocket sur /ws
 * - Les lectures ne modifient jamais l'état : un GET /api/status n'émet aucun événement
 * - Écriture registre : validation catalogue → file vers la passerelle série
 *
 * SÉCURITÉ :
 * - Si BRIDGE_API_KEY est défini, toute requête mutante exige le header x-api-key
 * - /health et les lectures restent accessibles sans clé
 */

use crate::bridge::BridgeCore;
use crate::error::BridgeError;
use crate::event_bus::{EventDetail, Stage, TraceRecord};
use crate::mqtt::{FunctionalReport, MqttPublisher};
use crate::registers::RegisterWrite;
use crate::status::StatusSnapshot;
use crate::topics::{CatalogSnapshot, TopicCatalog};
use crate::websocket::{ws_handler, BroadcastServer};
use axum::extract::{Path, Query, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<BridgeCore>,
    pub ws: Arc<BroadcastServer>,
    pub mqtt: Option<Arc<MqttPublisher>>,
    pub writes: mpsc::Sender<RegisterWrite>,
    pub started_at: OffsetDateTime,
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    // Lectures toujours accessibles
    if matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("BRIDGE_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("[http] rejected {} {}: missing or wrong x-api-key", req.method(), req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(get_status))
        .route("/api/alarms", get(get_alarms))
        .route("/api/events", get(get_events))
        .route("/api/mqtt/topics", get(get_topics))
        .route("/api/victron/matrix", get(get_matrix))
        .route("/api/registers", get(list_registers))
        .route("/api/registers/{address}", post(write_register))
        .route("/ws", get(ws_handler))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// GET /health
async fn health(State(app): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "started_at": app.started_at.format(&Rfc3339).unwrap_or_default(),
        "uptime_ms": app.core.now_ms(),
        "live_data": app.core.live.has_data(),
        "ws_clients": app.ws.connected_ids().len(),
    }))
}

// GET /api/status
async fn get_status(State(app): State<AppState>) -> Json<StatusSnapshot> {
    Json(app.core.status())
}

// GET /api/alarms (ledger borné + état actif)
async fn get_alarms(State(app): State<AppState>) -> Json<Value> {
    let engine = app.core.alarms.lock();
    Json(json!({
        "alarms_active": engine.alarms_active(),
        "active": engine.active(),
        "ledger": engine.ledger(),
    }))
}

#[derive(Debug, Deserialize)]
struct EventsParams {
    limit: Option<usize>,
}

// GET /api/events?limit=N (derniers enregistrements de trace)
async fn get_events(State(app): State<AppState>, Query(params): Query<EventsParams>) -> Json<Vec<TraceRecord>> {
    let mut records = app.core.bus.recent();
    if let Some(limit) = params.limit {
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
    }
    Json(records)
}

#[derive(Debug, Serialize)]
struct TopicsView {
    current: TopicCatalog,
    snapshot: CatalogSnapshot,
    issues: Vec<String>,
}

// GET /api/mqtt/topics
async fn get_topics(State(app): State<AppState>) -> Json<TopicsView> {
    let cfg = &app.core.config.mqtt;
    let snapshot = CatalogSnapshot::between(&cfg.root_topic, "1.0", &cfg.release);
    Json(TopicsView {
        current: TopicCatalog::for_release(&cfg.root_topic, &cfg.release),
        issues: snapshot.check(),
        snapshot,
    })
}

// GET /api/victron/matrix
async fn get_matrix(State(app): State<AppState>) -> Result<Json<FunctionalReport>, StatusCode> {
    match &app.mqtt {
        Some(publisher) => Ok(Json(publisher.report())),
        None => Err(StatusCode::NOT_FOUND),
    }
}

// GET /api/registers
async fn list_registers(State(app): State<AppState>) -> Json<Value> {
    Json(app.core.catalog.to_json())
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub value: f64,
}

// POST /api/registers/{address}
async fn write_register(
    State(app): State<AppState>,
    Path(address): Path<u16>,
    Json(req): Json<WriteRequest>,
) -> (StatusCode, Json<Value>) {
    let uart = &app.core.stats.uart;
    let write = match app.core.catalog.validate_write(address, req.value) {
        Ok(w) => w,
        Err(e @ BridgeError::UnknownRegister(_)) => {
            return (StatusCode::NOT_FOUND, Json(json!({ "ok": false, "error": e.to_string() })));
        }
        Err(e) => {
            uart.writes_rejected.incr();
            info!("[http] register write refused: {e}");
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "ok": false, "error": e.to_string() })));
        }
    };

    if let Err(e) = app.writes.try_send(write.clone()) {
        warn!("[http] write queue unavailable: {e}");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "error": "write queue unavailable" })),
        );
    }

    uart.writes_forwarded.incr();
    if let Err(e) = app.core.bus.publish(
        Stage::Uart,
        None,
        EventDetail::RegisterWrite {
            address: write.address,
            raw: write.raw,
        },
    ) {
        warn!("[http] register write not traced: {e}");
    }
    (StatusCode::ACCEPTED, Json(json!({ "ok": true, "write": write })))
}

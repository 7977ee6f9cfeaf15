/**
 * WEBSOCKET BROADCAST SERVER - Diffusion du statut aux navigateurs
 *
 * RÔLE :
 * - Registre des clients connectés (clé = client_id), seul propriétaire des WebSocketClient
 * - Un `status_push` par tick (nominal 1000 ms, borné 800-1200 ms) vers l'ensemble
 *   exact des clients connectés à cet instant
 * - `config_broadcast` à chaque changement de souscription, vers tous les clients
 * - Timeout heartbeat : événement `error{timeout}` puis un seul `client_disconnected`
 *
 * SESSIONS : chaque connexion reçoit un jeton ; un id reconnecté remplace
 * l'ancienne session et les tâches de l'ancienne socket ne peuvent plus ni
 * rafraîchir ni retirer la nouvelle.
 *
 * ORDRE : toutes les transitions du registre et les événements associés sont
 * émis sous le verrou du registre, la liste `clients` d'un événement est donc
 * toujours l'ensemble connecté au moment de l'émission.
 */

use crate::bridge::BridgeCore;
use crate::error::BridgeError;
use crate::event_bus::{EventDetail, Stage};
use crate::http::AppState;
use crate::models::LIVE_FIELDS;
use crate::status::StatusSnapshot;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const MIN_INTERVAL_MS: u64 = 800;
pub const MAX_INTERVAL_MS: u64 = 1200;

pub fn clamp_interval(ms: u64) -> u64 {
    ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionConfig {
    pub metrics: Vec<String>,
    pub update_interval_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            metrics: Vec::new(),
            update_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Ping,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Heartbeat,
    Subscribe {
        #[serde(default)]
        metrics: Vec<String>,
        update_interval_ms: Option<u64>,
    },
}

pub struct WebSocketClient {
    pub client_id: String,
    pub token: u64,
    pub connected_at_ms: u64,
    pub subscribed_config: SubscriptionConfig,
    pub last_heartbeat_ms: u64,
    outbox: mpsc::Sender<Outbound>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientView {
    pub client_id: String,
    pub connected_at_ms: u64,
    pub subscribed_config: SubscriptionConfig,
    pub last_heartbeat_ms: u64,
}

/// Une connexion enregistrée : id, jeton de session et file sortante
pub struct ClientSession {
    pub client_id: String,
    pub token: u64,
    pub outbox: mpsc::Receiver<Outbound>,
}

struct Registry {
    clients: BTreeMap<String, WebSocketClient>,
    config: SubscriptionConfig,
}

impl Registry {
    /// Session courante de `client_id`, filtrée par jeton quand il est fourni
    fn session_mut(&mut self, client_id: &str, token: Option<u64>) -> Option<&mut WebSocketClient> {
        self.clients
            .get_mut(client_id)
            .filter(|c| token.map_or(true, |t| c.token == t))
    }
}

/// Prochaine échéance de push : ancrée sur le dernier push, jamais dans le passé
pub fn next_push_at(last_push: Instant, period: Duration, now: Instant) -> Instant {
    (last_push + period).max(now)
}

pub struct BroadcastServer {
    core: Arc<BridgeCore>,
    registry: Mutex<Registry>,
    status_seq: AtomicU64,
    next_token: AtomicU64,
    heartbeat_timeout_ms: u64,
    outbox_capacity: usize,
    rearm: Notify,
}

impl BroadcastServer {
    pub fn new(core: Arc<BridgeCore>) -> Self {
        let cfg = &core.config.websocket;
        let config = SubscriptionConfig {
            metrics: Vec::new(),
            update_interval_ms: clamp_interval(cfg.update_interval_ms),
        };
        Self {
            heartbeat_timeout_ms: cfg.heartbeat_timeout_ms,
            outbox_capacity: cfg.outbox_capacity.max(1),
            registry: Mutex::new(Registry {
                clients: BTreeMap::new(),
                config,
            }),
            status_seq: AtomicU64::new(0),
            next_token: AtomicU64::new(1),
            rearm: Notify::new(),
            core,
        }
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.registry.lock().clients.keys().cloned().collect()
    }

    pub fn clients(&self) -> Vec<ClientView> {
        self.registry
            .lock()
            .clients
            .values()
            .map(|c| ClientView {
                client_id: c.client_id.clone(),
                connected_at_ms: c.connected_at_ms,
                subscribed_config: c.subscribed_config.clone(),
                last_heartbeat_ms: c.last_heartbeat_ms,
            })
            .collect()
    }

    pub fn current_config(&self) -> SubscriptionConfig {
        self.registry.lock().config.clone()
    }

    pub fn update_interval_ms(&self) -> u64 {
        self.registry.lock().config.update_interval_ms
    }

    pub fn status_seq(&self) -> u64 {
        self.status_seq.load(Ordering::SeqCst)
    }

    fn publish(&self, detail: EventDetail) {
        if let Err(e) = self.core.bus.publish(Stage::WebUi, None, detail) {
            warn!("[ws] event not published: {e}");
        }
    }

    fn set_gauge(&self, reg: &Registry) {
        self.core
            .stats
            .websocket
            .clients
            .store(reg.clients.len() as u64, Ordering::Relaxed);
    }

    /// Retire un client sous verrou ; un seul `client_disconnected` par client
    fn remove_locked(&self, reg: &mut Registry, client_id: &str, reason: &str) -> bool {
        if reg.clients.remove(client_id).is_none() {
            return false;
        }
        self.set_gauge(reg);
        info!("[ws] client {client_id} disconnected ({reason})");
        self.publish(EventDetail::ClientDisconnected {
            client_id: client_id.to_string(),
            reason: reason.to_string(),
        });
        true
    }

    /// Enregistre un client ; un id déjà connecté est d'abord remplacé
    pub fn connect(&self, client_id: Option<String>) -> (String, mpsc::Receiver<Outbound>) {
        let session = self.open(client_id);
        (session.client_id, session.outbox)
    }

    /// Ouvre une session ; le jeton retourné identifie cette connexion précise
    pub fn open(&self, client_id: Option<String>) -> ClientSession {
        let id = client_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let now = self.core.now_ms();

        let mut reg = self.registry.lock();
        self.remove_locked(&mut reg, &id, "replaced");

        let config = reg.config.clone();
        // état courant pour le client tardif : config puis dernier statut connu
        let _ = tx.try_send(Outbound::Text(json!({ "type": "config", "config": config }).to_string()));
        if self.core.live.has_data() {
            let msg = Self::status_message(&self.core.status(), self.status_seq(), now, &config);
            let _ = tx.try_send(Outbound::Text(msg.to_string()));
        }

        reg.clients.insert(
            id.clone(),
            WebSocketClient {
                client_id: id.clone(),
                token,
                connected_at_ms: now,
                subscribed_config: config,
                last_heartbeat_ms: now,
                outbox: tx,
            },
        );
        self.set_gauge(&reg);
        info!("[ws] client {id} connected ({} total)", reg.clients.len());
        self.publish(EventDetail::ClientConnected { client_id: id.clone() });
        ClientSession {
            client_id: id,
            token,
            outbox: rx,
        }
    }

    /// Retrait d'un client, quelle que soit sa session
    pub fn disconnect(&self, client_id: &str, reason: &str) -> bool {
        self.disconnect_inner(client_id, None, reason)
    }

    /// Retrait d'une session précise ; sans effet si l'id a été repris depuis
    pub fn disconnect_session(&self, client_id: &str, token: u64, reason: &str) -> bool {
        self.disconnect_inner(client_id, Some(token), reason)
    }

    fn disconnect_inner(&self, client_id: &str, token: Option<u64>, reason: &str) -> bool {
        let mut reg = self.registry.lock();
        if reg.session_mut(client_id, token).is_none() {
            if token.is_some() {
                debug!("[ws] stale session of {client_id} closed ({reason})");
            }
            return false;
        }
        self.remove_locked(&mut reg, client_id, reason)
    }

    /// Toute trame entrante rafraîchit le heartbeat
    pub fn touch(&self, client_id: &str) -> bool {
        self.touch_inner(client_id, None)
    }

    pub fn touch_session(&self, client_id: &str, token: u64) -> bool {
        self.touch_inner(client_id, Some(token))
    }

    fn touch_inner(&self, client_id: &str, token: Option<u64>) -> bool {
        let now = self.core.now_ms();
        let mut reg = self.registry.lock();
        match reg.session_mut(client_id, token) {
            Some(c) => {
                c.last_heartbeat_ms = now;
                true
            }
            None => false,
        }
    }

    /// Nouvelle souscription : appliquée et diffusée à tous les clients connectés
    pub fn subscribe(&self, client_id: &str, metrics: Vec<String>, update_interval_ms: Option<u64>) -> Result<SubscriptionConfig, BridgeError> {
        let now = self.core.now_ms();
        let mut reg = self.registry.lock();
        let Some(requester) = reg.clients.get_mut(client_id) else {
            return Err(BridgeError::Decode(format!("unknown client {client_id}")));
        };
        requester.last_heartbeat_ms = now;

        let metrics: Vec<String> = metrics
            .into_iter()
            .filter(|m| LIVE_FIELDS.contains(&m.as_str()))
            .collect();
        let interval = clamp_interval(update_interval_ms.unwrap_or(reg.config.update_interval_ms));
        let config = SubscriptionConfig {
            metrics,
            update_interval_ms: interval,
        };
        let rearm = config.update_interval_ms != reg.config.update_interval_ms;
        reg.config = config.clone();

        let text = json!({ "type": "config", "config": config }).to_string();
        let mut recipients = Vec::with_capacity(reg.clients.len());
        for c in reg.clients.values_mut() {
            c.subscribed_config = config.clone();
            if c.outbox.try_send(Outbound::Text(text.clone())).is_err() {
                self.core.stats.websocket.dropped.incr();
            }
            recipients.push(c.client_id.clone());
        }

        self.core.stats.websocket.config_broadcasts.incr();
        self.publish(EventDetail::ConfigBroadcast {
            config: config.clone(),
            clients: recipients,
        });
        drop(reg);

        if rearm {
            self.rearm.notify_one();
        }
        Ok(config)
    }

    /// Message texte d'un client
    pub fn handle_inbound(&self, client_id: &str, text: &str) {
        self.touch(client_id);
        self.dispatch(client_id, text);
    }

    /// Message texte reçu sur une session ; ignoré si la session a été remplacée
    pub fn handle_session_inbound(&self, client_id: &str, token: u64, text: &str) {
        if !self.touch_session(client_id, token) {
            debug!("[ws] message from stale session of {client_id} ignored");
            return;
        }
        self.dispatch(client_id, text);
    }

    fn dispatch(&self, client_id: &str, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Heartbeat) => {}
            Ok(ClientMessage::Subscribe { metrics, update_interval_ms }) => {
                if let Err(e) = self.subscribe(client_id, metrics, update_interval_ms) {
                    debug!("[ws] subscribe from {client_id} ignored: {e}");
                }
            }
            Err(e) => {
                let err = BridgeError::from(e);
                debug!("[ws] client {client_id}: {err}");
                self.publish(EventDetail::ClientError {
                    client_id: client_id.to_string(),
                    error: "invalid_message".into(),
                    details: json!({ "message": err.to_string() }),
                });
            }
        }
    }

    fn status_message(status: &StatusSnapshot, status_seq: u64, now_ms: u64, config: &SubscriptionConfig) -> Value {
        let mut live = serde_json::to_value(&status.live_data).unwrap_or(Value::Null);
        if !config.metrics.is_empty() {
            if let Value::Object(map) = &mut live {
                map.retain(|k, _| config.metrics.iter().any(|m| m == k));
            }
        }
        json!({
            "type": "status",
            "status_seq": status_seq,
            "timestamp_ms": now_ms,
            "live_data": live,
            "stats": &status.stats,
        })
    }

    /// Un tick du timer : purge des clients muets puis un seul push.
    /// Retourne le `status_seq` poussé (None tant qu'aucune donnée live n'existe).
    pub fn tick(&self) -> Option<u64> {
        let now = self.core.now_ms();
        let mut reg = self.registry.lock();

        let stale: Vec<(String, u64)> = reg
            .clients
            .values()
            .map(|c| (c.client_id.clone(), now.saturating_sub(c.last_heartbeat_ms)))
            .filter(|(_, since)| *since > self.heartbeat_timeout_ms)
            .collect();
        for (id, since) in stale {
            let err = BridgeError::ClientHeartbeatTimeout {
                client_id: id.clone(),
                since_last_heartbeat_ms: since,
            };
            warn!("[ws] {err}");
            self.core.stats.websocket.timeouts.incr();
            self.publish(EventDetail::ClientError {
                client_id: id.clone(),
                error: "timeout".into(),
                details: json!({ "since_last_heartbeat_ms": since }),
            });
            self.remove_locked(&mut reg, &id, "timeout");
        }

        let origin = self.core.live_origin()?;
        let status = self.core.status();
        let seq = self.status_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut recipients = Vec::with_capacity(reg.clients.len());
        let mut closed = Vec::new();

        for c in reg.clients.values() {
            let msg = Self::status_message(&status, seq, now, &c.subscribed_config).to_string();
            match c.outbox.try_send(Outbound::Text(msg)) {
                Ok(()) => {
                    let _ = c.outbox.try_send(Outbound::Ping);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.core.stats.websocket.dropped.incr();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(c.client_id.clone()),
            }
            recipients.push(c.client_id.clone());
        }

        self.core.stats.websocket.status_pushes.incr();
        if let Err(e) = self.core.bus.publish(
            Stage::WebUi,
            Some(&origin),
            EventDetail::StatusPush {
                status_seq: seq,
                fields: vec!["live_data".into(), "stats".into()],
                clients: recipients,
            },
        ) {
            warn!("[ws] status push not traced: {e}");
        }

        for id in closed {
            self.remove_locked(&mut reg, &id, "transport_error");
        }
        Some(seq)
    }

    /// Boucle runtime. Un changement d'intervalle recalcule l'échéance à partir
    /// du dernier push : l'écart entre deux pushes reste dans 800-1200 ms.
    pub async fn run(self: Arc<Self>) {
        let mut last_push = Instant::now();
        let mut period = Duration::from_millis(self.update_interval_ms());
        info!("[ws] push timer armed at {} ms", period.as_millis());
        loop {
            let deadline = next_push_at(last_push, period, Instant::now());
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    self.tick();
                    last_push = Instant::now();
                }
                _ = self.rearm.notified() => {
                    period = Duration::from_millis(self.update_interval_ms());
                    debug!("[ws] push timer re-armed at {} ms", period.as_millis());
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub client_id: Option<String>,
}

// GET /ws?client_id=...
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(app): State<AppState>,
) -> impl IntoResponse {
    let server = app.ws.clone();
    ws.on_upgrade(move |socket| serve_client(server, socket, params.client_id))
}

async fn serve_client(server: Arc<BroadcastServer>, socket: WebSocket, requested_id: Option<String>) {
    let ClientSession { client_id: id, token, mut outbox } = server.open(requested_id);
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = outbox.recv().await {
            let frame = match msg {
                Outbound::Text(t) => Message::Text(t.into()),
                Outbound::Ping => Message::Ping(Default::default()),
            };
            if sender.send(frame).await.is_err() {
                return "transport_error";
            }
        }
        // outbox fermée : le serveur a retiré ou remplacé cette session
        "closed"
    });

    let recv_server = server.clone();
    let recv_id = id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(t)) => recv_server.handle_session_inbound(&recv_id, token, t.as_str()),
                Ok(Message::Close(_)) => return "close",
                Ok(_) => {
                    recv_server.touch_session(&recv_id, token);
                }
                Err(_) => return "transport_error",
            }
        }
        "close"
    });

    let reason = tokio::select! {
        r = &mut send_task => {
            recv_task.abort();
            r.unwrap_or("transport_error")
        }
        r = &mut recv_task => {
            send_task.abort();
            r.unwrap_or("transport_error")
        }
    };
    server.disconnect_session(&id, token, reason);
}

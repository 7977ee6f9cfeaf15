/**
 * EVENT BUS - Distribution ordonnée des événements du pipeline
 *
 * RÔLE : Chaque producteur publie un événement étiqueté par stage
 * (uart → event_bus → can → web_ui). Le bus attribue séquence et timestamp,
 * vérifie l'ordre causal puis diffuse à tous les abonnés dans l'ordre d'arrivée.
 *
 * ORDRE : un événement causé par un autre ne peut ni appartenir à un stage
 * antérieur ni être daté avant sa cause. Les violations sont rejetées, loguées
 * et comptées, le pipeline continue.
 */

use crate::alarms::AlarmRecord;
use crate::clock::Clock;
use crate::error::BridgeError;
use crate::keepalive::LinkHealth;
use crate::models::LiveData;
use crate::stats::BridgeStats;
use crate::websocket::SubscriptionConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Uart,
    EventBus,
    Can,
    WebUi,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Uart, Stage::EventBus, Stage::Can, Stage::WebUi];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Uart => "uart",
            Stage::EventBus => "event_bus",
            Stage::Can => "can",
            Stage::WebUi => "web_ui",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Référence vers l'événement qui en cause un autre
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cause {
    pub seq: u64,
    pub chain: u64,
    pub stage: Stage,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone)]
pub enum EventDetail {
    UartPoll { registers: usize, dropped: usize },
    LiveData { fields: Vec<String>, data: Arc<LiveData> },
    Alarm(AlarmRecord),
    CanTx { frames: usize, errors: usize, can_tx_count: u64, can_tx_errors: u64 },
    KeepaliveTx { can_tx_count: u64 },
    KeepaliveRx { interval_ms: Option<u64>, can_rx_count: u64 },
    LinkState { link: String, health: LinkHealth, since_last_rx_ms: u64 },
    StatusPush { status_seq: u64, fields: Vec<String>, clients: Vec<String> },
    ConfigBroadcast { config: SubscriptionConfig, clients: Vec<String> },
    ClientConnected { client_id: String },
    ClientDisconnected { client_id: String, reason: String },
    ClientError { client_id: String, error: String, details: Value },
    RegisterWrite { address: u16, raw: i64 },
}

impl EventDetail {
    pub fn name(&self) -> &'static str {
        match self {
            EventDetail::UartPoll { .. } => "uart_poll",
            EventDetail::LiveData { .. } => "live_data",
            EventDetail::Alarm(record) if record.event == "raised" => "alarm_raised",
            EventDetail::Alarm(_) => "alarm_cleared",
            EventDetail::CanTx { .. } => "can_tx",
            EventDetail::KeepaliveTx { .. } => "keepalive_tx",
            EventDetail::KeepaliveRx { .. } => "keepalive_rx",
            EventDetail::LinkState { .. } => "link_state",
            EventDetail::StatusPush { .. } => "status_push",
            EventDetail::ConfigBroadcast { .. } => "config_broadcast",
            EventDetail::ClientConnected { .. } => "client_connected",
            EventDetail::ClientDisconnected { .. } => "client_disconnected",
            EventDetail::ClientError { .. } => "error",
            EventDetail::RegisterWrite { .. } => "register_write",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub seq: u64,
    pub chain: u64,
    pub timestamp_ms: u64,
    pub stage: Stage,
    pub detail: EventDetail,
}

impl BusEvent {
    pub fn cause(&self) -> Cause {
        Cause {
            seq: self.seq,
            chain: self.chain,
            stage: self.stage,
            timestamp_ms: self.timestamp_ms,
        }
    }

    /// Projection en ligne de trace JSONL
    pub fn to_trace(&self) -> TraceRecord {
        let mut rec = TraceRecord {
            seq: self.seq,
            chain: self.chain,
            timestamp_ms: self.timestamp_ms,
            stage: self.stage,
            event: self.detail.name().to_string(),
            metrics: None,
            fields: None,
            status_seq: None,
            client_id: None,
            clients: None,
            config: None,
            error: None,
            details: None,
        };
        match &self.detail {
            EventDetail::UartPoll { registers, dropped } => {
                rec.metrics = Some(json!({ "registers": registers, "dropped": dropped }));
            }
            EventDetail::LiveData { fields, data } => {
                rec.fields = Some(fields.clone());
                rec.metrics = Some(json!({
                    "voltage": data.voltage,
                    "current": data.current,
                    "pack_power_w": data.pack_power_w,
                    "soc_percent": data.soc_percent,
                }));
            }
            EventDetail::Alarm(record) => {
                rec.details = serde_json::to_value(record).ok();
            }
            EventDetail::CanTx { frames, errors, can_tx_count, can_tx_errors } => {
                rec.metrics = Some(json!({
                    "frames": frames,
                    "errors": errors,
                    "can_tx_count": can_tx_count,
                    "can_tx_errors": can_tx_errors,
                }));
            }
            EventDetail::KeepaliveTx { can_tx_count } => {
                rec.metrics = Some(json!({ "can_tx_count": can_tx_count }));
            }
            EventDetail::KeepaliveRx { interval_ms, can_rx_count } => {
                rec.metrics = Some(json!({ "interval_ms": interval_ms, "can_rx_count": can_rx_count }));
            }
            EventDetail::LinkState { link, health, since_last_rx_ms } => {
                rec.details = Some(json!({
                    "link": link,
                    "state": health,
                    "since_last_rx_ms": since_last_rx_ms,
                }));
            }
            EventDetail::StatusPush { status_seq, fields, clients } => {
                rec.status_seq = Some(*status_seq);
                rec.fields = Some(fields.clone());
                rec.clients = Some(clients.clone());
            }
            EventDetail::ConfigBroadcast { config, clients } => {
                rec.config = Some(config.clone());
                rec.clients = Some(clients.clone());
            }
            EventDetail::ClientConnected { client_id } => {
                rec.client_id = Some(client_id.clone());
            }
            EventDetail::ClientDisconnected { client_id, reason } => {
                rec.client_id = Some(client_id.clone());
                rec.details = Some(json!({ "reason": reason }));
            }
            EventDetail::ClientError { client_id, error, details } => {
                rec.client_id = Some(client_id.clone());
                rec.error = Some(error.clone());
                rec.details = Some(details.clone());
            }
            EventDetail::RegisterWrite { address, raw } => {
                rec.metrics = Some(json!({ "address": address, "raw": raw }));
            }
        }
        rec
    }
}

/// Une ligne du fichier de trace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceRecord {
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub chain: u64,
    pub timestamp_ms: u64,
    pub stage: Stage,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SubscriptionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

struct BusInner {
    next_seq: u64,
    last_ts: u64,
    recent: VecDeque<TraceRecord>,
    recent_capacity: usize,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    tx: broadcast::Sender<Arc<BusEvent>>,
    clock: Arc<dyn Clock>,
    stats: Arc<BridgeStats>,
}

impl EventBus {
    pub fn new(clock: Arc<dyn Clock>, stats: Arc<BridgeStats>, capacity: usize, recent_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_seq: 1,
                last_ts: 0,
                recent: VecDeque::with_capacity(recent_capacity),
                recent_capacity,
            })),
            tx,
            clock,
            stats,
        }
    }

    /// Publie un événement. `cause` rattache l'événement à une chaîne existante,
    /// `None` ouvre une nouvelle chaîne.
    pub fn publish(&self, stage: Stage, cause: Option<&Cause>, detail: EventDetail) -> Result<Arc<BusEvent>, BridgeError> {
        // le verrou couvre stamp + envoi : l'ordre de diffusion = l'ordre des séquences
        let mut inner = self.inner.lock();
        let ts = self.clock.now_ms().max(inner.last_ts);

        if let Some(c) = cause {
            if stage < c.stage || ts < c.timestamp_ms {
                self.stats.event_bus.order_violations.incr();
                let err = BridgeError::StageOrderViolation {
                    stage,
                    cause_stage: c.stage,
                    cause_seq: c.seq,
                };
                warn!("[bus] rejected {}: {}", detail.name(), err);
                return Err(err);
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.last_ts = ts;

        let event = Arc::new(BusEvent {
            seq,
            chain: cause.map(|c| c.chain).unwrap_or(seq),
            timestamp_ms: ts,
            stage,
            detail,
        });

        if inner.recent_capacity > 0 {
            if inner.recent.len() == inner.recent_capacity {
                inner.recent.pop_front();
            }
            inner.recent.push_back(event.to_trace());
        }

        self.stats.event_bus.published.incr();
        // aucun abonné n'est pas une erreur
        if let Ok(n) = self.tx.send(event.clone()) {
            self.stats.event_bus.delivered.add(n as u64);
        }
        debug!("[bus] #{} {} {}", seq, stage, event.detail.name());
        Ok(event)
    }

    pub fn subscribe(&self) -> BusSubscriber {
        let rx = self.tx.subscribe();
        self.stats
            .event_bus
            .subscribers
            .store(self.tx.receiver_count() as u64, Ordering::Relaxed);
        BusSubscriber {
            rx,
            stats: self.stats.clone(),
        }
    }

    /// Dernières lignes de trace retenues en mémoire
    pub fn recent(&self) -> Vec<TraceRecord> {
        self.inner.lock().recent.iter().cloned().collect()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

/// Abonné au bus ; un retard de lecture compte les événements perdus
pub struct BusSubscriber {
    rx: broadcast::Receiver<Arc<BusEvent>>,
    stats: Arc<BridgeStats>,
}

impl BusSubscriber {
    pub async fn recv(&mut self) -> Option<Arc<BusEvent>> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.event_bus.dropped.add(n);
                    warn!("[bus] subscriber lagged, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Version non bloquante pour les boucles pilotées à la main
    pub fn try_recv(&mut self) -> Option<Arc<BusEvent>> {
        loop {
            match self.rx.try_recv() {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.stats.event_bus.dropped.add(n);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn bus_with_clock(start: u64) -> (EventBus, Arc<ManualClock>, Arc<BridgeStats>) {
        let clock = Arc::new(ManualClock::new(start));
        let stats = Arc::new(BridgeStats::new());
        let bus = EventBus::new(clock.clone(), stats.clone(), 64, 16);
        (bus, clock, stats)
    }

    #[test]
    fn test_chain_is_inherited_and_ordered() {
        let (bus, clock, _) = bus_with_clock(1000);
        let mut sub = bus.subscribe();

        let poll = bus
            .publish(Stage::Uart, None, EventDetail::UartPoll { registers: 3, dropped: 0 })
            .unwrap();
        clock.advance(5);
        let live = bus
            .publish(
                Stage::EventBus,
                Some(&poll.cause()),
                EventDetail::LiveData { fields: vec!["voltage".into()], data: Arc::new(LiveData::default()) },
            )
            .unwrap();

        assert_eq!(live.chain, poll.seq);
        assert!(live.timestamp_ms >= poll.timestamp_ms);
        assert_eq!(sub.try_recv().unwrap().seq, poll.seq);
        assert_eq!(sub.try_recv().unwrap().seq, live.seq);
    }

    #[test]
    fn test_earlier_stage_is_rejected() {
        let (bus, _, stats) = bus_with_clock(0);
        let can = bus
            .publish(Stage::Can, None, EventDetail::KeepaliveTx { can_tx_count: 1 })
            .unwrap();

        let res = bus.publish(Stage::Uart, Some(&can.cause()), EventDetail::UartPoll { registers: 0, dropped: 0 });
        assert!(matches!(res, Err(BridgeError::StageOrderViolation { .. })));
        assert_eq!(stats.event_bus.order_violations.get(), 1);
        assert_eq!(stats.event_bus.published.get(), 1);
    }

    #[test]
    fn test_cause_from_the_future_is_rejected() {
        let (bus, _, stats) = bus_with_clock(100);
        let cause = Cause { seq: 99, chain: 99, stage: Stage::Uart, timestamp_ms: 5_000 };
        let res = bus.publish(Stage::EventBus, Some(&cause), EventDetail::UartPoll { registers: 0, dropped: 0 });
        assert!(res.is_err());
        assert_eq!(stats.event_bus.order_violations.get(), 1);
    }

    #[test]
    fn test_timestamps_never_go_back() {
        let (bus, clock, _) = bus_with_clock(500);
        let a = bus.publish(Stage::Can, None, EventDetail::KeepaliveTx { can_tx_count: 1 }).unwrap();
        clock.set(200);
        let b = bus.publish(Stage::Can, None, EventDetail::KeepaliveTx { can_tx_count: 2 }).unwrap();
        assert!(b.timestamp_ms >= a.timestamp_ms);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_recent_is_bounded() {
        let clock = Arc::new(ManualClock::new(0));
        let bus = EventBus::new(clock, Arc::new(BridgeStats::new()), 8, 2);
        for i in 0..5 {
            bus.publish(Stage::Can, None, EventDetail::KeepaliveTx { can_tx_count: i }).unwrap();
        }
        let recent = bus.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].metrics.as_ref().unwrap()["can_tx_count"], 4);
    }
}

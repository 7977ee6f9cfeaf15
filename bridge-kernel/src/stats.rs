/**
 * STATS BRIDGE - Compteurs partagés entre sous-systèmes
 *
 * RÔLE : Seul état mutable partagé avec le Live State Store. Chaque sous-système
 * incrémente ses propres compteurs, l'agrégateur lit un snapshot sérialisable.
 *
 * INVARIANT : un compteur ne fait que monter pendant une session, seul un
 * redémarrage du process le remet à zéro (pas de reset exposé).
 */

use crate::keepalive::KeepaliveState;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Compteur monotone : uniquement incr/add/get
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct CanCounters {
    pub tx_success: Counter,
    pub tx_errors: Counter,
    pub rx_success: Counter,
    pub rx_dropped: Counter,
    pub encode_clamped: Counter,
}

#[derive(Debug, Default)]
pub struct UartCounters {
    pub rx_success: Counter,
    pub rx_errors: Counter,
    pub rx_dropped: Counter,
    pub writes_forwarded: Counter,
    pub writes_rejected: Counter,
    pub writes_delivered: Counter,
    pub writes_failed: Counter,
}

#[derive(Debug, Default)]
pub struct BusCounters {
    pub published: Counter,
    pub delivered: Counter,
    pub dropped: Counter,
    pub order_violations: Counter,
    pub subscribers: AtomicU64,
}

#[derive(Debug, Default)]
pub struct MqttCounters {
    pub enabled: AtomicBool,
    pub configured: AtomicBool,
    pub connected: AtomicBool,
    pub publish_count: Counter,
    pub failed_count: Counter,
    pub reconnects: Counter,
    pub last_publish_ms: AtomicU64,
    pub root_topic: RwLock<String>,
}

impl MqttCounters {
    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.incr();
        self.connected.store(false, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct WebSocketCounters {
    pub clients: AtomicU64, // jauge, pas un compteur
    pub status_pushes: Counter,
    pub config_broadcasts: Counter,
    pub timeouts: Counter,
    pub dropped: Counter,
}

/// Ensemble des compteurs du bridge, partagé en `Arc<BridgeStats>`
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub can: CanCounters,
    pub uart: UartCounters,
    pub event_bus: BusCounters,
    pub mqtt: MqttCounters,
    pub websocket: WebSocketCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanStats {
    pub tx_success: u64,
    pub tx_errors: u64,
    pub rx_success: u64,
    pub rx_dropped: u64,
    pub encode_clamped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UartStats {
    pub rx_success: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub writes_forwarded: u64,
    pub writes_rejected: u64,
    pub writes_delivered: u64,
    pub writes_failed: u64,
    pub link_ok: bool,
    pub last_rx_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub order_violations: u64,
    pub subscribers: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttStats {
    pub enabled: bool,
    pub configured: bool,
    pub connected: bool,
    pub publish_count: u64,
    pub failed_count: u64,
    pub reconnects: u64,
    pub root_topic: String,
    pub last_publish_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebSocketStats {
    pub clients: u64,
    pub status_pushes: u64,
    pub config_broadcasts: u64,
    pub timeouts: u64,
    pub dropped: u64,
}

/// Bloc `stats` du document de statut
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    pub can: CanStats,
    pub uart: UartStats,
    pub keepalive: KeepaliveState,
    pub event_bus: BusStats,
    pub mqtt: MqttStats,
    pub websocket: WebSocketStats,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lecture instantanée ; l'état des liens vient des superviseurs keepalive
    pub fn snapshot(&self, keepalive: KeepaliveState, uart_link: &KeepaliveState) -> StatsSnapshot {
        let mqtt = &self.mqtt;
        StatsSnapshot {
            can: CanStats {
                tx_success: self.can.tx_success.get(),
                tx_errors: self.can.tx_errors.get(),
                rx_success: self.can.rx_success.get(),
                rx_dropped: self.can.rx_dropped.get(),
                encode_clamped: self.can.encode_clamped.get(),
            },
            uart: UartStats {
                rx_success: self.uart.rx_success.get(),
                rx_errors: self.uart.rx_errors.get(),
                rx_dropped: self.uart.rx_dropped.get(),
                writes_forwarded: self.uart.writes_forwarded.get(),
                writes_rejected: self.uart.writes_rejected.get(),
                writes_delivered: self.uart.writes_delivered.get(),
                writes_failed: self.uart.writes_failed.get(),
                link_ok: uart_link.ok,
                last_rx_ms: uart_link.last_rx_ms,
            },
            keepalive,
            event_bus: BusStats {
                published: self.event_bus.published.get(),
                delivered: self.event_bus.delivered.get(),
                dropped: self.event_bus.dropped.get(),
                order_violations: self.event_bus.order_violations.get(),
                subscribers: self.event_bus.subscribers.load(Ordering::Relaxed),
            },
            mqtt: MqttStats {
                enabled: mqtt.enabled.load(Ordering::Relaxed),
                configured: mqtt.configured.load(Ordering::Relaxed),
                connected: mqtt.connected.load(Ordering::Relaxed),
                publish_count: mqtt.publish_count.get(),
                failed_count: mqtt.failed_count.get(),
                reconnects: mqtt.reconnects.get(),
                root_topic: mqtt.root_topic.read().clone(),
                last_publish_ms: mqtt.last_publish_ms.load(Ordering::Relaxed),
            },
            websocket: WebSocketStats {
                clients: self.websocket.clients.load(Ordering::Relaxed),
                status_pushes: self.websocket.status_pushes.get(),
                config_broadcasts: self.websocket.config_broadcasts.get(),
                timeouts: self.websocket.timeouts.get(),
                dropped: self.websocket.dropped.get(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_only_moves_up() {
        let c = Counter::default();
        assert_eq!(c.incr(), 1);
        assert_eq!(c.add(4), 5);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = BridgeStats::new();
        stats.can.tx_success.add(7);
        stats.mqtt.mark_connected();
        stats.mqtt.increment_reconnects();
        *stats.mqtt.root_topic.write() = "tinybms".into();

        let link = KeepaliveState::default();
        let snap = stats.snapshot(link.clone(), &link);
        assert_eq!(snap.can.tx_success, 7);
        assert!(!snap.mqtt.connected);
        assert_eq!(snap.mqtt.reconnects, 1);
        assert_eq!(snap.mqtt.root_topic, "tinybms");

        let json = serde_json::to_value(&snap).unwrap();
        for key in ["can", "uart", "keepalive", "event_bus", "mqtt"] {
            assert!(json.get(key).is_some(), "missing stats.{key}");
        }
    }
}

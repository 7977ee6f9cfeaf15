/*!
Test Harness pour le pipeline TinyBridge

Pilote le bridge complet pas à pas sur une horloge manuelle (aucun sleep):
- Ingest de registres BMS simulés
- Bus CAN virtuel avec keepalive GX injectable
- Client MQTT mock derrière le publisher réel
- Clients WebSocket sans socket (file sortante directe)
*/

use crate::mqtt_stub::MockMqttClient;
use anyhow::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tinybridge_kernel::bridge::BridgeCore;
use tinybridge_kernel::can::{CanFrame, CanPublisher, VirtualCanBus, PGN_KEEPALIVE};
use tinybridge_kernel::clock::ManualClock;
use tinybridge_kernel::config::BridgeConfig;
use tinybridge_kernel::event_bus::TraceRecord;
use tinybridge_kernel::ingest::RegisterReading;
use tinybridge_kernel::mqtt::MqttPublisher;
use tinybridge_kernel::trace::encode_line;
use tinybridge_kernel::websocket::{BroadcastServer, ClientSession, Outbound};

/// Construction d'un lot de registres TinyBMS (unités brutes du protocole)
#[derive(Debug, Clone)]
pub struct PackReadings {
    pub voltage: f64,
    pub current: f64,
    pub soc_percent: f64,
    pub soh_percent: f64,
    pub temperature_c: f64,
    pub min_cell_mv: u16,
    pub max_cell_mv: u16,
    pub status: u16,
}

impl Default for PackReadings {
    fn default() -> Self {
        Self {
            voltage: 52.4,
            current: -12.5,
            soc_percent: 80.0,
            soh_percent: 98.0,
            temperature_c: 24.5,
            min_cell_mv: 3270,
            max_cell_mv: 3290,
            status: 0x93,
        }
    }
}

impl PackReadings {
    pub fn readings(&self) -> Vec<RegisterReading> {
        vec![
            RegisterReading { address: 36, value: self.voltage },
            RegisterReading { address: 38, value: self.current },
            RegisterReading { address: 40, value: self.min_cell_mv as f64 },
            RegisterReading { address: 41, value: self.max_cell_mv as f64 },
            RegisterReading { address: 45, value: self.soh_percent / 0.002 },
            RegisterReading { address: 46, value: self.soc_percent / 0.002 },
            RegisterReading { address: 48, value: self.temperature_c / 0.1 },
            RegisterReading { address: 50, value: self.status as f64 },
        ]
    }

    /// Ligne du flux TCP de la passerelle série
    pub fn feed_line(&self) -> String {
        let regs: Vec<Value> = self
            .readings()
            .iter()
            .map(|r| json!({ "address": r.address, "value": r.value }))
            .collect();
        json!({ "registers": regs }).to_string()
    }
}

/// Harness de test complet du bridge
pub struct TestHarness {
    pub clock: Arc<ManualClock>,
    pub core: Arc<BridgeCore>,
    pub can_bus: Arc<VirtualCanBus>,
    pub can: CanPublisher,
    pub mqtt_client: MockMqttClient,
    pub mqtt: Arc<MqttPublisher>,
    pub ws: Arc<BroadcastServer>,
    pub pack: PackReadings,
    sessions: BTreeMap<String, ClientSession>,
}

impl TestHarness {
    /// Config par défaut, MQTT activé et connecté sur un broker fictif
    pub fn new() -> Self {
        let mut config = BridgeConfig::default();
        config.mqtt.enabled = true;
        config.mqtt.host = "mock-broker".into();
        config.trace.recent_capacity = 100_000;
        Self::with_config(config)
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        let clock = Arc::new(ManualClock::new(0));
        let core = Arc::new(BridgeCore::new(config, clock.clone()));
        let can_bus = Arc::new(VirtualCanBus::new(core.config.can.rx_queue_capacity));
        let can = CanPublisher::new(core.clone(), can_bus.clone());
        let mqtt_client = MockMqttClient::new();
        let mqtt = Arc::new(MqttPublisher::new(core.clone(), Arc::new(mqtt_client.clone())));
        core.stats.mqtt.mark_connected();
        let ws = Arc::new(BroadcastServer::new(core.clone()));

        Self {
            clock,
            core,
            can_bus,
            can,
            mqtt_client,
            mqtt,
            ws,
            pack: PackReadings::default(),
            sessions: BTreeMap::new(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.core.now_ms()
    }

    pub fn advance(&self, ms: u64) -> u64 {
        self.clock.advance(ms)
    }

    /// Un cycle d'ingest avec le pack courant
    pub fn ingest(&self) -> Result<()> {
        self.core.ingest_batch(&self.pack.readings())?;
        Ok(())
    }

    /// Keepalive 0x305 reçu du GX
    pub fn gx_keepalive(&self) {
        self.can_bus.inject(CanFrame::new(PGN_KEEPALIVE, [0u8; 8]));
    }

    /// Timer CAN : réception, keepalive sortant, cycle PGN
    pub fn tick_can(&self) -> Option<(usize, usize)> {
        self.can.poll_rx();
        self.can.keepalive_cycle();
        self.can.publish_cycle()
    }

    pub fn tick_mqtt(&self) -> (usize, usize) {
        self.mqtt.publish_live()
    }

    pub fn tick_ws(&self) -> Option<u64> {
        self.ws.tick()
    }

    /// Avance de `ms` puis joue une période complète de toutes les cadences
    pub fn cycle(&self, ms: u64) -> Result<()> {
        self.advance(ms);
        self.gx_keepalive();
        self.ingest()?;
        self.tick_can();
        self.core.poll_links();
        self.tick_mqtt();
        self.tick_ws();
        Ok(())
    }

    /// Enchaîne `n` cycles de `period_ms`, heartbeat des clients listés à chaque cycle
    pub fn run_cycles(&self, n: usize, period_ms: u64, heartbeats: &[&str]) -> Result<()> {
        for _ in 0..n {
            for id in heartbeats {
                self.heartbeat(id);
            }
            self.cycle(period_ms)?;
        }
        Ok(())
    }

    /// Nouvelle connexion ; un id déjà ouvert ferme l'ancienne socket comme le ferait sa tâche
    pub fn connect(&mut self, client_id: &str) -> String {
        let session = self.ws.open(Some(client_id.to_string()));
        let id = session.client_id.clone();
        if let Some(old) = self.sessions.insert(id.clone(), session) {
            self.ws.disconnect_session(&old.client_id, old.token, "closed");
        }
        id
    }

    pub fn heartbeat(&self, client_id: &str) {
        self.ws.handle_inbound(client_id, r#"{"type":"heartbeat"}"#);
    }

    pub fn subscribe(&self, client_id: &str, metrics: &[&str], update_interval_ms: u64) {
        let msg = json!({
            "type": "subscribe",
            "metrics": metrics,
            "update_interval_ms": update_interval_ms,
        });
        self.ws.handle_inbound(client_id, &msg.to_string());
    }

    /// Messages JSON reçus par un client depuis le dernier appel
    pub fn drain_messages(&mut self, client_id: &str) -> Vec<Value> {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Ok(msg) = session.outbox.try_recv() {
            if let Outbound::Text(t) = msg {
                if let Ok(v) = serde_json::from_str(&t) {
                    out.push(v);
                }
            }
        }
        out
    }

    /// Fermeture côté client : la file sortante disparaît
    pub fn drop_client(&mut self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    pub fn trace(&self) -> Vec<TraceRecord> {
        self.core.bus.recent()
    }

    pub fn events(&self, name: &str) -> Vec<TraceRecord> {
        self.trace().into_iter().filter(|r| r.event == name).collect()
    }

    pub fn status_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.core.status())?)
    }

    /// Écrit la trace courante au format JSONL
    pub fn write_trace<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let mut out = String::new();
        let trace = self.trace();
        for rec in &trace {
            out.push_str(&encode_line(rec)?);
        }
        std::fs::write(path.as_ref(), out)?;
        log::info!("[harness] wrote {} trace records to {}", trace.len(), path.as_ref().display());
        Ok(trace.len())
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/**
 * MQTT PUBLISHER - Publication du catalogue de topics
 *
 * RÔLE :
 * - Publie chaque topic de la release configurée à cadence fixe
 * - Republie les topics d'alarme à chaque front raised/cleared
 * - Tient publish_count / failed_count et la matrice fonctionnelle D-Bus
 *
 * LIEN : l'event loop rumqttc tourne dans sa propre task ; ConnAck → connected,
 * erreur → reconnects + pause de 2 s. Une publication ne bloque jamais :
 * file pleine ou client fermé = échec compté, retenté au tick suivant.
 */

use crate::alarms::AlarmRecord;
use crate::bridge::BridgeCore;
use crate::config::MqttConf;
use crate::error::BridgeError;
use crate::event_bus::EventDetail;
use crate::topics::{build_topic, sanitize_root_topic, specs_for_release, TopicSource, TopicSpec};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info, warn};

pub const MATRIX_SAMPLES: usize = 8;

/// Côté émission du client MQTT ; `AsyncClient` en prod, mock dans le devkit
pub trait MqttSink: Send + Sync {
    fn publish_bytes(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<(), BridgeError>;
}

impl MqttSink for AsyncClient {
    fn publish_bytes(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<(), BridgeError> {
        self.try_publish(topic, qos, retain, payload)
            .map_err(|e| BridgeError::PublishFailure {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

pub fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatrixEntry {
    pub status: String,
    pub dbus_path: String,
    pub payload_samples: VecDeque<Value>,
}

/// Rapport de validation fonctionnelle côté GX
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionalReport {
    pub result: String,
    pub root_topic: String,
    pub legacy_topics_verified: Vec<String>,
    pub functional_matrix: BTreeMap<String, MatrixEntry>,
}

#[derive(Debug, Default)]
pub struct FunctionalMatrix {
    entries: BTreeMap<String, MatrixEntry>,
    seen: BTreeSet<String>,
}

impl FunctionalMatrix {
    pub fn record(&mut self, spec: &TopicSpec, payload: &Value) {
        self.seen.insert(spec.suffix.to_string());
        let Some(path) = spec.dbus_path else { return };
        let entry = self.entries.entry(spec.suffix.to_string()).or_insert_with(|| MatrixEntry {
            status: "pending".into(),
            dbus_path: path.to_string(),
            payload_samples: VecDeque::with_capacity(MATRIX_SAMPLES),
        });
        if entry.payload_samples.len() == MATRIX_SAMPLES {
            entry.payload_samples.pop_front();
        }
        entry.payload_samples.push_back(payload.clone());
        if entry.payload_samples.len() >= 2 {
            entry.status = "ok".into();
        }
    }

    pub fn report(&self, root_topic: &str) -> FunctionalReport {
        let legacy: Vec<String> = specs_for_release("1.0")
            .filter(|s| self.seen.contains(s.suffix))
            .map(|s| build_topic(root_topic, s.suffix))
            .collect();
        let all_legacy = legacy.len() == specs_for_release("1.0").count();
        let all_ok = !self.entries.is_empty() && self.entries.values().all(|e| e.status == "ok");
        FunctionalReport {
            result: if all_ok && all_legacy { "pass" } else { "pending" }.into(),
            root_topic: root_topic.to_string(),
            legacy_topics_verified: legacy,
            functional_matrix: self.entries.clone(),
        }
    }
}

pub struct MqttPublisher {
    core: Arc<BridgeCore>,
    sink: Arc<dyn MqttSink>,
    root: String,
    release: String,
    qos: QoS,
    retain: bool,
    matrix: Mutex<FunctionalMatrix>,
}

impl MqttPublisher {
    pub fn new(core: Arc<BridgeCore>, sink: Arc<dyn MqttSink>) -> Self {
        let cfg = &core.config.mqtt;
        let root = sanitize_root_topic(&cfg.root_topic);
        *core.stats.mqtt.root_topic.write() = root.clone();
        Self {
            release: cfg.release.clone(),
            qos: qos_from(cfg.qos),
            retain: cfg.retain,
            matrix: Mutex::new(FunctionalMatrix::default()),
            root,
            sink,
            core,
        }
    }

    pub fn root_topic(&self) -> &str {
        &self.root
    }

    pub fn release(&self) -> &str {
        &self.release
    }

    fn alarm_level(&self, path: &str) -> u8 {
        let engine = self.core.alarms.lock();
        engine
            .active()
            .iter()
            .map(|c| c.spec())
            .filter(|s| s.victron_path == path)
            .map(|s| s.severity.victron_level())
            .max()
            .unwrap_or(0)
    }

    fn publish_spec(&self, spec: &'static TopicSpec, value: f64, now_ms: u64) -> bool {
        let mut payload = json!({ "value": value, "timestamp_ms": now_ms });
        if let Some(unit) = spec.unit {
            payload["unit"] = json!(unit);
        }
        if let Some(path) = spec.dbus_path {
            payload["dbus_path"] = json!(path);
        }
        let topic = build_topic(&self.root, spec.suffix);
        let stats = &self.core.stats.mqtt;

        match self.sink.publish_bytes(&topic, self.qos, self.retain, payload.to_string().into_bytes()) {
            Ok(()) => {
                stats.publish_count.incr();
                stats.last_publish_ms.store(now_ms, Ordering::Relaxed);
                self.matrix.lock().record(spec, &payload);
                true
            }
            Err(e) => {
                stats.failed_count.incr();
                debug!("[mqtt] {e}");
                false
            }
        }
    }

    fn ready(&self) -> bool {
        let stats = &self.core.stats.mqtt;
        stats.enabled.load(Ordering::Relaxed) && stats.connected.load(Ordering::Relaxed)
    }

    /// Tick périodique : tous les topics de la release ; retourne (ok, échecs)
    pub fn publish_live(&self) -> (usize, usize) {
        if !self.ready() {
            return (0, 0);
        }
        let live = self.core.live.current();
        if live.origin.is_none() {
            return (0, 0);
        }
        let now = self.core.now_ms();
        let (mut ok, mut failed) = (0, 0);
        for spec in specs_for_release(&self.release) {
            let value = match spec.source {
                TopicSource::Live(f) => f(&live),
                TopicSource::Alarm(path) => self.alarm_level(path) as f64,
            };
            if self.publish_spec(spec, value, now) {
                ok += 1;
            } else {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!("[mqtt] {failed} publishes failed this tick");
        }
        (ok, failed)
    }

    /// Front d'alarme : republie le topic du chemin Victron concerné
    pub fn publish_alarm(&self, rec: &AlarmRecord) -> bool {
        if !self.ready() {
            return false;
        }
        let Some(spec) = specs_for_release(&self.release)
            .find(|s| matches!(s.source, TopicSource::Alarm(p) if p == rec.victron_path))
        else {
            return false;
        };
        let level = self.alarm_level(&rec.victron_path);
        self.publish_spec(spec, level as f64, rec.timestamp_ms)
    }

    pub fn report(&self) -> FunctionalReport {
        self.matrix.lock().report(&self.root)
    }

    pub async fn run(self: Arc<Self>) {
        let period = self.core.config.mqtt.publish_interval_ms.max(1);
        let mut interval = tokio::time::interval(Duration::from_millis(period));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut events = self.core.bus.subscribe();
        info!("[mqtt] publisher started on root '{}' (release {})", self.root, self.release);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.publish_live();
                }
                ev = events.recv() => {
                    match ev {
                        Some(ev) => {
                            if let EventDetail::Alarm(rec) = &ev.detail {
                                self.publish_alarm(rec);
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

pub fn build_mqtt_options(cfg: &MqttConf) -> MqttOptions {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    if let Some(user) = &cfg.username {
        opts.set_credentials(user, cfg.password.clone().unwrap_or_default());
    }
    opts
}

/// Crée le client et lance l'event loop ; le client sert de `MqttSink`
pub fn spawn_mqtt_connection(core: Arc<BridgeCore>) -> AsyncClient {
    let opts = build_mqtt_options(&core.config.mqtt);
    let (client, mut eventloop) = AsyncClient::new(opts, 64);

    task::spawn(async move {
        let stats = &core.stats.mqtt;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    stats.mark_connected();
                    info!("[mqtt] connected to {}:{}", core.config.mqtt.host, core.config.mqtt.port);
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    stats.mark_disconnected();
                }
                Ok(_) => {}
                Err(e) => {
                    stats.increment_reconnects();
                    warn!("[mqtt] connection error: {e:?}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
    client
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BridgeConfig;
    use crate::ingest::RegisterReading;

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<(String, Value)>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl MqttSink for RecordingSink {
        fn publish_bytes(&self, topic: &str, _qos: QoS, _retain: bool, payload: Vec<u8>) -> Result<(), BridgeError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(BridgeError::PublishFailure { topic: topic.into(), reason: "queue full".into() });
            }
            let v: Value = serde_json::from_slice(&payload).unwrap();
            self.published.lock().push((topic.to_string(), v));
            Ok(())
        }
    }

    fn setup(release: &str) -> (Arc<BridgeCore>, Arc<RecordingSink>, MqttPublisher, Arc<ManualClock>) {
        let mut cfg = BridgeConfig::default();
        cfg.mqtt.enabled = true;
        cfg.mqtt.host = "broker".into();
        cfg.mqtt.root_topic = "Victron/TinyBMS".into();
        cfg.mqtt.release = release.into();
        let clock = Arc::new(ManualClock::new(0));
        let core = Arc::new(BridgeCore::new(cfg, clock.clone()));
        core.stats.mqtt.mark_connected();
        let sink = Arc::new(RecordingSink::default());
        let publisher = MqttPublisher::new(core.clone(), sink.clone());
        (core, sink, publisher, clock)
    }

    fn ingest(core: &BridgeCore, soc_raw: f64) {
        core.ingest_batch(&[
            RegisterReading { address: 36, value: 52.0 },
            RegisterReading { address: 38, value: 10.0 },
            RegisterReading { address: 46, value: soc_raw },
            RegisterReading { address: 50, value: 0x91 as f64 },
        ])
        .unwrap();
    }

    #[test]
    fn test_nothing_before_live_data() {
        let (_, sink, publisher, _) = setup("2.0");
        assert_eq!(publisher.publish_live(), (0, 0));
        assert!(sink.published.lock().is_empty());
    }

    #[test]
    fn test_publish_live_counts_and_payload() {
        let (core, sink, publisher, _) = setup("2.0");
        ingest(&core, 40_000.0);
        assert_eq!(publisher.publish_live(), (20, 0));
        assert_eq!(core.stats.mqtt.publish_count.get(), 20);
        assert_eq!(core.stats.mqtt.root_topic.read().as_str(), "victron/tinybms");

        let published = sink.published.lock();
        let (_, power) = published.iter().find(|(t, _)| t == "victron/tinybms/pack_power_w").unwrap();
        assert_eq!(power["value"], 520.0);
        assert_eq!(power["dbus_path"], "/Dc/0/Power");
        assert_eq!(power["unit"], "W");
    }

    #[test]
    fn test_legacy_release_keeps_legacy_topics_only() {
        let (core, sink, publisher, _) = setup("1.0");
        ingest(&core, 40_000.0);
        assert_eq!(publisher.publish_live(), (10, 0));
        assert!(sink.published.lock().iter().all(|(t, _)| !t.ends_with("pack_power_w")));
    }

    #[test]
    fn test_failures_are_counted() {
        let (core, sink, publisher, _) = setup("2.0");
        ingest(&core, 40_000.0);
        sink.fail.store(true, Ordering::Relaxed);
        assert_eq!(publisher.publish_live(), (0, 20));
        assert_eq!(core.stats.mqtt.failed_count.get(), 20);
        assert_eq!(core.stats.mqtt.publish_count.get(), 0);
    }

    #[test]
    fn test_alarm_edge_publishes_level() {
        let (core, sink, publisher, _) = setup("2.0");
        ingest(&core, 2_500.0); // SOC 5 %
        let raised = core.alarms.lock().ledger().last().cloned().unwrap();
        assert!(publisher.publish_alarm(&raised));

        let published = sink.published.lock();
        let (topic, payload) = published.last().unwrap();
        assert_eq!(topic, "victron/tinybms/alarm_low_soc");
        assert_eq!(payload["value"], 1.0);
    }

    #[test]
    fn test_matrix_needs_two_samples() {
        let (core, _, publisher, clock) = setup("2.0");
        ingest(&core, 40_000.0);
        publisher.publish_live();
        let report = publisher.report();
        assert_eq!(report.functional_matrix["pack_power_w"].status, "pending");
        assert_eq!(report.result, "pending");

        clock.advance(1000);
        publisher.publish_live();
        let report = publisher.report();
        let entry = &report.functional_matrix["system_state"];
        assert_eq!(entry.status, "ok");
        assert_eq!(entry.dbus_path, "/System/0/State");
        assert_eq!(entry.payload_samples.len(), 2);
        assert_eq!(report.legacy_topics_verified.len(), 10);
        assert_eq!(report.result, "pass");
    }
}

/**
 * BRIDGE CORE - Cœur partagé du pipeline
 *
 * RÔLE : Regroupe ce que les publishers partagent (store live, stats, bus,
 * superviseurs de lien, moteur d'alarmes, catalogue registres) et porte le
 * cycle d'ingest : uart_poll → live_data → évaluation des alarmes.
 *
 * CONCURRENCE : aucun verrou n'est tenu d'un sous-système à l'autre ; chaque
 * méthode prend des verrous courts, sans point de suspension.
 */

use crate::alarms::{evaluate, AlarmEngine, AlarmRecord, FaultInputs};
use crate::clock::Clock;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::event_bus::{Cause, EventBus, EventDetail, Stage};
use crate::ingest::{apply_batch, parse_feed_line, RegisterReading};
use crate::keepalive::{KeepaliveState, KeepaliveSupervisor, LinkTransition};
use crate::models::LiveData;
use crate::registers::RegisterCatalog;
use crate::state::LiveStore;
use crate::stats::BridgeStats;
use crate::status::{compose, StatusInputs, StatusSnapshot};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{info, warn};

pub struct BridgeCore {
    pub config: BridgeConfig,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<BridgeStats>,
    pub live: LiveStore,
    pub bus: EventBus,
    pub can_link: Mutex<KeepaliveSupervisor>,
    pub uart_link: Mutex<KeepaliveSupervisor>,
    pub alarms: Mutex<AlarmEngine>,
    pub catalog: RegisterCatalog,
    faults: Mutex<FaultInputs>,
}

impl BridgeCore {
    pub fn new(config: BridgeConfig, clock: Arc<dyn Clock>) -> Self {
        let stats = Arc::new(BridgeStats::new());
        let bus = EventBus::new(
            clock.clone(),
            stats.clone(),
            config.trace.bus_capacity,
            config.trace.recent_capacity,
        );

        let catalog = match config.registers.catalog_path.as_deref() {
            Some(path) => RegisterCatalog::load(Path::new(path)).unwrap_or_else(|e| {
                warn!("[bridge] register catalog {path} unusable ({e}), using built-in catalog");
                RegisterCatalog::builtin()
            }),
            None => RegisterCatalog::builtin(),
        };
        for issue in catalog.validate() {
            warn!("[bridge] register catalog: {issue}");
        }

        stats.mqtt.enabled.store(config.mqtt.enabled, std::sync::atomic::Ordering::Relaxed);
        stats
            .mqtt
            .configured
            .store(config.mqtt.is_configured(), std::sync::atomic::Ordering::Relaxed);

        Self {
            can_link: Mutex::new(KeepaliveSupervisor::new("can", config.keepalive.supervisor())),
            uart_link: Mutex::new(KeepaliveSupervisor::new("uart", config.uart.supervisor())),
            alarms: Mutex::new(AlarmEngine::new(config.alarms.ledger_capacity)),
            faults: Mutex::new(FaultInputs::default()),
            live: LiveStore::new(),
            catalog,
            config,
            clock,
            stats,
            bus,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Cause des effets en aval du dernier snapshot live (None avant le premier ingest)
    pub fn live_origin(&self) -> Option<Cause> {
        self.live.current().origin
    }

    /// Un cycle d'ingest complet
    pub fn ingest_batch(&self, readings: &[RegisterReading]) -> Result<Arc<LiveData>, BridgeError> {
        let previous = self.live.current();
        let outcome = apply_batch(&previous, readings);

        let poll = self.bus.publish(
            Stage::Uart,
            None,
            EventDetail::UartPoll {
                registers: readings.len(),
                dropped: outcome.dropped,
            },
        )?;

        let mut data = outcome.data;
        let event = self.bus.publish(
            Stage::EventBus,
            Some(&poll.cause()),
            EventDetail::LiveData {
                fields: outcome.fields,
                data: Arc::new(data.clone()),
            },
        )?;
        data.origin = Some(event.cause());
        data.updated_ms = event.timestamp_ms;
        let stored = self.live.replace(data);

        self.stats.uart.rx_success.incr();
        self.stats.uart.rx_dropped.add(outcome.dropped as u64);
        let (_, transition) = self.uart_link.lock().record_rx(event.timestamp_ms);
        if let Some(t) = transition {
            self.publish_link_state("uart", Stage::Uart, t);
        }

        self.evaluate_alarms(Some(&event.cause()));
        Ok(stored)
    }

    /// Ligne brute du flux série ; les erreurs de décodage sont comptées
    pub fn ingest_line(&self, line: &str) -> Result<Arc<LiveData>, BridgeError> {
        match parse_feed_line(line) {
            Ok(readings) => self.ingest_batch(&readings),
            Err(e) => {
                self.stats.uart.rx_errors.incr();
                Err(e)
            }
        }
    }

    pub fn can_state(&self) -> KeepaliveState {
        self.can_link.lock().state(self.now_ms())
    }

    pub fn uart_state(&self) -> KeepaliveState {
        self.uart_link.lock().state(self.now_ms())
    }

    /// Réévalue les alarmes et publie chaque front sur le bus.
    /// Les fronts issus d'un défaut de lien ou d'émission ouvrent leur propre chaîne.
    ///
    /// Le moteur est verrouillé avant la lecture des entrées : deux évaluations
    /// concurrentes ne peuvent pas appliquer un état plus ancien après un plus récent.
    pub fn evaluate_alarms(&self, cause: Option<&Cause>) -> Vec<AlarmRecord> {
        // ordre des verrous : alarms, puis live / liens / défauts (jamais l'inverse)
        let mut engine = self.alarms.lock();
        let live = self.live.current();
        let can = self.can_state();
        let uart = self.uart_state();
        let faults = *self.faults.lock();
        let active = evaluate(
            live.origin.is_some().then_some(live.as_ref()),
            &can,
            &uart,
            faults,
            &self.config.alarms.thresholds,
        );

        // verrou tenu pendant la publication : les fronts sortent dans l'ordre du ledger
        let edges = engine.apply(&active, self.now_ms());
        for rec in &edges {
            info!("[alarms] {} {:?} ({})", rec.event, rec.identity, rec.severity_name);
            if let Err(e) = self.bus.publish(Stage::EventBus, cause, EventDetail::Alarm(rec.clone())) {
                warn!("[alarms] edge not published: {e}");
            }
        }
        edges
    }

    /// Défaut d'émission CAN signalé par le publisher
    pub fn set_can_tx_failed(&self, failed: bool) {
        let changed = {
            let mut faults = self.faults.lock();
            let changed = faults.can_tx_failed != failed;
            faults.can_tx_failed = failed;
            changed
        };
        if changed {
            self.evaluate_alarms(None);
        }
    }

    pub fn publish_link_state(&self, link: &str, stage: Stage, t: LinkTransition) {
        info!("[bridge] link {link}: {:?} -> {:?}", t.from, t.to);
        let _ = self.bus.publish(
            stage,
            None,
            EventDetail::LinkState {
                link: link.to_string(),
                health: t.to,
                since_last_rx_ms: t.since_last_rx_ms,
            },
        );
    }

    /// Vérifie les timeouts des deux liens ; une transition réévalue les alarmes
    pub fn poll_links(&self) {
        let now = self.now_ms();
        let can = self.can_link.lock().poll(now);
        let uart = self.uart_link.lock().poll(now);

        if let Some(t) = can {
            let err = BridgeError::LinkTimeout { link: "can".into(), since_last_rx_ms: t.since_last_rx_ms };
            warn!("[bridge] {err}");
            self.publish_link_state("can", Stage::Can, t);
        }
        if let Some(t) = uart {
            let err = BridgeError::LinkTimeout { link: "uart".into(), since_last_rx_ms: t.since_last_rx_ms };
            warn!("[bridge] {err}");
            self.publish_link_state("uart", Stage::Uart, t);
        }
        if can.is_some() || uart.is_some() {
            self.evaluate_alarms(None);
        }
    }

    /// Lecture sans effet de bord du document de statut
    pub fn status(&self) -> StatusSnapshot {
        let live = self.live.current();
        let ledger = self.alarms.lock().ledger();
        compose(StatusInputs {
            now_ms: self.now_ms(),
            stats: &self.stats,
            can_link: self.can_state(),
            uart_link: self.uart_state(),
            live: &live,
            ledger,
        })
    }
}

/// Surveillance périodique des liens (timeouts keepalive / UART)
pub fn spawn_link_monitor(core: Arc<BridgeCore>, period: Duration) {
    task::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            core.poll_links();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::AlarmCode;
    use crate::clock::ManualClock;

    fn core() -> (BridgeCore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (BridgeCore::new(BridgeConfig::default(), clock.clone()), clock)
    }

    fn readings(voltage: f64, soc_raw: f64) -> Vec<RegisterReading> {
        vec![
            RegisterReading { address: 36, value: voltage },
            RegisterReading { address: 38, value: 5.0 },
            RegisterReading { address: 46, value: soc_raw },
            RegisterReading { address: 48, value: 250.0 },
            RegisterReading { address: 50, value: 0x91 as f64 },
        ]
    }

    #[test]
    fn test_ingest_sets_origin_and_counts() {
        let (core, _) = core();
        assert!(core.live_origin().is_none());

        let live = core.ingest_batch(&readings(52.0, 40_000.0)).unwrap();
        let origin = live.origin.unwrap();
        assert_eq!(origin.stage, Stage::EventBus);
        assert_eq!(core.stats.uart.rx_success.get(), 1);
        assert!(core.uart_state().ok);

        let trace = core.bus.recent();
        assert_eq!(trace[0].event, "uart_poll");
        assert_eq!(trace[1].event, "live_data");
        assert_eq!(trace[1].chain, trace[0].seq);
    }

    #[test]
    fn test_malformed_line_counts_rx_errors() {
        let (core, _) = core();
        assert!(core.ingest_line("garbage").is_err());
        assert_eq!(core.stats.uart.rx_errors.get(), 1);
        assert!(core.live_origin().is_none());
    }

    #[test]
    fn test_alarm_edges_follow_ingest_chain() {
        let (core, clock) = core();
        core.ingest_batch(&readings(52.0, 2_500.0)).unwrap(); // SOC 5 %
        assert!(core.alarms.lock().is_active(AlarmCode::LowSoc));

        clock.advance(1_000);
        core.ingest_batch(&readings(52.0, 2_500.0)).unwrap();
        let raised = core.bus.recent().iter().filter(|r| r.event == "alarm_raised").count();
        assert_eq!(raised, 1);

        clock.advance(1_000);
        core.ingest_batch(&readings(52.0, 40_000.0)).unwrap();
        let status = core.status();
        assert!(!status.alarms_active);
        assert_eq!(status.alarms.last().unwrap().event, "cleared");
    }

    #[test]
    fn test_uart_timeout_raises_alarm() {
        let (core, clock) = core();
        core.ingest_batch(&readings(52.0, 40_000.0)).unwrap();

        clock.advance(6_000);
        core.poll_links();
        assert!(core.alarms.lock().is_active(AlarmCode::UartTimeout));
        assert!(core.status().alarms_active);

        core.ingest_batch(&readings(52.0, 40_000.0)).unwrap();
        assert!(!core.alarms.lock().is_active(AlarmCode::UartTimeout));
    }

    #[test]
    fn test_low_soc_waits_for_soc_register() {
        let (core, clock) = core();
        core.ingest_batch(&[RegisterReading { address: 36, value: 52.0 }]).unwrap();
        assert!(!core.alarms.lock().is_active(AlarmCode::LowSoc));
        assert!(core.alarms.lock().ledger().is_empty());

        clock.advance(1_000);
        core.ingest_batch(&[RegisterReading { address: 46, value: 2_500.0 }]).unwrap();
        assert!(core.alarms.lock().is_active(AlarmCode::LowSoc));
    }

    #[test]
    fn test_concurrent_evaluations_never_apply_stale_state() {
        let (core, _) = core();
        let core = Arc::new(core);
        core.ingest_batch(&readings(52.0, 40_000.0)).unwrap();

        let ingest = {
            let core = core.clone();
            std::thread::spawn(move || {
                for i in 0..400 {
                    let voltage = if i % 2 == 0 { 43.0 } else { 52.0 };
                    core.ingest_batch(&readings(voltage, 40_000.0)).unwrap();
                }
            })
        };
        let monitor = {
            let core = core.clone();
            std::thread::spawn(move || {
                for _ in 0..400 {
                    core.evaluate_alarms(None);
                    core.poll_links();
                }
            })
        };
        ingest.join().unwrap();
        monitor.join().unwrap();
        core.evaluate_alarms(None);

        // dernier ingest à 52 V : aucune alarme restée levée sur un état périmé
        assert!(!core.alarms.lock().is_active(AlarmCode::UnderVoltage));

        // fronts alternés : jamais deux "raised" (ou deux "cleared") de suite
        let ledger = core.alarms.lock().ledger();
        let under: Vec<&str> = ledger
            .iter()
            .filter(|r| r.identity == AlarmCode::UnderVoltage)
            .map(|r| r.event.as_str())
            .collect();
        assert!(under.windows(2).all(|w| w[0] != w[1]));
        assert_eq!(under.last().copied(), Some("cleared"));
    }

    #[test]
    fn test_status_does_not_mutate() {
        let (core, _) = core();
        core.ingest_batch(&readings(52.0, 40_000.0)).unwrap();
        let published = core.stats.event_bus.published.get();
        let _ = core.status();
        let _ = core.status();
        assert_eq!(core.stats.event_bus.published.get(), published);
    }
}

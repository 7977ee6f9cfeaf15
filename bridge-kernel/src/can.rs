/**
 * CAN PUBLISHER - Protocole BMS Victron
 *
 * RÔLE : Encode le snapshot live en trames 0x351/0x355/0x356/0x35A/0x35E/0x35F
 * sur son propre timer, échange le keepalive 0x305 avec le GX et tient les
 * compteurs tx/rx.
 *
 * ENCODAGE : une valeur hors plage n'interrompt pas le cycle ; elle est
 * bornée, comptée en `tx_errors` et signalée en `EncodeRange`.
 *
 * TRANSPORT : le driver physique est externe, derrière le trait `CanTransport`.
 * `VirtualCanBus` sert de transport en mémoire (tests, devkit, démo).
 */

use crate::bridge::BridgeCore;
use crate::config::CanConf;
use crate::error::BridgeError;
use crate::event_bus::{EventDetail, Stage};
use crate::models::{LiveData, SystemState};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const PGN_LIMITS: u32 = 0x351;
pub const PGN_SOC_SOH: u32 = 0x355;
pub const PGN_MEASURES: u32 = 0x356;
pub const PGN_ALARMS: u32 = 0x35A;
pub const PGN_MANUFACTURER: u32 = 0x35E;
pub const PGN_BATTERY_NAME: u32 = 0x35F;
pub const PGN_KEEPALIVE: u32 = 0x305;
pub const PGN_GX_INFO: u32 = 0x307;

/// Trames émises conservées par le bus virtuel (les plus anciennes sont écartées)
pub const SENT_LOG_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub len: u8,
    pub data: [u8; 8],
}

impl CanFrame {
    pub fn new(id: u32, data: [u8; 8]) -> Self {
        Self { id, len: 8, data }
    }

    pub fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    pub fn i16_at(&self, offset: usize) -> i16 {
        i16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }
}

pub trait CanTransport: Send + Sync {
    fn send(&self, frame: &CanFrame) -> Result<(), BridgeError>;
    fn receive(&self) -> Option<CanFrame>;
    /// Trames perdues par débordement de la file de réception depuis le dernier appel
    fn take_overflows(&self) -> u64;
}

/// Bus CAN en mémoire : journal des trames émises + file de réception bornée
pub struct VirtualCanBus {
    sent: Mutex<VecDeque<CanFrame>>,
    rx: Mutex<VecDeque<CanFrame>>,
    capacity: usize,
    overflows: AtomicU64,
    fail_tx: AtomicBool,
}

impl VirtualCanBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            sent: Mutex::new(VecDeque::new()),
            rx: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            overflows: AtomicU64::new(0),
            fail_tx: AtomicBool::new(false),
        }
    }

    /// Trame entrante (côté GX)
    pub fn inject(&self, frame: CanFrame) {
        let mut rx = self.rx.lock();
        if rx.len() >= self.capacity {
            self.overflows.fetch_add(1, Ordering::Relaxed);
            return;
        }
        rx.push_back(frame);
    }

    pub fn set_tx_failure(&self, fail: bool) {
        self.fail_tx.store(fail, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<CanFrame> {
        self.sent.lock().iter().copied().collect()
    }

    pub fn take_sent(&self) -> Vec<CanFrame> {
        self.sent.lock().drain(..).collect()
    }
}

impl CanTransport for VirtualCanBus {
    fn send(&self, frame: &CanFrame) -> Result<(), BridgeError> {
        if self.fail_tx.load(Ordering::Relaxed) {
            return Err(BridgeError::CanTransmit { id: frame.id, reason: "bus off".into() });
        }
        let mut sent = self.sent.lock();
        if sent.len() == SENT_LOG_CAPACITY {
            sent.pop_front();
        }
        sent.push_back(*frame);
        Ok(())
    }

    fn receive(&self) -> Option<CanFrame> {
        self.rx.lock().pop_front()
    }

    fn take_overflows(&self) -> u64 {
        self.overflows.swap(0, Ordering::Relaxed)
    }
}

fn scaled_u16(field: &'static str, value: f64, factor: f64, errors: &mut Vec<BridgeError>) -> u16 {
    let raw = (value * factor).round();
    if !raw.is_finite() || raw < 0.0 || raw > u16::MAX as f64 {
        errors.push(BridgeError::EncodeRange { field, value, min: 0.0, max: u16::MAX as f64 / factor });
        return if raw.is_nan() { 0 } else { raw.clamp(0.0, u16::MAX as f64) as u16 };
    }
    raw as u16
}

fn scaled_i16(field: &'static str, value: f64, factor: f64, errors: &mut Vec<BridgeError>) -> i16 {
    let raw = (value * factor).round();
    if !raw.is_finite() || raw < i16::MIN as f64 || raw > i16::MAX as f64 {
        errors.push(BridgeError::EncodeRange {
            field,
            value,
            min: i16::MIN as f64 / factor,
            max: i16::MAX as f64 / factor,
        });
        return if raw.is_nan() { 0 } else { raw.clamp(i16::MIN as f64, i16::MAX as f64) as i16 };
    }
    raw as i16
}

fn put_u16(data: &mut [u8; 8], offset: usize, v: u16) {
    data[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_i16(data: &mut [u8; 8], offset: usize, v: i16) {
    data[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn ascii_frame(id: u32, text: &str) -> CanFrame {
    let mut data = [0u8; 8];
    for (slot, b) in data.iter_mut().zip(text.bytes().filter(u8::is_ascii)) {
        *slot = b;
    }
    CanFrame::new(id, data)
}

/// Bitmap 0x35A : créneaux de 2 bits (0 normal, 1 warning, 2 alarm) ;
/// octet 7 créneau 0 = état système (1 online, 2 alarm)
pub fn encode_alarm_bitmap(levels: &BTreeMap<u8, u8>, state: SystemState) -> CanFrame {
    let mut data = [0u8; 8];
    for (bit, level) in levels {
        let (byte, shift) = ((*bit / 8) as usize, bit % 8);
        if byte < 8 {
            data[byte] |= (level & 0b11) << shift;
        }
    }
    let alarm = state == SystemState::Fault || levels.values().any(|l| *l >= 2);
    data[7] = (data[7] & !0b11) | if alarm { 2 } else { 1 };
    CanFrame::new(PGN_ALARMS, data)
}

/// Jeu de trames d'un cycle ; les erreurs d'encodage accompagnent des trames bornées
pub fn encode_frames(live: &LiveData, levels: &BTreeMap<u8, u8>, cfg: &CanConf) -> (Vec<CanFrame>, Vec<BridgeError>) {
    let mut errors = Vec::new();
    let mut frames = Vec::with_capacity(6);

    let mut d = [0u8; 8];
    put_u16(&mut d, 0, scaled_u16("charge_voltage_limit", cfg.charge_voltage_limit_v, 10.0, &mut errors));
    put_i16(&mut d, 2, scaled_i16("max_charge_current", live.max_charge_current_a, 10.0, &mut errors));
    put_i16(&mut d, 4, scaled_i16("max_discharge_current", live.max_discharge_current_a, 10.0, &mut errors));
    put_u16(&mut d, 6, scaled_u16("discharge_voltage_limit", cfg.discharge_voltage_limit_v, 10.0, &mut errors));
    frames.push(CanFrame::new(PGN_LIMITS, d));

    let mut d = [0u8; 8];
    let soc = live.soc_percent.clamp(0.0, 100.0);
    put_u16(&mut d, 0, scaled_u16("soc", soc, 1.0, &mut errors));
    put_u16(&mut d, 2, scaled_u16("soh", live.soh_percent, 1.0, &mut errors));
    put_u16(&mut d, 4, scaled_u16("soc_hires", soc, 100.0, &mut errors));
    frames.push(CanFrame::new(PGN_SOC_SOH, d));

    let mut d = [0u8; 8];
    put_i16(&mut d, 0, scaled_i16("voltage", live.voltage, 100.0, &mut errors));
    put_i16(&mut d, 2, scaled_i16("current", live.current, 10.0, &mut errors));
    put_i16(&mut d, 4, scaled_i16("temperature", live.temperature_c, 10.0, &mut errors));
    frames.push(CanFrame::new(PGN_MEASURES, d));

    frames.push(encode_alarm_bitmap(levels, live.system_state()));
    frames.push(ascii_frame(PGN_MANUFACTURER, &cfg.manufacturer_name));
    frames.push(ascii_frame(PGN_BATTERY_NAME, &cfg.battery_name));

    (frames, errors)
}

pub struct CanPublisher {
    core: Arc<BridgeCore>,
    transport: Arc<dyn CanTransport>,
}

impl CanPublisher {
    pub fn new(core: Arc<BridgeCore>, transport: Arc<dyn CanTransport>) -> Self {
        Self { core, transport }
    }

    /// Vide la file de réception ; retourne le nombre de keepalives reçus
    pub fn poll_rx(&self) -> usize {
        let stats = &self.core.stats.can;
        let overflows = self.transport.take_overflows();
        if overflows > 0 {
            stats.rx_dropped.add(overflows);
            warn!("[can] rx queue overflow, {overflows} frames dropped");
        }

        let mut keepalives = 0;
        while let Some(frame) = self.transport.receive() {
            match frame.id {
                PGN_KEEPALIVE => {
                    let rx_count = stats.rx_success.incr();
                    keepalives += 1;
                    let now = self.core.now_ms();
                    let (interval, transition) = self.core.can_link.lock().record_rx(now);
                    let _ = self.core.bus.publish(
                        Stage::Can,
                        None,
                        EventDetail::KeepaliveRx { interval_ms: interval, can_rx_count: rx_count },
                    );
                    if let Some(t) = transition {
                        self.core.publish_link_state("can", Stage::Can, t);
                        self.core.evaluate_alarms(None);
                    }
                }
                PGN_GX_INFO => {
                    stats.rx_success.incr();
                }
                other => {
                    stats.rx_dropped.incr();
                    debug!("[can] unexpected frame 0x{other:03X} dropped");
                }
            }
        }
        keepalives
    }

    /// Émet le keepalive 0x305 quand l'intervalle est écoulé
    pub fn keepalive_cycle(&self) -> bool {
        let now = self.core.now_ms();
        if !self.core.can_link.lock().should_send(now) {
            return false;
        }
        let frame = CanFrame::new(PGN_KEEPALIVE, [0u8; 8]);
        let stats = &self.core.stats.can;
        match self.transport.send(&frame) {
            Ok(()) => {
                let count = stats.tx_success.incr();
                self.core.can_link.lock().record_tx(now);
                let _ = self.core.bus.publish(Stage::Can, None, EventDetail::KeepaliveTx { can_tx_count: count });
                true
            }
            Err(e) => {
                stats.tx_errors.incr();
                // on retente au prochain tick, pas en boucle
                self.core.can_link.lock().record_tx(now);
                warn!("[can] keepalive not sent: {e}");
                false
            }
        }
    }

    /// Un cycle PGN complet ; None tant qu'aucune donnée live n'existe
    pub fn publish_cycle(&self) -> Option<(usize, usize)> {
        let live = self.core.live.current();
        let origin = live.origin?;
        let levels = self.core.alarms.lock().active_levels();
        let (frames, encode_errors) = encode_frames(&live, &levels, &self.core.config.can);

        let stats = &self.core.stats.can;
        for e in &encode_errors {
            debug!("[can] {e}");
        }
        stats.encode_clamped.add(encode_errors.len() as u64);
        stats.tx_errors.add(encode_errors.len() as u64);

        let mut sent = 0;
        let mut failed = 0;
        for frame in &frames {
            match self.transport.send(frame) {
                Ok(()) => {
                    stats.tx_success.incr();
                    sent += 1;
                }
                Err(e) => {
                    stats.tx_errors.incr();
                    failed += 1;
                    debug!("[can] {e}");
                }
            }
        }
        if failed > 0 {
            warn!("[can] {failed}/{} frames failed this cycle", frames.len());
        }
        self.core.set_can_tx_failed(failed > 0);

        let _ = self.core.bus.publish(
            Stage::Can,
            Some(&origin),
            EventDetail::CanTx {
                frames: sent,
                errors: failed + encode_errors.len(),
                can_tx_count: stats.tx_success.get(),
                can_tx_errors: stats.tx_errors.get(),
            },
        );
        Some((sent, failed))
    }

    /// Boucle runtime : cadence PGN propre, indépendante de l'ingest
    pub async fn run(self) {
        let cfg = &self.core.config.can;
        let mut pgn = tokio::time::interval(Duration::from_millis(cfg.pgn_interval_ms.max(1)));
        let mut poll = tokio::time::interval(Duration::from_millis(cfg.poll_interval_ms.max(1)));
        pgn.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("[can] publisher started (pgn every {} ms)", cfg.pgn_interval_ms);

        loop {
            tokio::select! {
                _ = pgn.tick() => {
                    self.publish_cycle();
                }
                _ = poll.tick() => {
                    self.poll_rx();
                    self.keepalive_cycle();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BridgeConfig;
    use crate::ingest::RegisterReading;

    fn setup() -> (Arc<BridgeCore>, Arc<VirtualCanBus>, CanPublisher, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let core = Arc::new(BridgeCore::new(BridgeConfig::default(), clock.clone()));
        let bus = Arc::new(VirtualCanBus::new(4));
        let publisher = CanPublisher::new(core.clone(), bus.clone());
        (core, bus, publisher, clock)
    }

    fn ingest(core: &BridgeCore) {
        core.ingest_batch(&[
            RegisterReading { address: 36, value: 52.34 },
            RegisterReading { address: 38, value: -12.5 },
            RegisterReading { address: 46, value: 40_000.0 },
            RegisterReading { address: 45, value: 50_000.0 },
            RegisterReading { address: 48, value: 253.0 },
            RegisterReading { address: 50, value: 0x93 as f64 },
            RegisterReading { address: 102, value: 1000.0 },
            RegisterReading { address: 103, value: 500.0 },
        ])
        .unwrap();
    }

    #[test]
    fn test_encode_layout() {
        let mut live = LiveData {
            voltage: 52.34,
            current: -12.5,
            soc_percent: 80.0,
            soh_percent: 100.0,
            temperature_c: 25.3,
            max_charge_current_a: 50.0,
            max_discharge_current_a: 100.0,
            online_status: 0x93,
            ..Default::default()
        };
        live.derive();
        let (frames, errors) = encode_frames(&live, &BTreeMap::new(), &CanConf::default());
        assert!(errors.is_empty());

        let by_id = |id| frames.iter().find(|f| f.id == id).unwrap();
        assert_eq!(by_id(PGN_LIMITS).u16_at(0), 568);
        assert_eq!(by_id(PGN_LIMITS).i16_at(2), 500);
        assert_eq!(by_id(PGN_SOC_SOH).u16_at(0), 80);
        assert_eq!(by_id(PGN_SOC_SOH).u16_at(4), 8000);
        assert_eq!(by_id(PGN_MEASURES).i16_at(0), 5234);
        assert_eq!(by_id(PGN_MEASURES).i16_at(2), -125);
        assert_eq!(by_id(PGN_MEASURES).i16_at(4), 253);
        assert_eq!(by_id(PGN_ALARMS).data[7] & 0b11, 1);
        assert_eq!(&by_id(PGN_MANUFACTURER).data[..7], b"TinyBMS");
    }

    #[test]
    fn test_out_of_range_is_clamped_not_fatal() {
        let live = LiveData { voltage: 400.0, current: -5000.0, ..Default::default() };
        let (frames, errors) = encode_frames(&live, &BTreeMap::new(), &CanConf::default());
        assert_eq!(frames.len(), 6);
        assert_eq!(errors.len(), 2);
        let measures = frames.iter().find(|f| f.id == PGN_MEASURES).unwrap();
        assert_eq!(measures.i16_at(0), i16::MAX);
        assert_eq!(measures.i16_at(2), i16::MIN);
    }

    #[test]
    fn test_alarm_bitmap_slots() {
        let levels: BTreeMap<u8, u8> = [(0u8, 2u8), (10, 1), (58, 2)].into_iter().collect();
        let frame = encode_alarm_bitmap(&levels, SystemState::Fault);
        assert_eq!(frame.data[0] & 0b11, 2);
        assert_eq!((frame.data[1] >> 2) & 0b11, 1);
        assert_eq!((frame.data[7] >> 2) & 0b11, 2);
        assert_eq!(frame.data[7] & 0b11, 2);
    }

    #[test]
    fn test_no_cycle_before_live_data() {
        let (core, bus, publisher, _) = setup();
        assert_eq!(publisher.publish_cycle(), None);
        assert!(bus.sent().is_empty());

        ingest(&core);
        assert_eq!(publisher.publish_cycle(), Some((6, 0)));
        assert_eq!(core.stats.can.tx_success.get(), 6);

        let trace = core.bus.recent();
        let can_tx = trace.iter().find(|r| r.event == "can_tx").unwrap();
        let live = trace.iter().find(|r| r.event == "live_data").unwrap();
        assert_eq!(can_tx.chain, live.chain);
        assert_eq!(can_tx.metrics.as_ref().unwrap()["can_tx_count"], 6);
    }

    #[test]
    fn test_tx_failure_counts_and_raises_alarm() {
        let (core, bus, publisher, clock) = setup();
        ingest(&core);
        bus.set_tx_failure(true);
        assert_eq!(publisher.publish_cycle(), Some((0, 6)));
        assert_eq!(core.stats.can.tx_errors.get(), 6);
        assert!(core.alarms.lock().is_active(crate::alarms::AlarmCode::CanTxError));

        bus.set_tx_failure(false);
        clock.advance(1000);
        publisher.publish_cycle();
        assert!(!core.alarms.lock().is_active(crate::alarms::AlarmCode::CanTxError));
        // tx_success ne régresse jamais
        assert_eq!(core.stats.can.tx_success.get(), 6);
    }

    #[test]
    fn test_keepalive_exchange() {
        let (core, bus, publisher, clock) = setup();
        assert!(publisher.keepalive_cycle());
        assert!(!publisher.keepalive_cycle());

        for _ in 0..3 {
            clock.advance(998);
            bus.inject(CanFrame::new(PGN_KEEPALIVE, [0; 8]));
            assert_eq!(publisher.poll_rx(), 1);
        }
        bus.inject(CanFrame::new(0x123, [0; 8]));
        publisher.poll_rx();

        let state = core.can_state();
        assert!(state.ok);
        assert_eq!(state.rx_count, 3);
        assert_eq!(core.stats.can.rx_success.get(), 3);
        assert_eq!(core.stats.can.rx_dropped.get(), 1);
    }

    #[test]
    fn test_rx_overflow_counts_dropped() {
        let (core, bus, publisher, _) = setup();
        for _ in 0..6 {
            bus.inject(CanFrame::new(PGN_GX_INFO, [0; 8]));
        }
        publisher.poll_rx();
        assert_eq!(core.stats.can.rx_success.get(), 4);
        assert_eq!(core.stats.can.rx_dropped.get(), 2);
    }
}

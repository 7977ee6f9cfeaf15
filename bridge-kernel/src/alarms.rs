/**
 * ALARM ENGINE - Évaluation des alarmes sur front
 *
 * RÔLE :
 * - `evaluate` : fonction pure (LiveData, états keepalive, défauts explicites)
 *   → ensemble des alarmes actives
 * - `AlarmEngine` : compare avec l'ensemble précédent et n'émet qu'aux fronts
 *   (raised / cleared) dans un ledger borné, le plus ancien évincé en premier
 *
 * MAPPING VICTRON : table statique (bit 0x35A, niveau, chemin D-Bus) par alarme.
 */

use crate::keepalive::KeepaliveState;
use crate::models::{LiveData, SystemState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmCode {
    OverVoltage,
    UnderVoltage,
    OverTemperature,
    LowTempCharge,
    CellImbalance,
    CellImbalanceWarning,
    UartTimeout,
    CanTxError,
    CanKeepaliveLost,
    BmsFault,
    LowSoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlarmSeverity {
    Info = 0,
    Warning = 1,
    Error = 2,
    Critical = 3,
}

impl AlarmSeverity {
    pub fn name(self) -> &'static str {
        match self {
            AlarmSeverity::Info => "info",
            AlarmSeverity::Warning => "warning",
            AlarmSeverity::Error => "error",
            AlarmSeverity::Critical => "critical",
        }
    }

    /// Niveau Victron : 0 normal, 1 warning, 2 alarm
    pub fn victron_level(self) -> u8 {
        match self {
            AlarmSeverity::Info => 0,
            AlarmSeverity::Warning => 1,
            AlarmSeverity::Error | AlarmSeverity::Critical => 2,
        }
    }
}

pub struct AlarmSpec {
    pub code: AlarmCode,
    pub id: u16,
    pub severity: AlarmSeverity,
    pub victron_bit: u8,
    pub victron_path: &'static str,
}

pub static ALARM_TABLE: [AlarmSpec; 11] = [
    AlarmSpec { code: AlarmCode::OverVoltage, id: 1, severity: AlarmSeverity::Error, victron_bit: 2, victron_path: "/Alarms/HighVoltage" },
    AlarmSpec { code: AlarmCode::UnderVoltage, id: 2, severity: AlarmSeverity::Error, victron_bit: 0, victron_path: "/Alarms/LowVoltage" },
    AlarmSpec { code: AlarmCode::OverTemperature, id: 20, severity: AlarmSeverity::Error, victron_bit: 4, victron_path: "/Alarms/HighTemperature" },
    AlarmSpec { code: AlarmCode::LowTempCharge, id: 22, severity: AlarmSeverity::Error, victron_bit: 6, victron_path: "/Alarms/LowTemperatureCharge" },
    AlarmSpec { code: AlarmCode::CellImbalance, id: 30, severity: AlarmSeverity::Error, victron_bit: 8, victron_path: "/Alarms/CellImbalance" },
    AlarmSpec { code: AlarmCode::CellImbalanceWarning, id: 31, severity: AlarmSeverity::Warning, victron_bit: 8, victron_path: "/Alarms/CellImbalance" },
    AlarmSpec { code: AlarmCode::UartTimeout, id: 41, severity: AlarmSeverity::Error, victron_bit: 10, victron_path: "/Alarms/Communication" },
    AlarmSpec { code: AlarmCode::CanTxError, id: 44, severity: AlarmSeverity::Warning, victron_bit: 10, victron_path: "/Alarms/Communication" },
    AlarmSpec { code: AlarmCode::CanKeepaliveLost, id: 45, severity: AlarmSeverity::Warning, victron_bit: 10, victron_path: "/Alarms/Communication" },
    AlarmSpec { code: AlarmCode::BmsFault, id: 61, severity: AlarmSeverity::Critical, victron_bit: 58, victron_path: "/Alarms/SystemShutdown" },
    AlarmSpec { code: AlarmCode::LowSoc, id: 70, severity: AlarmSeverity::Warning, victron_bit: 12, victron_path: "/Alarms/LowSoc" },
];

impl AlarmCode {
    pub fn spec(self) -> &'static AlarmSpec {
        // la table couvre chaque variante, cf. test_table_covers_every_code
        ALARM_TABLE
            .iter()
            .find(|s| s.code == self)
            .unwrap_or(&ALARM_TABLE[0])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmThresholds {
    pub under_voltage_v: f64,
    pub over_voltage_v: f64,
    pub over_temperature_c: f64,
    pub low_temp_charge_c: f64,
    pub low_temp_charge_current_a: f64,
    pub imbalance_warning_mv: u16,
    pub imbalance_alarm_mv: u16,
    pub low_soc_percent: f64,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            under_voltage_v: 44.0,
            over_voltage_v: 58.4,
            over_temperature_c: 55.0,
            low_temp_charge_c: 0.0,
            low_temp_charge_current_a: 3.0,
            imbalance_warning_mv: 100,
            imbalance_alarm_mv: 200,
            low_soc_percent: 10.0,
        }
    }
}

/// Défauts signalés explicitement par les publishers
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultInputs {
    pub can_tx_failed: bool,
}

/// Ensemble des alarmes actives. `live` vaut None tant qu'aucun cycle d'ingest
/// n'a produit de données.
pub fn evaluate(
    live: Option<&LiveData>,
    can_link: &KeepaliveState,
    uart_link: &KeepaliveState,
    faults: FaultInputs,
    th: &AlarmThresholds,
) -> BTreeSet<AlarmCode> {
    let mut set = BTreeSet::new();

    if let Some(d) = live {
        if d.voltage > 0.1 && d.voltage < th.under_voltage_v {
            set.insert(AlarmCode::UnderVoltage);
        }
        if d.voltage > th.over_voltage_v {
            set.insert(AlarmCode::OverVoltage);
        }
        if d.temperature_c > th.over_temperature_c {
            set.insert(AlarmCode::OverTemperature);
        }
        if d.temperature_c < th.low_temp_charge_c && d.current > th.low_temp_charge_current_a {
            set.insert(AlarmCode::LowTempCharge);
        }
        if d.cell_imbalance_mv > th.imbalance_alarm_mv {
            set.insert(AlarmCode::CellImbalance);
        } else if d.cell_imbalance_mv > th.imbalance_warning_mv {
            set.insert(AlarmCode::CellImbalanceWarning);
        }
        // SOC jamais lu : la valeur par défaut 0 % n'est pas une mesure
        if d.soc_seen && d.soc_percent <= th.low_soc_percent {
            set.insert(AlarmCode::LowSoc);
        }
        if d.system_state() == SystemState::Fault {
            set.insert(AlarmCode::BmsFault);
        }
    }

    // un lien jamais vu n'est pas "perdu"
    if !uart_link.ok && uart_link.rx_count > 0 {
        set.insert(AlarmCode::UartTimeout);
    }
    if !can_link.ok && can_link.rx_count > 0 {
        set.insert(AlarmCode::CanKeepaliveLost);
    }
    if faults.can_tx_failed {
        set.insert(AlarmCode::CanTxError);
    }
    set
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub event: String, // "raised" | "cleared"
    pub identity: AlarmCode,
    pub code: u16,
    pub severity: u8,
    pub severity_name: String,
    pub active: bool,
    pub timestamp_ms: u64,
    pub victron_bit: u8,
    pub victron_level: u8,
    pub victron_path: String,
}

impl AlarmRecord {
    fn new(code: AlarmCode, raised: bool, timestamp_ms: u64) -> Self {
        let spec = code.spec();
        Self {
            event: if raised { "raised" } else { "cleared" }.to_string(),
            identity: code,
            code: spec.id,
            severity: spec.severity as u8,
            severity_name: spec.severity.name().to_string(),
            active: raised,
            timestamp_ms,
            victron_bit: spec.victron_bit,
            victron_level: spec.severity.victron_level(),
            victron_path: spec.victron_path.to_string(),
        }
    }
}

pub struct AlarmEngine {
    active: BTreeSet<AlarmCode>,
    ledger: VecDeque<AlarmRecord>,
    capacity: usize,
}

impl AlarmEngine {
    pub fn new(capacity: usize) -> Self {
        Self {
            active: BTreeSet::new(),
            ledger: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Applique un nouvel ensemble actif, retourne les fronts dans l'ordre
    pub fn apply(&mut self, next: &BTreeSet<AlarmCode>, now_ms: u64) -> Vec<AlarmRecord> {
        let mut edges = Vec::new();

        for code in next.difference(&self.active) {
            edges.push(AlarmRecord::new(*code, true, now_ms));
        }
        for code in self.active.difference(next) {
            // `active` suit la dernière transition de l'identité
            for rec in self.ledger.iter_mut().filter(|r| r.identity == *code) {
                rec.active = false;
            }
            edges.push(AlarmRecord::new(*code, false, now_ms));
        }

        for rec in &edges {
            if self.ledger.len() == self.capacity {
                self.ledger.pop_front();
            }
            self.ledger.push_back(rec.clone());
        }
        self.active = next.clone();
        edges
    }

    pub fn ledger(&self) -> Vec<AlarmRecord> {
        self.ledger.iter().cloned().collect()
    }

    pub fn active(&self) -> &BTreeSet<AlarmCode> {
        &self.active
    }

    pub fn is_active(&self, code: AlarmCode) -> bool {
        self.active.contains(&code)
    }

    /// `active` du dernier événement "raised" du ledger
    pub fn alarms_active(&self) -> bool {
        alarms_active_of(self.ledger.iter())
    }

    /// Niveau par bit Victron (le plus sévère gagne quand plusieurs alarmes partagent un bit)
    pub fn active_levels(&self) -> BTreeMap<u8, u8> {
        let mut levels = BTreeMap::new();
        for code in &self.active {
            let spec = code.spec();
            let level = spec.severity.victron_level();
            let slot = levels.entry(spec.victron_bit).or_insert(0u8);
            *slot = (*slot).max(level);
        }
        levels
    }
}

pub fn alarms_active_of<'a>(records: impl DoubleEndedIterator<Item = &'a AlarmRecord>) -> bool {
    records
        .rev()
        .find(|r| r.event == "raised")
        .map(|r| r.active)
        .unwrap_or(false)
}

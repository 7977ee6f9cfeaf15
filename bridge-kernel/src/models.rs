use crate::event_bus::Cause;
use serde::{Deserialize, Serialize};

/// Données live décodées du BMS, remplacées en bloc à chaque cycle d'ingest
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LiveData {
    pub voltage: f64,              // V
    pub current: f64,              // A (négatif = décharge)
    pub pack_power_w: f64,         // voltage * current
    pub soc_percent: f64,
    pub soh_percent: f64,
    pub temperature_c: f64,
    pub min_cell_mv: u16,
    pub max_cell_mv: u16,
    pub cell_imbalance_mv: u16,    // max - min
    pub balancing_bits: u16,
    pub max_charge_current_a: f64,
    pub max_discharge_current_a: f64,
    pub online_status: u16,        // mot d'état brut du BMS (0x91..0x9B)
    pub system_state_code: u8,
    pub system_state_name: String,
    pub system_state_raw: u16,
    pub updated_ms: u64,
    /// Vrai dès qu'un batch a porté le registre SOC (46)
    #[serde(skip)]
    pub soc_seen: bool,
    /// Événement `live_data` du bus qui a publié ce snapshot
    #[serde(skip)]
    pub origin: Option<Cause>,
}

/// Champs exposés aux clients (filtre de souscription WebSocket)
pub const LIVE_FIELDS: &[&str] = &[
    "voltage",
    "current",
    "pack_power_w",
    "soc_percent",
    "soh_percent",
    "temperature_c",
    "min_cell_mv",
    "max_cell_mv",
    "cell_imbalance_mv",
    "balancing_bits",
    "max_charge_current_a",
    "max_discharge_current_a",
    "online_status",
    "system_state_code",
    "system_state_name",
    "system_state_raw",
];

impl LiveData {
    /// Recalcule les champs dérivés après application d'un batch de registres
    pub fn derive(&mut self) {
        self.pack_power_w = round_to(self.voltage * self.current, 1);
        self.cell_imbalance_mv = self.max_cell_mv.saturating_sub(self.min_cell_mv);
        let state = SystemState::from_status(self.online_status);
        self.system_state_code = state.code();
        self.system_state_name = state.name().to_string();
        self.system_state_raw = self.online_status;
    }

    pub fn system_state(&self) -> SystemState {
        SystemState::from_status(self.online_status)
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// États système dérivés du mot d'état TinyBMS, projetés sur /System/0/State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Unknown,
    Idle,
    Charging,
    FullyCharged,
    Discharging,
    Regeneration,
    Fault,
}

impl SystemState {
    pub fn from_status(raw: u16) -> Self {
        match raw {
            0x91 => SystemState::Charging,
            0x92 => SystemState::FullyCharged,
            0x93 => SystemState::Discharging,
            0x96 => SystemState::Regeneration,
            0x97 => SystemState::Idle,
            0x9B => SystemState::Fault,
            _ => SystemState::Unknown,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            SystemState::Unknown => 0,
            SystemState::Idle => 1,
            SystemState::Charging => 3,
            SystemState::FullyCharged => 4,
            SystemState::Discharging => 5,
            SystemState::Regeneration => 6,
            SystemState::Fault => 10,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SystemState::Unknown => "unknown",
            SystemState::Idle => "idle",
            SystemState::Charging => "charging",
            SystemState::FullyCharged => "fully_charged",
            SystemState::Discharging => "discharging",
            SystemState::Regeneration => "regeneration",
            SystemState::Fault => "fault",
        }
    }

    pub fn is_online(self) -> bool {
        !matches!(self, SystemState::Fault | SystemState::Unknown)
    }
}

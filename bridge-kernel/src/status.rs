use crate::alarms::{alarms_active_of, AlarmRecord};
use crate::keepalive::KeepaliveState;
use crate::models::LiveData;
use crate::stats::{BridgeStats, StatsSnapshot};
use serde::{Deserialize, Serialize};

/// Projection Victron de l'état système
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VictronView {
    pub system_state_code: u8,
    pub system_state_name: String,
    pub system_state_raw: u16,
    pub pack_power_w: f64,
}

/// Document de statut unique exposé par HTTP, WebSocket et MQTT
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub uptime_ms: u64,
    pub stats: StatsSnapshot,
    pub live_data: LiveData,
    pub alarms: Vec<AlarmRecord>,
    pub alarms_active: bool,
    pub victron: VictronView,
}

/// Entrées déjà lues par l'appelant ; `compose` ne touche à aucun état source
pub struct StatusInputs<'a> {
    pub now_ms: u64,
    pub stats: &'a BridgeStats,
    pub can_link: KeepaliveState,
    pub uart_link: KeepaliveState,
    pub live: &'a LiveData,
    pub ledger: Vec<AlarmRecord>,
}

pub fn compose(inputs: StatusInputs<'_>) -> StatusSnapshot {
    let live = inputs.live;
    StatusSnapshot {
        uptime_ms: inputs.now_ms,
        stats: inputs.stats.snapshot(inputs.can_link, &inputs.uart_link),
        live_data: live.clone(),
        alarms_active: alarms_active_of(inputs.ledger.iter()),
        alarms: inputs.ledger,
        victron: VictronView {
            system_state_code: live.system_state_code,
            system_state_name: live.system_state_name.clone(),
            system_state_raw: live.system_state_raw,
            pack_power_w: live.pack_power_w,
        },
    }
}

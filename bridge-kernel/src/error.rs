use crate::event_bus::Stage;

/// Erreurs du pipeline bridge.
/// Aucune n'arrête le process : chaque erreur de cycle est comptée puis retentée au tick suivant.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("stage order violation: {stage} event caused by {cause_stage} event #{cause_seq}")]
    StageOrderViolation {
        stage: Stage,
        cause_stage: Stage,
        cause_seq: u64,
    },
    #[error("link {link} timed out: no rx for {since_last_rx_ms} ms")]
    LinkTimeout { link: String, since_last_rx_ms: u64 },
    #[error("{field} = {value} outside encodable range [{min}, {max}]")]
    EncodeRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("publish failed on {topic}: {reason}")]
    PublishFailure { topic: String, reason: String },
    #[error("client {client_id} missed heartbeat for {since_last_heartbeat_ms} ms")]
    ClientHeartbeatTimeout {
        client_id: String,
        since_last_heartbeat_ms: u64,
    },
    #[error("register {address} ({key}): {reason}")]
    RegisterBoundsViolation {
        address: u16,
        key: String,
        reason: String,
    },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unknown register {0}")]
    UnknownRegister(u16),
    #[error("CAN transmit failed for 0x{id:03X}: {reason}")]
    CanTransmit { id: u32, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Decode(e.to_string())
    }
}

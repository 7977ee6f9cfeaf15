use crate::alarms::AlarmThresholds;
use crate::keepalive::KeepaliveConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub http: HttpConf,
    pub mqtt: MqttConf,
    pub can: CanConf,
    pub keepalive: KeepaliveConf,
    pub uart: UartConf,
    pub websocket: WebSocketConf,
    pub alarms: AlarmsConf,
    pub trace: TraceConf,
    pub registers: RegistersConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub root_topic: String,
    pub keep_alive_secs: u64,
    pub publish_interval_ms: u64,
    pub qos: u8,
    pub retain: bool,
    pub release: String, // version du catalogue de topics publié
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 1883,
            client_id: "tinybridge".into(),
            username: None,
            password: None,
            root_topic: "tinybms".into(),
            keep_alive_secs: 15,
            publish_interval_ms: 1000,
            qos: 1,
            retain: false,
            release: "2.0".into(),
        }
    }
}

impl MqttConf {
    /// Hôte renseigné, indépendamment de `enabled`
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CanConf {
    pub pgn_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub rx_queue_capacity: usize,
    pub manufacturer_name: String,
    pub battery_name: String,
    pub charge_voltage_limit_v: f64,
    pub discharge_voltage_limit_v: f64,
}

impl Default for CanConf {
    fn default() -> Self {
        Self {
            pgn_interval_ms: 1000,
            poll_interval_ms: 100,
            rx_queue_capacity: 64,
            manufacturer_name: "TinyBMS".into(),
            battery_name: "LiFePO4".into(),
            charge_voltage_limit_v: 56.8,
            discharge_voltage_limit_v: 44.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KeepaliveConf {
    pub interval_ms: u64,
    pub timeout_factor: u64,
    pub window: usize,
    pub max_spread_ms: Option<u64>,
}

impl Default for KeepaliveConf {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            timeout_factor: 10,
            window: 10,
            max_spread_ms: Some(100),
        }
    }
}

impl KeepaliveConf {
    pub fn supervisor(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            interval_ms: self.interval_ms,
            timeout_ms: self.interval_ms.saturating_mul(self.timeout_factor.max(1)),
            window: self.window.max(2),
            max_spread_ms: self.max_spread_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UartConf {
    pub feed_bind: Option<String>,
    pub link_interval_ms: u64,
    pub link_timeout_ms: u64,
    pub write_queue: usize,
}

impl Default for UartConf {
    fn default() -> Self {
        Self {
            feed_bind: Some("0.0.0.0:9750".into()),
            link_interval_ms: 1000,
            link_timeout_ms: 5000,
            write_queue: 16,
        }
    }
}

impl UartConf {
    /// Le lien UART n'a pas de borne de jitter : seul le timeout compte
    pub fn supervisor(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            interval_ms: self.link_interval_ms,
            timeout_ms: self.link_timeout_ms,
            window: 10,
            max_spread_ms: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WebSocketConf {
    pub update_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub outbox_capacity: usize,
}

impl Default for WebSocketConf {
    fn default() -> Self {
        Self {
            update_interval_ms: 1000,
            heartbeat_timeout_ms: 5000,
            outbox_capacity: 32,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AlarmsConf {
    pub ledger_capacity: usize,
    pub thresholds: AlarmThresholds,
}

impl Default for AlarmsConf {
    fn default() -> Self {
        Self {
            ledger_capacity: 64,
            thresholds: AlarmThresholds::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TraceConf {
    pub path: Option<String>,
    pub recent_capacity: usize,
    pub bus_capacity: usize,
}

impl Default for TraceConf {
    fn default() -> Self {
        Self {
            path: None,
            recent_capacity: 256,
            bus_capacity: 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RegistersConf {
    pub catalog_path: Option<String>,
}

/// Texte vide = défauts ; YAML invalide = erreur
pub fn parse_config(txt: &str) -> Result<BridgeConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(BridgeConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> BridgeConfig {
    let path = std::env::var("TINYBRIDGE_CONFIG").unwrap_or_else(|_| "bridge.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("[bridge] invalid config ({path}): {e}");
            BridgeConfig::default()
        })
    } else {
        warn!("[bridge] no {path}, using default config");
        BridgeConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yields_defaults() {
        let cfg = parse_config("  \n").unwrap();
        assert_eq!(cfg.websocket.heartbeat_timeout_ms, 5000);
        assert_eq!(cfg.alarms.ledger_capacity, 64);
        assert!(!cfg.mqtt.is_configured());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let cfg = parse_config(
            "mqtt:\n  enabled: true\n  host: broker.local\nkeepalive:\n  timeout_factor: 5\nalarms:\n  thresholds:\n    low_soc_percent: 15\n",
        )
        .unwrap();
        assert!(cfg.mqtt.enabled && cfg.mqtt.is_configured());
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.keepalive.supervisor().timeout_ms, 5000);
        assert_eq!(cfg.alarms.thresholds.low_soc_percent, 15.0);
        assert_eq!(cfg.alarms.thresholds.over_voltage_v, 58.4);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(parse_config("mqtt: [unterminated").is_err());
    }
}

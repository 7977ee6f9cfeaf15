/*!
# TinyBridge Kernel

Pont de télémétrie TinyBMS → Victron GX : ingest des registres BMS, publication
CAN (protocole BMS Victron), MQTT et WebSocket, moteur d'alarmes et supervision
keepalive, le tout ordonné par un bus d'événements causal.
*/

pub mod alarms;
pub mod bridge;
pub mod can;
pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod http;
pub mod ingest;
pub mod keepalive;
pub mod models;
pub mod mqtt;
pub mod registers;
pub mod state;
pub mod stats;
pub mod status;
pub mod topics;
pub mod trace;
pub mod websocket;

pub use bridge::BridgeCore;
pub use clock::{BootClock, Clock, ManualClock};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use event_bus::{EventBus, Stage, TraceRecord};

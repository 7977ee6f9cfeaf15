/*!
# TinyBridge DevKit - Mocks et Vérificateurs pour le bridge

Bibliothèque facilitant les tests du bridge TinyBMS → Victron avec:
- Mock MQTT derrière le trait `MqttSink` du kernel
- Harness pas à pas sur horloge manuelle (ingest, CAN, MQTT, WebSocket)
- Vérificateurs de conformité des interfaces externes (trace, statut, topics, matrice)
*/

pub mod mqtt_stub;
pub mod contract_helpers;
pub mod test_utils;

pub use mqtt_stub::MockMqttClient;
pub use contract_helpers::{check_trace, ContractReport};
pub use test_utils::{PackReadings, TestHarness};

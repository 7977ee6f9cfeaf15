/*!
Mock MQTT Client pour développement sans broker

Remplace `rumqttc::AsyncClient` derrière le trait `MqttSink` du kernel : enregistre
tous les messages publiés et permet de simuler un broker saturé.
*/

use rumqttc::QoS;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tinybridge_kernel::error::BridgeError;
use tinybridge_kernel::mqtt::MqttSink;
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock MQTT Client qui simule la file d'émission du broker
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    failing: Arc<AtomicBool>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn messages(&self) -> MutexGuard<'_, Vec<MockMessage>> {
        self.published_messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simule une file pleine : chaque publication échoue tant que actif
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Récupère tous les messages publiés (pour assertions de tests)
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.messages().clone()
    }

    /// Trouve les messages publiés sur un topic donné
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.messages()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Topics distincts, dans l'ordre de première publication
    pub fn topics(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for msg in self.messages().iter() {
            if !seen.contains(&msg.topic) {
                seen.push(msg.topic.clone());
            }
        }
        seen
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    /// Valeurs `value` successives publiées sur un topic
    pub fn values(&self, topic: &str) -> Vec<f64> {
        self.find_messages_by_topic(topic)
            .iter()
            .filter_map(|m| serde_json::from_slice::<Value>(&m.payload).ok())
            .filter_map(|v| v["value"].as_f64())
            .collect()
    }

    /// Reset tous les messages enregistrés
    pub fn clear(&self) {
        self.messages().clear();
    }
}

impl MqttSink for MockMqttClient {
    fn publish_bytes(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<(), BridgeError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(BridgeError::PublishFailure {
                topic: topic.to_string(),
                reason: "mock queue full".into(),
            });
        }
        log::debug!("[mock] published to {}: {} bytes", topic, payload.len());
        self.messages().push(MockMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_client_records_publishes() {
        let client = MockMqttClient::new();
        let payload = serde_json::to_vec(&serde_json::json!({ "value": 52.4 })).unwrap();
        client.publish_bytes("tinybms/battery_pack_voltage", QoS::AtLeastOnce, false, payload).unwrap();
        client.publish_bytes("tinybms/state_of_charge", QoS::AtLeastOnce, false, b"{\"value\":80}".to_vec()).unwrap();

        assert_eq!(client.topics(), vec!["tinybms/battery_pack_voltage", "tinybms/state_of_charge"]);
        assert_eq!(client.values("tinybms/battery_pack_voltage"), vec![52.4]);

        let parsed: Option<Value> = client.get_last_json_message("tinybms/state_of_charge").unwrap();
        assert_eq!(parsed.unwrap()["value"], 80);
    }

    #[test]
    fn test_failing_mode_rejects() {
        let client = MockMqttClient::new();
        client.set_failing(true);
        let err = client.publish_bytes("t", QoS::AtMostOnce, false, vec![]).unwrap_err();
        assert!(matches!(err, BridgeError::PublishFailure { .. }));
        assert!(client.get_published_messages().is_empty());

        client.set_failing(false);
        client.publish_bytes("t", QoS::AtMostOnce, false, vec![]).unwrap();
        client.clear();
        assert!(client.get_published_messages().is_empty());
    }
}

/**
 * MQTT TOPIC CATALOG - Catalogue versionné et figé
 *
 * RÔLE : Table append-only des topics publiés, chaque topic étiqueté par la
 * release qui l'a introduit. Une release publie tous les topics des releases
 * précédentes : on ajoute des topics, on n'en renomme ni n'en retire jamais.
 */

use crate::models::LiveData;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Copy)]
pub enum TopicSource {
    Live(fn(&LiveData) -> f64),
    /// Niveau Victron (0/1/2) des alarmes actives sur ce chemin
    Alarm(&'static str),
}

pub struct TopicSpec {
    pub suffix: &'static str,
    pub since: &'static str,
    pub unit: Option<&'static str>,
    pub dbus_path: Option<&'static str>,
    pub source: TopicSource,
}

macro_rules! live {
    ($suffix:expr, $since:expr, $unit:expr, $path:expr, $f:expr) => {
        TopicSpec { suffix: $suffix, since: $since, unit: $unit, dbus_path: $path, source: TopicSource::Live($f) }
    };
}

macro_rules! alarm {
    ($suffix:expr, $path:expr) => {
        TopicSpec { suffix: $suffix, since: "2.0", unit: None, dbus_path: Some($path), source: TopicSource::Alarm($path) }
    };
}

pub static TOPIC_TABLE: [TopicSpec; 20] = [
    live!("battery_pack_voltage", "1.0", Some("V"), Some("/Dc/0/Voltage"), |d| d.voltage),
    live!("battery_pack_current", "1.0", Some("A"), Some("/Dc/0/Current"), |d| d.current),
    live!("internal_temperature", "1.0", Some("°C"), Some("/Dc/0/Temperature"), |d| d.temperature_c),
    live!("state_of_charge", "1.0", Some("%"), Some("/Soc"), |d| d.soc_percent),
    live!("state_of_health", "1.0", Some("%"), Some("/Soh"), |d| d.soh_percent),
    live!("max_charge_current", "1.0", Some("A"), Some("/Info/MaxChargeCurrent"), |d| d.max_charge_current_a),
    live!("max_discharge_current", "1.0", Some("A"), Some("/Info/MaxDischargeCurrent"), |d| d.max_discharge_current_a),
    live!("min_cell_voltage", "1.0", Some("mV"), None, |d| d.min_cell_mv as f64),
    live!("max_cell_voltage", "1.0", Some("mV"), None, |d| d.max_cell_mv as f64),
    live!("cell_imbalance", "1.0", Some("mV"), None, |d| d.cell_imbalance_mv as f64),
    live!("pack_power_w", "2.0", Some("W"), Some("/Dc/0/Power"), |d| d.pack_power_w),
    live!("system_state", "2.0", None, Some("/System/0/State"), |d| d.system_state_code as f64),
    alarm!("alarm_low_voltage", "/Alarms/LowVoltage"),
    alarm!("alarm_high_voltage", "/Alarms/HighVoltage"),
    alarm!("alarm_overtemperature", "/Alarms/HighTemperature"),
    alarm!("alarm_low_temperature_charge", "/Alarms/LowTemperatureCharge"),
    alarm!("alarm_cell_imbalance", "/Alarms/CellImbalance"),
    alarm!("alarm_communication", "/Alarms/Communication"),
    alarm!("alarm_system_shutdown", "/Alarms/SystemShutdown"),
    alarm!("alarm_low_soc", "/Alarms/LowSoc"),
];

pub fn release_key(release: &str) -> (u32, u32) {
    let mut parts = release.trim().split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
}

pub fn specs_for_release(release: &str) -> impl Iterator<Item = &'static TopicSpec> {
    let key = release_key(release);
    TOPIC_TABLE.iter().filter(move |s| release_key(s.since) <= key)
}

fn sanitize_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for c in segment.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if matches!(c, ' ' | '-' | '_' | '.') && !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Segments en minuscules `[a-z0-9_]`, séparés par `/`, segments vides retirés
pub fn sanitize_root_topic(raw: &str) -> String {
    raw.trim()
        .split('/')
        .map(|s| sanitize_segment(s.trim()))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn build_topic(root: &str, suffix: &str) -> String {
    if root.is_empty() {
        suffix.to_string()
    } else {
        format!("{root}/{suffix}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicCatalog {
    pub root_topic: String,
    pub release: String,
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_topics: Vec<String>,
}

impl TopicCatalog {
    pub fn for_release(root_topic: &str, release: &str) -> Self {
        let root = sanitize_root_topic(root_topic);
        let topics = specs_for_release(release).map(|s| build_topic(&root, s.suffix)).collect();
        Self {
            root_topic: root,
            release: release.to_string(),
            topics,
            new_topics: Vec::new(),
        }
    }
}

/// Comparaison entre deux releases du catalogue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogSnapshot {
    pub before: TopicCatalog,
    pub after: TopicCatalog,
}

impl CatalogSnapshot {
    pub fn between(root_topic: &str, before_release: &str, after_release: &str) -> Self {
        let before = TopicCatalog::for_release(root_topic, before_release);
        let mut after = TopicCatalog::for_release(root_topic, after_release);
        let old: BTreeSet<&String> = before.topics.iter().collect();
        after.new_topics = after.topics.iter().filter(|t| !old.contains(t)).cloned().collect();
        Self { before, after }
    }

    /// Ruptures de compatibilité (vide = snapshot conforme)
    pub fn check(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.before.root_topic != self.after.root_topic {
            issues.push(format!(
                "root topic changed: '{}' -> '{}'",
                self.before.root_topic, self.after.root_topic
            ));
        }
        let before: BTreeSet<&String> = self.before.topics.iter().collect();
        let after: BTreeSet<&String> = self.after.topics.iter().collect();
        let declared: BTreeSet<&String> = self.after.new_topics.iter().collect();

        for missing in before.difference(&after) {
            issues.push(format!("legacy topic removed: {missing}"));
        }
        let actual_new: BTreeSet<&String> = after.difference(&before).copied().collect();
        for t in actual_new.difference(&declared) {
            issues.push(format!("undeclared new topic: {t}"));
        }
        for t in declared.difference(&actual_new) {
            issues.push(format!("declared new topic not new: {t}"));
        }
        issues
    }
}

/*!
Helpers pour valider les interfaces externes du bridge

Vérificateurs de conformité pour:
- La trace JSONL (ordre des stages, timestamps, status_seq, clients, compteurs)
- Le document de statut
- Le snapshot du catalogue de topics MQTT
- La matrice fonctionnelle Victron
*/

use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use tinybridge_kernel::event_bus::{Stage, TraceRecord};
use tinybridge_kernel::mqtt::FunctionalReport;
use tinybridge_kernel::registers::RegisterCatalog;
use tinybridge_kernel::topics::CatalogSnapshot;
use tinybridge_kernel::websocket::{MAX_INTERVAL_MS, MIN_INTERVAL_MS};

/// Violations relevées par un vérificateur (vide = conforme)
#[derive(Debug, Default, Clone)]
pub struct ContractReport {
    pub name: String,
    pub violations: Vec<String>,
}

impl ContractReport {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            violations: Vec::new(),
        }
    }

    fn fail(&mut self, msg: String) {
        self.violations.push(msg);
    }

    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn merge(&mut self, other: ContractReport) {
        self.violations
            .extend(other.violations.into_iter().map(|v| format!("{}: {v}", other.name)));
    }

    /// Convertit en erreur si au moins une violation
    pub fn into_result(self) -> Result<()> {
        if self.violations.is_empty() {
            log::info!("[contract] {} ok", self.name);
            return Ok(());
        }
        anyhow::bail!("{} violated:\n  {}", self.name, self.violations.join("\n  "));
    }
}

/// Charge une trace JSONL écrite par le bridge
pub fn load_trace<P: AsRef<Path>>(path: P) -> Result<Vec<TraceRecord>> {
    Ok(tinybridge_kernel::trace::read_trace(path.as_ref())?)
}

fn events<'a>(trace: &'a [TraceRecord], name: &'a str) -> impl Iterator<Item = &'a TraceRecord> + 'a {
    trace.iter().filter(move |r| r.event == name)
}

/// Timestamps non décroissants sur toute la trace
pub fn check_timestamps(trace: &[TraceRecord]) -> ContractReport {
    let mut report = ContractReport::new("timestamps");
    for pair in trace.windows(2) {
        if pair[1].timestamp_ms < pair[0].timestamp_ms {
            report.fail(format!(
                "#{} at {} ms precedes #{} at {} ms",
                pair[1].seq, pair[1].timestamp_ms, pair[0].seq, pair[0].timestamp_ms
            ));
        }
    }
    report
}

/// Dans chaque chaîne causale, les stages respectent uart → event_bus → can → web_ui
pub fn check_causal_stages(trace: &[TraceRecord]) -> ContractReport {
    let mut report = ContractReport::new("causal stage order");
    let mut last: std::collections::HashMap<u64, (Stage, u64)> = std::collections::HashMap::new();
    for rec in trace {
        if let Some((stage, ts)) = last.get(&rec.chain) {
            if rec.stage < *stage || rec.timestamp_ms < *ts {
                report.fail(format!(
                    "#{} ({} {}) after {} in chain {}",
                    rec.seq, rec.stage, rec.event, stage, rec.chain
                ));
            }
        }
        last.insert(rec.chain, (rec.stage, rec.timestamp_ms));
    }
    report
}

/// Ordre de première apparition des stages sur l'ensemble de la trace
pub fn check_stage_first_appearance(trace: &[TraceRecord]) -> ContractReport {
    let mut report = ContractReport::new("stage first appearance");
    let mut seen: Vec<Stage> = Vec::new();
    for rec in trace {
        if !seen.contains(&rec.stage) {
            seen.push(rec.stage);
        }
    }
    if seen.windows(2).any(|w| w[1] < w[0]) {
        let names: Vec<&str> = seen.iter().map(|s| s.as_str()).collect();
        report.fail(format!("stages appear as [{}]", names.join(", ")));
    }
    report
}

/// status_seq strictement croissant, espacement des pushes dans la fenêtre 800-1200 ms
pub fn check_status_pushes(trace: &[TraceRecord]) -> ContractReport {
    let mut report = ContractReport::new("status pushes");
    let pushes: Vec<&TraceRecord> = events(trace, "status_push").collect();
    for pair in pushes.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        match (a.status_seq, b.status_seq) {
            (Some(x), Some(y)) if y > x => {}
            (x, y) => report.fail(format!("status_seq {:?} then {:?}", x, y)),
        }
        let gap = b.timestamp_ms.saturating_sub(a.timestamp_ms);
        if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&gap) {
            report.fail(format!("push #{} {} ms after previous push", b.seq, gap));
        }
    }
    for p in &pushes {
        if p.fields.as_deref() != Some(&["live_data".to_string(), "stats".to_string()][..]) {
            report.fail(format!("push #{} fields {:?}", p.seq, p.fields));
        }
    }
    report
}

/// Rejoue connexions/déconnexions ; chaque liste `clients` doit égaler l'ensemble connecté
pub fn check_client_sets(trace: &[TraceRecord]) -> ContractReport {
    let mut report = ContractReport::new("client sets");
    let mut connected: BTreeSet<String> = BTreeSet::new();
    for rec in trace {
        match rec.event.as_str() {
            "client_connected" => {
                if let Some(id) = &rec.client_id {
                    if !connected.insert(id.clone()) {
                        report.fail(format!("#{} connects {id} twice", rec.seq));
                    }
                }
            }
            "client_disconnected" => {
                if let Some(id) = &rec.client_id {
                    if !connected.remove(id) {
                        report.fail(format!("#{} disconnects unknown client {id}", rec.seq));
                    }
                }
            }
            "status_push" | "config_broadcast" => {
                let listed: BTreeSet<String> = rec.clients.iter().flatten().cloned().collect();
                if listed != connected {
                    report.fail(format!(
                        "#{} {} lists {:?}, connected {:?}",
                        rec.seq, rec.event, listed, connected
                    ));
                }
            }
            _ => {}
        }
    }
    report
}

/// Compteurs CAN monotones dans les métriques can_tx / keepalive_tx
pub fn check_can_counters(trace: &[TraceRecord]) -> ContractReport {
    let mut report = ContractReport::new("can counters");
    let mut last = 0u64;
    for rec in trace.iter().filter(|r| r.event == "can_tx" || r.event == "keepalive_tx") {
        let Some(count) = rec.metrics.as_ref().and_then(|m| m["can_tx_count"].as_u64()) else {
            report.fail(format!("#{} {} without can_tx_count", rec.seq, rec.event));
            continue;
        };
        if count < last {
            report.fail(format!("#{} can_tx_count {count} < {last}", rec.seq));
        }
        last = count;
    }
    report
}

/// Intervalles keepalive reçus : dispersion ≤ max_spread, moyenne dans mean ± tolerance
pub fn check_keepalive_intervals(trace: &[TraceRecord], max_spread_ms: u64, mean_ms: f64, tolerance_ms: f64) -> ContractReport {
    let mut report = ContractReport::new("keepalive intervals");
    let intervals: Vec<u64> = events(trace, "keepalive_rx")
        .filter_map(|r| r.metrics.as_ref().and_then(|m| m["interval_ms"].as_u64()))
        .collect();
    let (Some(min), Some(max)) = (intervals.iter().min(), intervals.iter().max()) else {
        report.fail("no keepalive interval in trace".into());
        return report;
    };
    let mean = intervals.iter().sum::<u64>() as f64 / intervals.len() as f64;
    if max - min > max_spread_ms {
        report.fail(format!("spread {} ms > {max_spread_ms} ms", max - min));
    }
    if (mean - mean_ms).abs() > tolerance_ms {
        report.fail(format!("mean {mean:.1} ms outside {mean_ms} ± {tolerance_ms}"));
    }
    report
}

/// Scénario timeout : error{timeout} avant exactement un client_disconnected, puis absence
pub fn check_timeout_scenario(trace: &[TraceRecord], client_id: &str) -> ContractReport {
    let mut report = ContractReport::new(format!("timeout of {client_id}"));
    let is_client = |r: &TraceRecord| r.client_id.as_deref() == Some(client_id);
    let Some(err) = trace
        .iter()
        .position(|r| r.event == "error" && r.error.as_deref() == Some("timeout") && is_client(r))
    else {
        report.fail("no timeout error event".into());
        return report;
    };
    let disconnects: Vec<usize> = trace
        .iter()
        .enumerate()
        .filter(|(_, r)| r.event == "client_disconnected" && is_client(r))
        .map(|(i, _)| i)
        .collect();
    match disconnects.as_slice() {
        [d] if *d > err => {
            for rec in &trace[*d..] {
                if rec.clients.iter().flatten().any(|c| c == client_id) {
                    report.fail(format!("#{} still lists {client_id}", rec.seq));
                }
            }
        }
        [d] => report.fail(format!("disconnect #{} precedes timeout error", trace[*d].seq)),
        other => report.fail(format!("{} client_disconnected events", other.len())),
    }
    report
}

/// Toutes les vérifications de trace applicables à n'importe quelle session
pub fn check_trace(trace: &[TraceRecord]) -> ContractReport {
    let mut report = ContractReport::new("trace");
    report.merge(check_timestamps(trace));
    report.merge(check_causal_stages(trace));
    report.merge(check_status_pushes(trace));
    report.merge(check_client_sets(trace));
    report.merge(check_can_counters(trace));
    report
}

/// Structure du document de statut et règle alarms_active
pub fn check_status_document(doc: &Value) -> ContractReport {
    let mut report = ContractReport::new("status document");
    for key in ["stats", "live_data", "alarms", "alarms_active", "victron"] {
        if doc.get(key).is_none() {
            report.fail(format!("missing top-level key {key}"));
        }
    }
    for block in ["can", "uart", "keepalive", "event_bus", "mqtt"] {
        if doc["stats"].get(block).is_none() {
            report.fail(format!("missing stats.{block}"));
        }
    }
    for key in ["system_state_code", "system_state_name", "system_state_raw", "pack_power_w"] {
        if doc["victron"].get(key).is_none() {
            report.fail(format!("missing victron.{key}"));
        }
    }
    if doc["live_data"].get("pack_power_w").is_none() {
        report.fail("missing live_data.pack_power_w".into());
    }

    let expected = doc["alarms"]
        .as_array()
        .and_then(|alarms| alarms.iter().rev().find(|a| a["event"] == "raised"))
        .map(|a| a["active"].as_bool().unwrap_or(false))
        .unwrap_or(false);
    if doc["alarms_active"].as_bool() != Some(expected) {
        report.fail(format!(
            "alarms_active {} but last raised alarm says {expected}",
            doc["alarms_active"]
        ));
    }
    report
}

/// Compteurs d'un document de statut jamais inférieurs à ceux du précédent
pub fn check_counters_monotonic(before: &Value, after: &Value) -> ContractReport {
    let mut report = ContractReport::new("counter monotonicity");
    let counters = [
        ("can", "tx_success"),
        ("can", "tx_errors"),
        ("can", "rx_success"),
        ("can", "rx_dropped"),
        ("uart", "rx_success"),
        ("event_bus", "published"),
        ("mqtt", "publish_count"),
        ("mqtt", "failed_count"),
    ];
    for (block, counter) in counters {
        let a = before["stats"][block][counter].as_u64().unwrap_or(0);
        let b = after["stats"][block][counter].as_u64().unwrap_or(0);
        if b < a {
            report.fail(format!("{block}.{counter} regressed {a} -> {b}"));
        }
    }
    report
}

pub fn check_topic_snapshot(snapshot: &CatalogSnapshot) -> ContractReport {
    let mut report = ContractReport::new("topic snapshot");
    for issue in snapshot.check() {
        report.fail(issue);
    }
    report
}

/// Matrice fonctionnelle : chaque signal requis "ok" avec au moins 2 échantillons
pub fn check_functional_matrix(matrix: &FunctionalReport, required: &[&str]) -> ContractReport {
    let mut report = ContractReport::new("functional matrix");
    for signal in required {
        match matrix.functional_matrix.get(*signal) {
            Some(entry) if entry.status == "ok" && entry.payload_samples.len() >= 2 => {}
            Some(entry) => report.fail(format!(
                "{signal}: status {} with {} samples",
                entry.status,
                entry.payload_samples.len()
            )),
            None => report.fail(format!("{signal}: not in matrix")),
        }
    }
    report
}

pub fn check_register_catalog(catalog: &RegisterCatalog) -> ContractReport {
    let mut report = ContractReport::new("register catalog");
    for issue in catalog.validate() {
        report.fail(issue);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(seq: u64, chain: u64, ts: u64, stage: Stage, event: &str) -> TraceRecord {
        TraceRecord {
            seq,
            chain,
            timestamp_ms: ts,
            stage,
            event: event.into(),
            metrics: None,
            fields: None,
            status_seq: None,
            client_id: None,
            clients: None,
            config: None,
            error: None,
            details: None,
        }
    }

    #[test]
    fn test_causal_stage_violation_detected() {
        let trace = vec![
            rec(1, 1, 0, Stage::Uart, "uart_poll"),
            rec(2, 1, 0, Stage::Can, "can_tx"),
            rec(3, 1, 0, Stage::EventBus, "live_data"),
        ];
        let report = check_causal_stages(&trace);
        assert_eq!(report.violations.len(), 1);
        assert!(check_stage_first_appearance(&trace).violations.len() == 1);
    }

    #[test]
    fn test_client_set_mismatch_detected() {
        let mut connect = rec(1, 1, 0, Stage::WebUi, "client_connected");
        connect.client_id = Some("alpha".into());
        let mut push = rec(2, 2, 1000, Stage::WebUi, "status_push");
        push.clients = Some(vec!["alpha".into(), "ghost".into()]);
        let report = check_client_sets(&[connect, push]);
        assert!(!report.is_ok());
        assert!(report.into_result().is_err());
    }

    #[test]
    fn test_status_document_alarms_active_rule() {
        let doc = json!({
            "stats": { "can": {}, "uart": {}, "keepalive": {}, "event_bus": {}, "mqtt": {} },
            "live_data": { "pack_power_w": 0.0 },
            "alarms": [
                { "event": "raised", "active": false },
                { "event": "cleared", "active": false },
            ],
            "alarms_active": true,
            "victron": { "system_state_code": 0, "system_state_name": "unknown", "system_state_raw": 0, "pack_power_w": 0.0 },
        });
        let report = check_status_document(&doc);
        assert_eq!(report.violations.len(), 1, "{:?}", report.violations);
    }

    #[test]
    fn test_keepalive_interval_bounds() {
        let trace: Vec<TraceRecord> = [990u64, 1000, 1005]
            .iter()
            .enumerate()
            .map(|(i, iv)| {
                let mut r = rec(i as u64 + 1, i as u64 + 1, 0, Stage::Can, "keepalive_rx");
                r.metrics = Some(json!({ "interval_ms": iv }));
                r
            })
            .collect();
        assert!(check_keepalive_intervals(&trace, 100, 998.0, 100.0).is_ok());
        assert!(!check_keepalive_intervals(&trace, 10, 998.0, 100.0).is_ok());
    }

    #[test]
    fn test_builtin_catalog_is_conform() {
        assert!(check_register_catalog(&RegisterCatalog::builtin()).is_ok());
        assert!(check_topic_snapshot(&CatalogSnapshot::between("tinybms", "1.0", "2.0")).is_ok());
    }
}

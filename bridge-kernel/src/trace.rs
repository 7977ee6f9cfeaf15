use crate::error::BridgeError;
use crate::event_bus::{EventBus, TraceRecord};
use std::io::{BufRead, BufReader};
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::task;
use tracing::{info, warn};

/// Une ligne JSON par événement, terminée par '\n'
pub fn encode_line(rec: &TraceRecord) -> Result<String, BridgeError> {
    let mut line = serde_json::to_string(rec)?;
    line.push('\n');
    Ok(line)
}

/// Relit un fichier de trace ; les lignes vides sont ignorées
pub fn read_trace(path: &Path) -> Result<Vec<TraceRecord>, BridgeError> {
    let file = std::fs::File::open(path).map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
    let mut records = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| BridgeError::Decode(format!("line {}: {e}", n + 1)))?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: TraceRecord = serde_json::from_str(&line)
            .map_err(|e| BridgeError::Decode(format!("line {}: {e}", n + 1)))?;
        records.push(rec);
    }
    Ok(records)
}

/// Abonné au bus qui ajoute chaque événement au fichier de trace
pub fn spawn_trace_writer(bus: &EventBus, path: String) {
    let mut events = bus.subscribe();
    task::spawn(async move {
        let mut file = match OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(f) => f,
            Err(e) => {
                warn!("[trace] cannot open {path}: {e}");
                return;
            }
        };
        info!("[trace] writing bus events to {path}");

        while let Some(ev) = events.recv().await {
            let line = match encode_line(&ev.to_trace()) {
                Ok(l) => l,
                Err(e) => {
                    warn!("[trace] event #{} not encoded: {e}", ev.seq);
                    continue;
                }
            };
            if let Err(e) = file.write_all(line.as_bytes()).await {
                warn!("[trace] write failed: {e}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::Stage;
    use std::io::Write;

    #[test]
    fn test_lines_skip_absent_fields() {
        let rec = TraceRecord {
            seq: 3,
            chain: 1,
            timestamp_ms: 1200,
            stage: Stage::Can,
            event: "keepalive_rx".into(),
            metrics: Some(serde_json::json!({ "interval_ms": 998 })),
            fields: None,
            status_seq: None,
            client_id: None,
            clients: None,
            config: None,
            error: None,
            details: None,
        };
        let line = encode_line(&rec).unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"stage\":\"can\""));
        assert!(!line.contains("client_id"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(line.as_bytes()).unwrap();
        file.write_all(b"\n").unwrap();
        let back = read_trace(file.path()).unwrap();
        assert_eq!(back, vec![rec]);
    }
}

/**
 * REGISTER INGEST - Entrée du pipeline
 *
 * RÔLE : Traduit les lectures de registres TinyBMS en LiveData.
 * Un batch = un cycle d'ingest : les champs absents reprennent la valeur du
 * snapshot précédent, le résultat remplace le store en bloc.
 *
 * FLUX TCP : une passerelle série pousse des lignes JSON
 *   {"registers":[{"address":36,"value":52.1}]}
 * et reçoit les écritures validées
 *   {"write":{"address":300,"raw":3650}}
 */

use crate::bridge::BridgeCore;
use crate::error::BridgeError;
use crate::models::LiveData;
use crate::registers::RegisterWrite;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegisterReading {
    pub address: u16,
    pub value: f64,
}

#[derive(Debug, Deserialize)]
struct FeedLine {
    registers: Vec<RegisterReading>,
}

#[derive(Debug, Serialize)]
struct WriteLine<'a> {
    write: WriteBody<'a>,
}

#[derive(Debug, Serialize)]
struct WriteBody<'a> {
    address: u16,
    raw: i64,
    key: &'a str,
}

/// Résultat pur d'un batch appliqué au snapshot précédent
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub data: LiveData,
    pub fields: Vec<String>,
    pub dropped: usize,
}

pub fn parse_feed_line(line: &str) -> Result<Vec<RegisterReading>, BridgeError> {
    let feed: FeedLine = serde_json::from_str(line)?;
    if let Some(bad) = feed.registers.iter().find(|r| !r.value.is_finite()) {
        return Err(BridgeError::Decode(format!("register {} carries a non-finite value", bad.address)));
    }
    Ok(feed.registers)
}

fn as_u16(value: f64) -> u16 {
    value.round().clamp(0.0, u16::MAX as f64) as u16
}

pub fn apply_batch(previous: &LiveData, readings: &[RegisterReading]) -> BatchOutcome {
    let mut data = previous.clone();
    data.origin = None;
    let mut fields: Vec<String> = Vec::new();
    let mut dropped = 0;

    for r in readings {
        let field = match r.address {
            36 => { data.voltage = r.value; "voltage" }
            38 => { data.current = r.value; "current" }
            40 => { data.min_cell_mv = as_u16(r.value); "min_cell_mv" }
            41 => { data.max_cell_mv = as_u16(r.value); "max_cell_mv" }
            45 => { data.soh_percent = r.value * 0.002; "soh_percent" }
            46 => {
                data.soc_percent = r.value * 0.002;
                data.soc_seen = true;
                "soc_percent"
            }
            48 => { data.temperature_c = r.value * 0.1; "temperature_c" }
            50 => { data.online_status = as_u16(r.value); "online_status" }
            51 => { data.balancing_bits = as_u16(r.value); "balancing_bits" }
            102 => { data.max_discharge_current_a = r.value * 0.1; "max_discharge_current_a" }
            103 => { data.max_charge_current_a = r.value * 0.1; "max_charge_current_a" }
            _ => {
                dropped += 1;
                continue;
            }
        };
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
    }

    data.derive();
    BatchOutcome { data, fields, dropped }
}

/// Serveur TCP du flux registres. Une seule passerelle à la fois ;
/// les écritures en attente survivent à une reconnexion, y compris celle
/// dont l'envoi a échoué.
pub fn spawn_feed_server(core: Arc<BridgeCore>, bind: String, mut writes: mpsc::Receiver<RegisterWrite>) {
    task::spawn(async move {
        let listener = match TcpListener::bind(&bind).await {
            Ok(l) => l,
            Err(e) => {
                warn!("[ingest] cannot bind register feed on {bind}: {e}");
                return;
            }
        };
        info!("[ingest] register feed listening on {bind}");

        let mut pending: Option<RegisterWrite> = None;
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(s) => s,
                Err(e) => {
                    warn!("[ingest] accept failed: {e}");
                    continue;
                }
            };
            info!("[ingest] gateway connected from {peer}");
            let (read_half, write_half) = stream.into_split();
            handle_gateway(&core, read_half, write_half, &mut writes, &mut pending).await;
            info!("[ingest] gateway {peer} disconnected");
        }
    });
}

async fn send_write<W: AsyncWrite + Unpin>(writer: &mut W, w: &RegisterWrite) -> std::io::Result<()> {
    let line = WriteLine { write: WriteBody { address: w.address, raw: w.raw, key: &w.key } };
    let mut payload = serde_json::to_string(&line)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;
    writer.flush().await
}

/// Livre une écriture ; en cas d'échec elle reste dans `pending` pour la passerelle suivante
async fn deliver<W: AsyncWrite + Unpin>(
    core: &BridgeCore,
    writer: &mut W,
    w: RegisterWrite,
    pending: &mut Option<RegisterWrite>,
) -> bool {
    match send_write(writer, &w).await {
        Ok(()) => {
            core.stats.uart.writes_delivered.incr();
            info!("[ingest] write delivered: reg {} ({}) raw={}", w.address, w.key, w.raw);
            true
        }
        Err(e) => {
            core.stats.uart.writes_failed.incr();
            warn!("[ingest] write to gateway failed, kept for retry: reg {} ({e})", w.address);
            *pending = Some(w);
            false
        }
    }
}

async fn handle_gateway<R, W>(
    core: &BridgeCore,
    reader: R,
    mut writer: W,
    writes: &mut mpsc::Receiver<RegisterWrite>,
    pending: &mut Option<RegisterWrite>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Some(w) = pending.take() {
        if !deliver(core, &mut writer, w, pending).await {
            return;
        }
    }

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(txt)) => {
                        if txt.trim().is_empty() { continue; }
                        if let Err(e) = core.ingest_line(&txt) {
                            debug!("[ingest] rejected line: {e}");
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        warn!("[ingest] read error: {e}");
                        return;
                    }
                }
            }
            Some(w) = writes.recv() => {
                if !deliver(core, &mut writer, w, pending).await {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BridgeConfig;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Passerelle dont la socket d'écriture est déjà fermée
    struct BrokenGateway;

    impl AsyncWrite for BrokenGateway {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_failed_write_is_kept_for_next_gateway() {
        let core = BridgeCore::new(BridgeConfig::default(), Arc::new(ManualClock::new(0)));
        let (tx, mut rx) = mpsc::channel(4);
        let mut pending = None;
        tx.send(RegisterWrite { address: 300, key: "fully_charged_voltage_mv".into(), raw: 3650, user_value: 3650.0 })
            .await
            .unwrap();

        // première passerelle : lecture muette, écriture cassée
        let (_silent, reader) = tokio::io::duplex(64);
        handle_gateway(&core, reader, BrokenGateway, &mut rx, &mut pending).await;
        assert_eq!(pending.as_ref().map(|w| w.raw), Some(3650));
        assert_eq!(core.stats.uart.writes_failed.get(), 1);
        assert_eq!(core.stats.uart.writes_delivered.get(), 0);

        // passerelle suivante : l'écriture en attente part en premier
        let (gateway, bridge) = tokio::io::duplex(1024);
        let (bridge_r, bridge_w) = tokio::io::split(bridge);
        let gateway_side = async move {
            let mut lines = BufReader::new(gateway).lines();
            lines.next_line().await.unwrap().unwrap()
        };
        let (_, line) = tokio::join!(
            handle_gateway(&core, bridge_r, bridge_w, &mut rx, &mut pending),
            gateway_side
        );

        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["write"]["address"], 300);
        assert_eq!(v["write"]["raw"], 3650);
        assert!(pending.is_none());
        assert_eq!(core.stats.uart.writes_delivered.get(), 1);
        assert_eq!(core.stats.uart.writes_failed.get(), 1);
    }

    #[test]
    fn test_parse_feed_line() {
        let r = parse_feed_line(r#"{"registers":[{"address":36,"value":52.1},{"address":46,"value":40000}]}"#).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r[0].address, 36);

        assert!(matches!(parse_feed_line("{not json"), Err(BridgeError::Decode(_))));
        assert!(parse_feed_line(r#"{"registers":[{"address":"x","value":1}]}"#).is_err());
    }

    #[test]
    fn test_apply_batch_scales_and_carries_over() {
        let mut prev = LiveData::default();
        prev.temperature_c = 21.0;

        let readings = [
            RegisterReading { address: 36, value: 52.0 },
            RegisterReading { address: 38, value: -10.0 },
            RegisterReading { address: 46, value: 40_000.0 },
            RegisterReading { address: 50, value: 0x93 as f64 },
            RegisterReading { address: 999, value: 1.0 },
        ];
        let out = apply_batch(&prev, &readings);

        assert_eq!(out.dropped, 1);
        assert_eq!(out.fields, vec!["voltage", "current", "soc_percent", "online_status"]);
        assert_eq!(out.data.soc_percent, 80.0);
        assert_eq!(out.data.temperature_c, 21.0);
        assert_eq!(out.data.pack_power_w, -520.0);
        assert_eq!(out.data.system_state_name, "discharging");
        assert!(out.data.soc_seen);

        // SOC absent du batch suivant : la lecture précédente reste valable
        let next = apply_batch(&out.data, &readings[..1]);
        assert!(next.data.soc_seen);
        assert!(!apply_batch(&LiveData::default(), &readings[..2]).data.soc_seen);
    }
}

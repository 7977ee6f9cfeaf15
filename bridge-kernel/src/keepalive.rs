/**
 * KEEPALIVE SUPERVISOR - Surveillance de vivacité par lien
 *
 * RÔLE : Horodate les émissions/réceptions d'un lien (GX via CAN 0x305, flux
 * UART du BMS) et dérive l'état HEALTHY / DEGRADED / DOWN.
 *
 * FONCTIONNEMENT :
 * - DEGRADED : l'écart max-min des intervalles de réception sur la fenêtre
 *   glissante dépasse la borne configurée
 * - DOWN : aucune réception depuis plus que le timeout
 * - Un lien démarre DOWN sans transition (pas d'alarme au boot)
 */

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub window: usize,
    pub max_spread_ms: Option<u64>,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            timeout_ms: 10_000,
            window: 10,
            max_spread_ms: Some(100),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkHealth {
    Healthy,
    Degraded,
    #[default]
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTransition {
    pub from: LinkHealth,
    pub to: LinkHealth,
    pub since_last_rx_ms: u64,
}

/// Bloc `keepalive` du statut
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeepaliveState {
    pub ok: bool,
    pub last_tx_ms: u64,
    pub last_rx_ms: u64,
    pub since_last_rx_ms: u64,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub state: LinkHealth,
    pub tx_count: u64,
    pub rx_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalStats {
    pub min_ms: u64,
    pub max_ms: u64,
    pub mean_ms: f64,
    pub spread_ms: u64,
}

pub struct KeepaliveSupervisor {
    link: String,
    cfg: KeepaliveConfig,
    last_tx_ms: Option<u64>,
    last_rx_ms: Option<u64>,
    intervals: VecDeque<u64>,
    health: LinkHealth,
    tx_count: u64,
    rx_count: u64,
}

impl KeepaliveSupervisor {
    pub fn new(link: impl Into<String>, cfg: KeepaliveConfig) -> Self {
        Self {
            link: link.into(),
            intervals: VecDeque::with_capacity(cfg.window),
            cfg,
            last_tx_ms: None,
            last_rx_ms: None,
            health: LinkHealth::Down,
            tx_count: 0,
            rx_count: 0,
        }
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn health(&self) -> LinkHealth {
        self.health
    }

    pub fn should_send(&self, now_ms: u64) -> bool {
        match self.last_tx_ms {
            None => true,
            Some(t) => now_ms.saturating_sub(t) >= self.cfg.interval_ms,
        }
    }

    pub fn record_tx(&mut self, now_ms: u64) {
        self.last_tx_ms = Some(now_ms);
        self.tx_count += 1;
    }

    /// Réception réussie : remet `since_last_rx_ms` à zéro.
    /// Retourne l'intervalle mesuré et la transition éventuelle.
    pub fn record_rx(&mut self, now_ms: u64) -> (Option<u64>, Option<LinkTransition>) {
        let interval = self.last_rx_ms.map(|t| now_ms.saturating_sub(t));
        if let Some(iv) = interval {
            if self.intervals.len() == self.cfg.window.max(1) {
                self.intervals.pop_front();
            }
            self.intervals.push_back(iv);
        }
        self.last_rx_ms = Some(now_ms);
        self.rx_count += 1;

        let next = if self.spread_exceeded() {
            LinkHealth::Degraded
        } else {
            LinkHealth::Healthy
        };
        (interval, self.transition_to(next, 0))
    }

    /// Vérification périodique du timeout
    pub fn poll(&mut self, now_ms: u64) -> Option<LinkTransition> {
        let last = self.last_rx_ms?;
        let since = now_ms.saturating_sub(last);
        if since > self.cfg.timeout_ms {
            // la fenêtre d'intervalles repart de zéro après une perte de lien
            self.intervals.clear();
            self.transition_to(LinkHealth::Down, since)
        } else {
            None
        }
    }

    fn transition_to(&mut self, next: LinkHealth, since_last_rx_ms: u64) -> Option<LinkTransition> {
        if next == self.health {
            return None;
        }
        let t = LinkTransition {
            from: self.health,
            to: next,
            since_last_rx_ms,
        };
        self.health = next;
        Some(t)
    }

    fn spread_exceeded(&self) -> bool {
        match (self.cfg.max_spread_ms, self.interval_stats()) {
            (Some(bound), Some(s)) if self.intervals.len() >= 2 => s.spread_ms > bound,
            _ => false,
        }
    }

    pub fn interval_stats(&self) -> Option<IntervalStats> {
        let min = *self.intervals.iter().min()?;
        let max = *self.intervals.iter().max()?;
        let sum: u64 = self.intervals.iter().sum();
        Some(IntervalStats {
            min_ms: min,
            max_ms: max,
            mean_ms: sum as f64 / self.intervals.len() as f64,
            spread_ms: max - min,
        })
    }

    pub fn state(&self, now_ms: u64) -> KeepaliveState {
        let since = match self.last_rx_ms {
            Some(t) => now_ms.saturating_sub(t),
            None => now_ms,
        };
        let timed_out = self.last_rx_ms.is_none() || since > self.cfg.timeout_ms;
        let state = if timed_out { LinkHealth::Down } else { self.health };
        KeepaliveState {
            ok: !timed_out && state != LinkHealth::Down,
            last_tx_ms: self.last_tx_ms.unwrap_or(0),
            last_rx_ms: self.last_rx_ms.unwrap_or(0),
            since_last_rx_ms: since,
            interval_ms: self.cfg.interval_ms,
            timeout_ms: self.cfg.timeout_ms,
            state,
            tx_count: self.tx_count,
            rx_count: self.rx_count,
        }
    }
}

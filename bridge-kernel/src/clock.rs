use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source de temps en millisecondes depuis le démarrage du bridge.
/// Toutes les machines d'état reçoivent `now_ms` explicitement, seul le runtime lit l'horloge.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Horloge monotone réelle (équivalent du `millis()` firmware)
pub struct BootClock {
    start: Instant,
}

impl BootClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for BootClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for BootClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Horloge pilotée à la main pour les tests et le devkit
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self { now: AtomicU64::new(start_ms) }
    }

    pub fn advance(&self, ms: u64) -> u64 {
        self.now.fetch_add(ms, Ordering::SeqCst) + ms
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_ms(), 100);
        assert_eq!(clock.advance(250), 350);
        assert_eq!(clock.now_ms(), 350);
    }
}

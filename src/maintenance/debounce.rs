//! Rate limiting for topology announcements

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Default minimum spacing between announcements
pub const DEFAULT_ANNOUNCE_DEBOUNCE: Duration = Duration::from_secs(10);

/// Lets an announcement through at most once per debounce interval, and only
/// when the routing table changed or the refresh interval elapsed
#[derive(Debug)]
pub struct DebounceGate {
    debounce: Duration,
    refresh: Duration,
    last: Mutex<Option<(Instant, u64)>>,
}

impl DebounceGate {
    /// Gate whose refresh interval equals the debounce interval
    pub fn new(debounce: Duration) -> Self {
        Self::with_refresh(debounce, debounce)
    }

    /// Gate with an explicit refresh interval
    pub fn with_refresh(debounce: Duration, refresh: Duration) -> Self {
        Self {
            debounce,
            refresh: refresh.max(debounce),
            last: Mutex::new(None),
        }
    }

    /// Decide whether to announce `generation` at `now`; records the firing
    pub fn try_fire(&self, now: Instant, generation: u64) -> bool {
        let mut last = self.last.lock();
        let fire = match *last {
            None => true,
            Some((at, _)) if now.saturating_duration_since(at) < self.debounce => false,
            Some((_, announced)) if announced != generation => true,
            Some((at, _)) => now.saturating_duration_since(at) >= self.refresh,
        };
        if fire {
            *last = Some((now, generation));
        }
        fire
    }

    /// Forget the last firing so the next check passes
    pub fn reset(&self) {
        *self.last.lock() = None;
    }
}

impl Default for DebounceGate {
    fn default() -> Self {
        Self::new(DEFAULT_ANNOUNCE_DEBOUNCE)
    }
}

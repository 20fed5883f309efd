//! Pause detection for live typing.
//!
//! Tracks keystroke bursts and decides when the typist has paused long
//! enough to run a correction wave.

use log::debug;
use serde::Serialize;

/// Smoothing factor for the key-interval average.
const INTERVAL_EMA_ALPHA: f64 = 0.3;

/// Rhythm of the current typing burst.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BurstState {
    pub last_key_ms: u64,
    pub burst_start_ms: u64,
    pub key_count: u32,
}

impl BurstState {
    /// Record a keystroke. A gap longer than `burst_gap_ms` starts a new burst.
    pub fn record_key(&mut self, at_ms: u64, burst_gap_ms: u64) {
        if self.key_count == 0 || at_ms.saturating_sub(self.last_key_ms) > burst_gap_ms {
            self.burst_start_ms = at_ms;
            self.key_count = 0;
        }
        self.key_count = self.key_count.saturating_add(1);
        self.last_key_ms = at_ms;
    }

    pub fn duration_ms(&self) -> u64 {
        self.last_key_ms.saturating_sub(self.burst_start_ms)
    }
}

/// Pause delay that follows the typist's rhythm: four average key
/// intervals, kept within 0.6x..1.6x of the configured base.
#[derive(Debug, Clone)]
pub struct AdaptiveDebounce {
    base_ms: u64,
    ema_interval_ms: Option<f64>,
}

impl AdaptiveDebounce {
    pub fn new(base_ms: u64) -> Self {
        Self {
            base_ms,
            ema_interval_ms: None,
        }
    }

    pub fn observe_interval(&mut self, interval_ms: u64) {
        let interval = interval_ms as f64;
        self.ema_interval_ms = Some(match self.ema_interval_ms {
            Some(ema) => ema + INTERVAL_EMA_ALPHA * (interval - ema),
            None => interval,
        });
    }

    /// Current pause delay, scaled for the device tier.
    pub fn delay_ms(&self, tier_scale: f64) -> u64 {
        let base = self.base_ms as f64;
        let raw = match self.ema_interval_ms {
            Some(ema) => (ema * 4.0).clamp(base * 0.6, base * 1.6),
            None => base,
        };
        (raw * tier_scale).round() as u64
    }

    pub fn reset(&mut self) {
        self.ema_interval_ms = None;
    }
}

/// Detects typing pauses.
///
/// Keystrokes feed the burst tracker and the adaptive debounce; `poll`
/// reports a pause once per quiet period.
pub struct PauseDetector {
    /// Current burst rhythm
    burst: BurstState,

    debounce: AdaptiveDebounce,

    /// Gap that ends a burst
    burst_gap_ms: u64,

    /// Whether the current quiet period was already reported
    in_pause: bool,

    /// Whether any key has been seen since reset
    has_seen_typing: bool,
}

impl PauseDetector {
    /// Create a new pause detector.
    ///
    /// # Arguments
    /// * `pause_ms` - Base quiet time before a pause is reported (e.g. 600ms)
    /// * `burst_gap_ms` - Gap between keys that ends a burst (e.g. 200ms)
    pub fn new(pause_ms: u64, burst_gap_ms: u64) -> Self {
        debug!(
            "PauseDetector created: pause={}ms, burst gap={}ms",
            pause_ms, burst_gap_ms
        );
        Self {
            burst: BurstState::default(),
            debounce: AdaptiveDebounce::new(pause_ms),
            burst_gap_ms,
            in_pause: false,
            has_seen_typing: false,
        }
    }

    pub fn on_key(&mut self, at_ms: u64) {
        if self.has_seen_typing {
            let interval = at_ms.saturating_sub(self.burst.last_key_ms);
            // Long gaps are pauses, not rhythm.
            if interval <= self.burst_gap_ms * 4 {
                self.debounce.observe_interval(interval);
            }
        }
        self.burst.record_key(at_ms, self.burst_gap_ms);
        self.in_pause = false;
        self.has_seen_typing = true;
    }

    /// Returns `true` once when the typist has been quiet for the current
    /// debounce delay (rising edge).
    pub fn poll(&mut self, now_ms: u64, tier_scale: f64) -> bool {
        if !self.has_seen_typing || self.in_pause {
            return false;
        }
        let quiet = now_ms.saturating_sub(self.burst.last_key_ms);
        let delay = self.debounce.delay_ms(tier_scale);
        if quiet >= delay {
            self.in_pause = true;
            debug!("Pause detected after {}ms (delay {}ms)", quiet, delay);
            return true;
        }
        false
    }

    /// Milliseconds until a pause would be reported, if typing has started.
    pub fn time_to_pause_ms(&self, now_ms: u64, tier_scale: f64) -> Option<u64> {
        if !self.has_seen_typing || self.in_pause {
            return None;
        }
        let quiet = now_ms.saturating_sub(self.burst.last_key_ms);
        Some(self.debounce.delay_ms(tier_scale).saturating_sub(quiet))
    }

    pub fn burst(&self) -> BurstState {
        self.burst
    }

    pub fn is_in_pause(&self) -> bool {
        self.in_pause
    }

    pub fn has_seen_typing(&self) -> bool {
        self.has_seen_typing
    }

    /// Whether keys are arriving faster than the burst gap right now.
    pub fn is_bursting(&self, now_ms: u64) -> bool {
        self.has_seen_typing && now_ms.saturating_sub(self.burst.last_key_ms) <= self.burst_gap_ms
    }

    pub fn reset(&mut self) {
        self.burst = BurstState::default();
        self.debounce.reset();
        self.in_pause = false;
        self.has_seen_typing = false;
        debug!("PauseDetector reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_restarts_after_gap() {
        let mut burst = BurstState::default();
        burst.record_key(1000, 200);
        burst.record_key(1100, 200);
        burst.record_key(1250, 200);
        assert_eq!(burst.key_count, 3);
        assert_eq!(burst.duration_ms(), 250);

        burst.record_key(2000, 200);
        assert_eq!(burst.key_count, 1);
        assert_eq!(burst.burst_start_ms, 2000);
    }

    #[test]
    fn test_debounce_tracks_rhythm_within_bounds() {
        let mut d = AdaptiveDebounce::new(600);
        assert_eq!(d.delay_ms(1.0), 600);

        // very fast typing: 4 * 50 = 200, clamped up to 360
        for _ in 0..10 {
            d.observe_interval(50);
        }
        assert_eq!(d.delay_ms(1.0), 360);

        // slow typing: clamped down to 960
        let mut slow = AdaptiveDebounce::new(600);
        slow.observe_interval(400);
        assert_eq!(slow.delay_ms(1.0), 960);
        assert_eq!(slow.delay_ms(1.5), 1440);
    }

    #[test]
    fn test_pause_only_triggers_once() {
        let mut detector = PauseDetector::new(600, 200);
        assert!(!detector.poll(10_000, 1.0));

        detector.on_key(1000);
        assert!(!detector.poll(1200, 1.0));
        assert!(detector.poll(1600, 1.0));
        assert!(detector.is_in_pause());
        assert!(!detector.poll(5000, 1.0));
    }

    #[test]
    fn test_key_resets_pause() {
        let mut detector = PauseDetector::new(600, 200);
        detector.on_key(1000);
        assert!(detector.poll(2000, 1.0));

        detector.on_key(2100);
        assert!(!detector.is_in_pause());
        assert!(detector.is_bursting(2150));
        assert_eq!(detector.time_to_pause_ms(2100, 1.0), Some(600));
    }

    #[test]
    fn test_tier_scale_delays_pause() {
        let mut detector = PauseDetector::new(600, 200);
        detector.on_key(0);
        assert!(!detector.poll(700, 1.5));
        assert!(detector.poll(900, 1.5));
    }
}

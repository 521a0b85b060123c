//! Shared geometric backoff sequence: 1s, ×1.5 per failure, capped.
//! Used by the uplink streamer's reconnect loop (spec §4.4.2, §8).

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    current_secs: f64,
    initial_secs: f64,
    multiplier: f64,
    cap_secs: f64,
}

impl Backoff {
    pub fn new(initial_secs: f64, multiplier: f64, cap_secs: f64) -> Self {
        Self {
            current_secs: initial_secs,
            initial_secs,
            multiplier,
            cap_secs,
        }
    }

    /// The uplink's standard backoff: 1s initial, ×1.5, capped at 10s.
    pub fn uplink_default() -> Self {
        Self::new(1.0, 1.5, 10.0)
    }

    /// Current delay, then advance to the next (capped) value.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_secs;
        self.current_secs = (self.current_secs * self.multiplier).min(self.cap_secs);
        Duration::from_secs_f64(delay)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.current_secs = self.initial_secs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_documented_sequence() {
        let mut b = Backoff::uplink_default();
        let seq: Vec<f64> = (0..9).map(|_| b.next_delay().as_secs_f64()).collect();
        let expected = [1.0, 1.5, 2.25, 3.375, 5.0625, 7.59375, 10.0, 10.0, 10.0];
        for (got, want) in seq.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-9, "got {got}, want {want}");
        }
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut b = Backoff::uplink_default();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs_f64(1.0));
    }
}

// ===============================
// src/stream/backoff.rs
// ===============================
use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff + jitter: 1s, 2s, 4s, ... max.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Backoff {
    /// Base delay before attempt `n` (1-based), without jitter.
    pub fn base(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let factor = 1u32 << shift;
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 { 0 } else { rand::thread_rng().gen_range(0..=jitter_ms) };
        self.base(attempt) + Duration::from_millis(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_caps() {
        let b = Backoff { initial: Duration::from_secs(1), max: Duration::from_secs(30), jitter: Duration::ZERO };
        let secs: Vec<u64> = (1..=7).map(|n| b.base(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(b.base(1000), Duration::from_secs(30));
        assert_eq!(b.delay(3), Duration::from_secs(4));
    }

    #[test]
    fn jitter_is_bounded() {
        let b = Backoff { initial: Duration::from_millis(100), max: Duration::from_secs(1), jitter: Duration::from_millis(50) };
        for _ in 0..50 {
            let d = b.delay(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }
}

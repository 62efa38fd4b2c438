use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential retry schedule with jitter and a hard cap.
///
/// Delays never shrink from one attempt to the next: jitter can only pull a
/// delay down to the previous one, and everything is clamped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: f64, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            multiplier: multiplier.max(1.0),
            max: max.max(base),
            jitter: jitter.clamp(0.0, 0.99),
        }
    }

    /// Delay before retry number `attempt` (1-based), given the delay used last time.
    pub fn next_delay<R: Rng + ?Sized>(&self, attempt: u32, last: Duration, rng: &mut R) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let nominal_ms = self.base.as_millis() as f64 * self.multiplier.powi(exp);
        let jittered_ms = if self.jitter > 0.0 {
            nominal_ms * (1.0 - rng.gen_range(0.0..self.jitter))
        } else {
            nominal_ms
        };
        let cap_ms = self.max.as_millis() as f64;
        let ms = jittered_ms.min(cap_ms).max(last.as_millis() as f64).min(cap_ms);
        Duration::from_millis(ms as u64)
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(cfg: &BackoffConfig) -> Self {
        Backoff::new(
            Duration::from_millis(cfg.base_ms),
            cfg.multiplier,
            Duration::from_millis(cfg.max_ms),
            cfg.jitter,
        )
    }
}

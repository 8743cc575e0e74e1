//! Exponential backoff for retry re-dispatch.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap and optional jitter.
///
/// `attempt` counts from 1. Delay: `base * factor^(attempt-1)`, capped,
/// then spread by up to +/- `jitter` (fraction) to keep retrying workers
/// from thundering in step.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            factor: 1.8,
            cap: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.base.as_secs_f64() * self.factor.powi(exponent);
        let capped = raw.min(self.cap.as_secs_f64());

        let spread = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            capped * (1.0 + rng.gen_range(-self.jitter..=self.jitter))
        } else {
            capped
        };

        Duration::from_secs_f64(spread.max(0.0))
    }
}

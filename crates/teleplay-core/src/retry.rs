use std::time::Duration;

/// Delay between poll iterations.
///
/// Attempt `n` (consecutive transient failures so far, 0 after a successful
/// fetch) waits `first * factor^n`, clamped to `max`. With `factor = 1.0` the
/// delay is constant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            first: interval,
            max: interval,
            factor: 1.0,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let max = self.max.max(self.first);
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff with uniform jitter, shared by the broker
/// connect loop and the sink write retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Jitter fraction; 0.2 spreads each delay across ±20%.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: 0.2,
        }
    }

    #[cfg(test)]
    pub fn without_jitter(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: 0.0,
        }
    }

    /// Infinite iterator of delays: base, 2×base, 4×base, … capped at
    /// `cap`, each jittered. Callers bound it with `take` where the
    /// attempt count is finite.
    pub fn delays(&self) -> Delays {
        Delays {
            next: self.base,
            policy: *self,
        }
    }
}

pub struct Delays {
    next: Duration,
    policy: RetryPolicy,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next.min(self.policy.cap);
        self.next = self
            .next
            .checked_mul(2)
            .unwrap_or(self.policy.cap)
            .min(self.policy.cap);
        Some(jittered(current, self.policy.jitter))
    }
}

fn jittered(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(1.0 - fraction..=1.0 + fraction);
    delay.mul_f64(factor)
}

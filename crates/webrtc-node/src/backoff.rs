use std::time::Duration;

/// Parameters of the reconnect delay schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub maximum: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 1.5,
            maximum: Duration::from_secs(60),
        }
    }
}

/// Exponential delay generator owned by the signaling client.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.initial,
            policy,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Grows the delay by the policy factor, capped at the maximum, and
    /// returns the new value.
    pub fn next(&mut self) -> Duration {
        self.current = self
            .current
            .mul_f64(self.policy.factor)
            .min(self.policy.maximum);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

// file: src/reconnect.rs
// description: exponential-backoff policy for re-establishing a dropped job channel

use std::time::Duration;

/// Off by default: a dropped connection stays down until `connect` is called
/// again. Listeners stay registered across retries.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random, in `[0, 1]`.
    pub jitter: f64,
    /// 0 retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt > self.max_attempts
    }
}

/// Next backoff delay, clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Spreads `delay` by up to `jitter * delay` in either direction.
pub fn with_jitter(delay: Duration, config: &ReconnectConfig) -> Duration {
    let jitter = config.jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return delay;
    }
    let spread = (fastrand::f64() * 2.0 - 1.0) * jitter;
    let ms = delay.as_millis() as f64 * (1.0 + spread);
    Duration::from_millis(ms.max(0.0) as u64)
}

//! Retry delays for failing components.

use std::time::Duration;

use keel_config::EngineConfig;

/// Consecutive-failure counter for one component.
///
/// Reset on every successful start, so a component that recovers and later
/// fails again begins from the first delay.
#[derive(Debug, Clone, Default)]
pub(crate) struct Backoff {
  failures: u32,
}

impl Backoff {
  /// Count a failure and return the delay before the next attempt.
  pub(crate) fn record_failure(&mut self, config: &EngineConfig) -> Duration {
    self.failures = self.failures.saturating_add(1);
    retry_delay(config, self.failures)
  }

  pub(crate) fn reset(&mut self) {
    self.failures = 0;
  }

  pub(crate) fn failures(&self) -> u32 {
    self.failures
  }
}

/// Delay after `failures` consecutive failures: `error_delay * factor^(n-1)`,
/// capped at `max_delay`, with +/-10% jitter when enabled.
pub(crate) fn retry_delay(config: &EngineConfig, failures: u32) -> Duration {
  let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
  let max = config.max_delay().as_secs_f64();
  let base = (config.error_delay().as_secs_f64() * config.backoff_factor.powi(exponent)).min(max);

  let delay = if config.jitter {
    let spread = 0.9 + rand::random::<f64>() * 0.2;
    (base * spread).min(max)
  } else {
    base
  };

  Duration::from_secs_f64(delay.max(0.0))
}

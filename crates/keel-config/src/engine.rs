use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Supervisor tuning for a keel engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
  /// First retry delay after a start failure or a crash.
  pub error_delay_ms: u64,
  /// Delay before restarting a component that was bounced or exited cleanly.
  pub bounce_delay_ms: u64,
  /// Growth of the retry delay per consecutive failure.
  pub backoff_factor: f64,
  /// Upper bound for any retry delay.
  pub max_delay_ms: u64,
  /// Time a stopping worker is given to exit before it is abandoned.
  pub stop_grace_ms: u64,
  /// Spread retry delays so failures sharing a cause do not retry in lockstep.
  pub jitter: bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      error_delay_ms: 3_000,
      bounce_delay_ms: 10,
      backoff_factor: 2.0,
      max_delay_ms: 120_000,
      stop_grace_ms: 10_000,
      jitter: true,
    }
  }
}

impl EngineConfig {
  /// Parse and validate a JSON document.
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
      message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
  }

  /// Read, parse and validate a JSON file.
  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
      path: path.to_path_buf(),
      message: e.to_string(),
    })?;
    Self::from_json_str(&content)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
      return Err(ConfigError::Invalid {
        message: format!("backoff_factor must be >= 1.0, got {}", self.backoff_factor),
      });
    }
    if self.max_delay_ms < self.error_delay_ms {
      return Err(ConfigError::Invalid {
        message: format!(
          "max_delay_ms ({}) must not be less than error_delay_ms ({})",
          self.max_delay_ms, self.error_delay_ms
        ),
      });
    }
    if self.stop_grace_ms == 0 {
      return Err(ConfigError::Invalid {
        message: "stop_grace_ms must be greater than zero".to_string(),
      });
    }
    Ok(())
  }

  pub fn error_delay(&self) -> Duration {
    Duration::from_millis(self.error_delay_ms)
  }

  pub fn bounce_delay(&self) -> Duration {
    Duration::from_millis(self.bounce_delay_ms)
  }

  pub fn max_delay(&self) -> Duration {
    Duration::from_millis(self.max_delay_ms)
  }

  pub fn stop_grace(&self) -> Duration {
    Duration::from_millis(self.stop_grace_ms)
  }
}

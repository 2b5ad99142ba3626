use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
  #[error("failed to read config file {}: {message}", .path.display())]
  Read { path: PathBuf, message: String },

  #[error("failed to parse config: {message}")]
  Parse { message: String },

  #[error("invalid config: {message}")]
  Invalid { message: String },
}

//! Engine errors.

use std::fmt;

use keel_config::ConfigError;
use keel_graph::GraphError;
use keel_manifold::WorkerError;
use serde::{Deserialize, Serialize};

/// Errors from installing or controlling an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// The manifold set is not a valid graph (duplicate names, unknown inputs, cycles).
  #[error("invalid manifold graph: {0}")]
  Install(#[from] GraphError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("engine already started")]
  AlreadyStarted,

  #[error("engine must be started from within a tokio runtime")]
  NoRuntime,

  #[error("unknown component '{name}'")]
  UnknownComponent { name: String },

  #[error("engine is not running")]
  NotRunning,
}

/// Why a component is named in a shutdown error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
  /// The component was still failing to start when the engine stopped.
  StartFailed,
  /// The component's worker failed after starting and had not been
  /// restarted when the engine stopped.
  Crashed,
  /// The component's worker did not stop within the grace period.
  StopTimeout,
}

impl fmt::Display for FailureKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::StartFailed => write!(f, "start failed"),
      Self::Crashed => write!(f, "crashed"),
      Self::StopTimeout => write!(f, "stop timeout"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentFailure {
  pub name: String,
  pub kind: FailureKind,
  pub error: String,
}

impl fmt::Display for ComponentFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({}): {}", self.name, self.kind, self.error)
  }
}

/// The aggregate result of a finished engine, as returned by `Engine::wait`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShutdownError {
  #[error("components did not reach a stable state: {}", summarize(.failures))]
  Unstable { failures: Vec<ComponentFailure> },

  #[error("component '{name}' failed fatally: {error}")]
  Fatal {
    name: String,
    #[source]
    error: WorkerError,
    failures: Vec<ComponentFailure>,
  },

  #[error("engine coordination loop aborted")]
  Aborted,
}

impl ShutdownError {
  pub fn failures(&self) -> &[ComponentFailure] {
    match self {
      Self::Unstable { failures } | Self::Fatal { failures, .. } => failures,
      Self::Aborted => &[],
    }
  }

  /// Names of every component this error mentions.
  pub fn component_names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.failures().iter().map(|f| f.name.as_str()).collect();
    if let Self::Fatal { name, .. } = self {
      if !names.contains(&name.as_str()) {
        names.insert(0, name);
      }
    }
    names
  }
}

fn summarize(failures: &[ComponentFailure]) -> String {
  failures
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join("; ")
}

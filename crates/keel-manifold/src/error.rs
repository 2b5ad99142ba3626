use std::sync::Arc;

use thiserror::Error;

/// Errors returned by [`Getter`](crate::Getter) lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
  /// The requested name is not one of the caller's declared inputs.
  #[error("'{requester}' did not declare '{name}' as an input")]
  MissingDependency { requester: String, name: String },

  /// The dependency is declared but not currently started.
  #[error("dependency '{name}' is not started")]
  NotStarted { name: String },

  /// The dependency's output is not of the requested type.
  #[error("dependency '{name}' provides {actual}, not {expected}")]
  TypeMismatch {
    name: String,
    expected: String,
    actual: String,
  },

  /// The getter was used after its start function returned.
  #[error("getter for '{requester}' used after its start function returned")]
  Expired { requester: String },
}

/// Errors returned by start functions and by running workers.
///
/// Cloneable so a worker's final result can be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
  /// Restart the component without counting a failure.
  #[error("bounce requested")]
  Bounce,

  /// Remove the component from the engine; it is never restarted.
  #[error("uninstall requested")]
  Uninstall,

  #[error(transparent)]
  Dependency(#[from] DependencyError),

  #[error("worker panicked: {message}")]
  Panicked { message: String },

  #[error("{source}")]
  Failed {
    #[source]
    source: Arc<dyn std::error::Error + Send + Sync>,
  },
}

impl WorkerError {
  /// Wrap an arbitrary error.
  pub fn failed<E>(error: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Failed {
      source: Arc::new(error),
    }
  }

  /// Build a failure from a plain message.
  pub fn msg(message: impl Into<String>) -> Self {
    Self::failed(Message(message.into()))
  }

  pub fn panicked(message: impl Into<String>) -> Self {
    Self::Panicked {
      message: message.into(),
    }
  }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

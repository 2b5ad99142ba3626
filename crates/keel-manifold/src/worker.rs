//! The worker contract and two ready-made workers.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::WorkerError;

/// Upcast to `Any`, implemented for every sized `Send + Sync` type.
///
/// Lets the engine recover a worker's concrete type when extracting its output.
pub trait AsAny: Any + Send + Sync {
  fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> AsAny for T {
  fn as_any(&self) -> &dyn Any {
    self
  }
}

/// A running, supervised task.
///
/// `kill` must return immediately; `wait` resolves once the worker has fully
/// stopped and may be polled by more than one caller.
#[async_trait]
pub trait Worker: AsAny {
  /// Request a cooperative stop.
  fn kill(&self);

  /// Wait for the worker to stop and return its final result.
  async fn wait(&self) -> Result<(), WorkerError>;
}

/// A worker that holds a value until it is killed.
///
/// The usual shape for components whose only job is to provide a resource to
/// their dependents (a clock, a connection, a configuration snapshot).
pub struct ValueWorker<T> {
  value: T,
  cancel: CancellationToken,
}

impl<T: Send + Sync + 'static> ValueWorker<T> {
  pub fn new(value: T) -> Self {
    Self {
      value,
      cancel: CancellationToken::new(),
    }
  }

  pub fn value(&self) -> &T {
    &self.value
  }
}

#[async_trait]
impl<T: Send + Sync + 'static> Worker for ValueWorker<T> {
  fn kill(&self) {
    self.cancel.cancel();
  }

  async fn wait(&self) -> Result<(), WorkerError> {
    self.cancel.cancelled().await;
    Ok(())
  }
}

/// A worker backed by a spawned tokio task.
///
/// The task receives a cancellation token that is cancelled by [`Worker::kill`].
/// A panic inside the task is reported as [`WorkerError::Panicked`].
pub struct TaskWorker {
  cancel: CancellationToken,
  result: watch::Receiver<Option<Result<(), WorkerError>>>,
}

impl TaskWorker {
  /// Spawn `f` on the current tokio runtime with a fresh cancellation token.
  pub fn spawn<F, Fut>(f: F) -> Self
  where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
  {
    Self::spawn_with_token(CancellationToken::new(), f)
  }

  /// Spawn `f` with a caller-supplied token, e.g. a child of a start context.
  pub fn spawn_with_token<F, Fut>(cancel: CancellationToken, f: F) -> Self
  where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
  {
    let (sender, receiver) = watch::channel(None);
    let task = f(cancel.clone());

    tokio::spawn(async move {
      let result = match AssertUnwindSafe(task).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
          let message = panic_message(payload.as_ref());
          error!(panic = %message, "worker task panicked");
          Err(WorkerError::panicked(message))
        }
      };
      // Ignore send errors - every receiver may already be gone
      let _ = sender.send(Some(result));
    });

    Self {
      cancel,
      result: receiver,
    }
  }
}

#[async_trait]
impl Worker for TaskWorker {
  fn kill(&self) {
    self.cancel.cancel();
  }

  async fn wait(&self) -> Result<(), WorkerError> {
    let mut result = self.result.clone();
    match result.wait_for(Option::is_some).await {
      Ok(finished) => finished.clone().unwrap_or(Ok(())),
      Err(_) => Err(WorkerError::panicked("worker task dropped before completion")),
    }
  }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}

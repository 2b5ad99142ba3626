//! Per-component lifecycle: the record the coordination loop keeps for each
//! manifold, and the tasks it spawns to start, watch and time out workers.
//!
//! None of these tasks touch component state. They report back through
//! [`Message`]s tagged with the attempt number they were spawned for, and the
//! loop ignores anything that arrives for an attempt it has moved past.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use keel_manifold::{Getter, Manifold, ResourceAccess, ResourceTable, Worker, WorkerError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::report::{ComponentReport, ComponentState};

/// Everything that can wake the coordination loop.
pub(crate) enum Message {
  /// Restart a component and its dependents.
  Bounce { name: String },
  StartCompleted {
    name: String,
    attempt: u64,
    result: Result<Box<dyn Worker>, WorkerError>,
    resource_log: Vec<ResourceAccess>,
  },
  WorkerExited {
    name: String,
    attempt: u64,
    result: Result<(), WorkerError>,
  },
  /// The grace period for a stop (or a shutdown-cancelled start) expired.
  /// `phase` is the state the component was in when the timer was armed.
  StopTimedOut {
    name: String,
    attempt: u64,
    phase: ComponentState,
  },
  RetryDue { name: String, ticket: u64 },
}

pub(crate) struct Component {
  pub(crate) name: String,
  pub(crate) manifold: Manifold,
  pub(crate) state: ComponentState,
  pub(crate) worker: Option<Arc<dyn Worker>>,
  /// Token handed to the current start call; cancelled on stop.
  pub(crate) cancel: Option<CancellationToken>,
  pub(crate) attempt: u64,
  pub(crate) generation: u64,
  pub(crate) start_count: u64,
  pub(crate) backoff: Backoff,
  pub(crate) error: Option<String>,
  /// Set when the component must be restarted; cleared once it is stopped.
  pub(crate) stop_requested: bool,
  /// Generation of each input seen by the current attempt.
  pub(crate) input_generations: Vec<(String, u64)>,
  /// Ticket of the pending retry timer, if any. Blocks restarts until due.
  pub(crate) retry: Option<u64>,
  retry_seq: u64,
  /// Attempt whose worker ignored its stop; no restart until it exits.
  pub(crate) abandoned: Option<u64>,
  pub(crate) uninstalled: bool,
  pub(crate) stop_timed_out: bool,
  /// The last failure was a running worker exiting with an error.
  pub(crate) crashed: bool,
  pub(crate) resource_log: Vec<ResourceAccess>,
}

impl Component {
  pub(crate) fn new(name: String, manifold: Manifold) -> Self {
    Self {
      name,
      manifold,
      state: ComponentState::Stopped,
      worker: None,
      cancel: None,
      attempt: 0,
      generation: 0,
      start_count: 0,
      backoff: Backoff::default(),
      error: None,
      stop_requested: false,
      input_generations: Vec::new(),
      retry: None,
      retry_seq: 0,
      abandoned: None,
      uninstalled: false,
      stop_timed_out: false,
      crashed: false,
      resource_log: Vec::new(),
    }
  }

  /// Whether a restart may be attempted once the inputs allow it.
  pub(crate) fn is_startable(&self) -> bool {
    self.state == ComponentState::Stopped
      && !self.uninstalled
      && self.abandoned.is_none()
      && self.retry.is_none()
  }

  /// Invoke the start function on its own task.
  ///
  /// `input_generations` are the generations of the inputs as published when
  /// the attempt begins.
  pub(crate) fn spawn_start(
    &mut self,
    input_generations: Vec<(String, u64)>,
    resources: Arc<ResourceTable>,
    sender: &mpsc::UnboundedSender<Message>,
  ) {
    self.attempt += 1;
    self.state = ComponentState::Starting;
    self.stop_requested = false;
    self.input_generations = input_generations;

    let cancel = CancellationToken::new();
    self.cancel = Some(cancel.clone());

    let getter = Getter::new(
      self.name.clone(),
      self.manifold.inputs().to_vec(),
      resources,
    );
    let start = self.manifold.start(cancel, getter.clone());
    let name = self.name.clone();
    let attempt = self.attempt;
    let sender = sender.clone();

    tokio::spawn(async move {
      let result = match AssertUnwindSafe(start).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(WorkerError::panicked(panic_message(payload.as_ref()))),
      };
      getter.expire();
      let _ = sender.send(Message::StartCompleted {
        name,
        attempt,
        result,
        resource_log: getter.resource_log(),
      });
    });
  }

  /// Watch the current worker and report its exit.
  pub(crate) fn spawn_monitor(
    &self,
    worker: Arc<dyn Worker>,
    sender: &mpsc::UnboundedSender<Message>,
  ) {
    let name = self.name.clone();
    let attempt = self.attempt;
    let sender = sender.clone();

    tokio::spawn(async move {
      let result = match AssertUnwindSafe(worker.wait()).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(WorkerError::panicked(panic_message(payload.as_ref()))),
      };
      let _ = sender.send(Message::WorkerExited {
        name,
        attempt,
        result,
      });
    });
  }

  /// Mark the component for restart.
  ///
  /// A start still in flight is cancelled and given the grace period to
  /// return; a started worker is stopped later, once its dependents are down.
  pub(crate) fn request_stop(
    &mut self,
    grace: Duration,
    sender: &mpsc::UnboundedSender<Message>,
  ) {
    if self.stop_requested {
      return;
    }
    self.stop_requested = true;
    if self.state == ComponentState::Starting {
      self.cancel_start();
      self.spawn_stop_timer(grace, sender);
    }
  }

  /// Whether the current start call was asked to give up.
  pub(crate) fn start_cancelled(&self) -> bool {
    self
      .cancel
      .as_ref()
      .is_some_and(CancellationToken::is_cancelled)
  }

  /// Ask the running worker to stop and arm the grace timer.
  pub(crate) fn begin_stop(
    &mut self,
    grace: Duration,
    sender: &mpsc::UnboundedSender<Message>,
  ) {
    self.state = ComponentState::Stopping;
    if let Some(worker) = &self.worker {
      worker.kill();
    }
    self.cancel_start();
    self.spawn_stop_timer(grace, sender);
  }

  /// Cancel the token handed to the start function.
  pub(crate) fn cancel_start(&self) {
    if let Some(cancel) = &self.cancel {
      cancel.cancel();
    }
  }

  pub(crate) fn spawn_stop_timer(
    &self,
    grace: Duration,
    sender: &mpsc::UnboundedSender<Message>,
  ) {
    let name = self.name.clone();
    let attempt = self.attempt;
    let phase = self.state;
    let sender = sender.clone();

    tokio::spawn(async move {
      tokio::time::sleep(grace).await;
      let _ = sender.send(Message::StopTimedOut {
        name,
        attempt,
        phase,
      });
    });
  }

  /// Hold off restarts until `delay` has passed.
  pub(crate) fn schedule_retry(
    &mut self,
    delay: Duration,
    sender: &mpsc::UnboundedSender<Message>,
  ) {
    self.retry_seq += 1;
    let ticket = self.retry_seq;
    self.retry = Some(ticket);

    let name = self.name.clone();
    if delay.is_zero() {
      let _ = sender.send(Message::RetryDue { name, ticket });
      return;
    }

    let sender = sender.clone();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let _ = sender.send(Message::RetryDue { name, ticket });
    });
  }

  /// Drop the worker and start token after the worker has gone.
  pub(crate) fn clear_worker(&mut self) {
    self.worker = None;
    self.cancel = None;
  }

  pub(crate) fn report(&self) -> ComponentReport {
    ComponentReport {
      state: self.state,
      inputs: self.manifold.inputs().to_vec(),
      output_type: self.manifold.output_type().map(str::to_string),
      generation: self.generation,
      start_count: self.start_count,
      error: self.error.clone(),
      uninstalled: self.uninstalled,
      resource_log: self.resource_log.clone(),
    }
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}

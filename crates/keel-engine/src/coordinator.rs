//! The engine's single coordination loop.
//!
//! All component state lives here and is mutated only by [`Coordinator::run`].
//! Start calls, worker waits and timers run on their own tasks and report back
//! through one channel; after every message the loop reconciles the graph:
//!
//! 1. A started (or starting) component whose input was asked to stop is
//!    itself asked to stop, in start order, so requests reach every
//!    transitive dependent in one pass. A start still in flight is cancelled
//!    on the spot.
//! 2. In stop order, a component asked to stop is stopped once none of its
//!    dependents has a start call or worker in flight.
//! 3. In start order, a stopped component whose inputs are all started is
//!    started.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use keel_config::EngineConfig;
use keel_graph::Graph;
use keel_manifold::{Published, Resource, ResourceAccess, ResourceTable, Worker, WorkerError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ComponentFailure, FailureKind, ShutdownError};
use crate::events::{EngineEvent, EngineNotifier, StopReason};
use crate::lifecycle::{Component, Message};
use crate::report::{ComponentState, EngineState, Report, StatusBoard};

/// Decides whether a component error should bring the whole engine down.
pub type FatalFn = Arc<dyn Fn(&WorkerError) -> bool + Send + Sync>;

pub(crate) struct Coordinator<N> {
  config: EngineConfig,
  graph: Graph,
  components: HashMap<String, Component>,
  resources: Arc<ResourceTable>,
  board: Arc<StatusBoard>,
  sender: mpsc::UnboundedSender<Message>,
  receiver: mpsc::UnboundedReceiver<Message>,
  cancel: CancellationToken,
  notifier: N,
  pub(crate) fatal_check: Option<FatalFn>,
  fatal: Option<(String, WorkerError)>,
  shutting_down: bool,
}

impl<N: EngineNotifier> Coordinator<N> {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    config: EngineConfig,
    graph: Graph,
    components: HashMap<String, Component>,
    board: Arc<StatusBoard>,
    sender: mpsc::UnboundedSender<Message>,
    receiver: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
    notifier: N,
  ) -> Self {
    Self {
      config,
      graph,
      components,
      resources: Arc::new(ResourceTable::new()),
      board,
      sender,
      receiver,
      cancel,
      notifier,
      fatal_check: None,
      fatal: None,
      shutting_down: false,
    }
  }

  /// Run until shutdown completes, then return the aggregate result.
  #[instrument(name = "engine", skip(self), fields(components = self.graph.len()))]
  pub(crate) async fn run(mut self) -> Result<(), ShutdownError> {
    info!("engine_running");
    self.board.set_state(EngineState::Running);
    self.reconcile();
    self.publish_report();

    loop {
      if self.shutting_down && self.is_quiescent() {
        break;
      }

      tokio::select! {
        _ = self.cancel.cancelled(), if !self.shutting_down => {
          self.begin_shutdown();
        }
        message = self.receiver.recv() => {
          match message {
            Some(message) => self.handle(message),
            // Unreachable while we hold a sender
            None => break,
          }
        }
      }

      self.reconcile();
      self.publish_report();
    }

    self.finish()
  }

  fn handle(&mut self, message: Message) {
    match message {
      Message::Bounce { name } => self.on_bounce(&name),
      Message::StartCompleted {
        name,
        attempt,
        result,
        resource_log,
      } => self.on_start_completed(&name, attempt, result, resource_log),
      Message::WorkerExited {
        name,
        attempt,
        result,
      } => self.on_worker_exited(&name, attempt, result),
      Message::StopTimedOut {
        name,
        attempt,
        phase,
      } => self.on_stop_timed_out(&name, attempt, phase),
      Message::RetryDue { name, ticket } => self.on_retry_due(&name, ticket),
    }
  }

  fn on_bounce(&mut self, name: &str) {
    let grace = self.config.stop_grace();
    let Some(component) = self.components.get_mut(name) else {
      return;
    };
    if matches!(
      component.state,
      ComponentState::Started | ComponentState::Starting
    ) && !component.stop_requested
    {
      debug!(component = %name, "component_bounce_requested");
      component.request_stop(grace, &self.sender);
    }
  }

  fn on_start_completed(
    &mut self,
    name: &str,
    attempt: u64,
    result: Result<Box<dyn Worker>, WorkerError>,
    resource_log: Vec<ResourceAccess>,
  ) {
    let Some(component) = self.components.get_mut(name) else {
      return;
    };

    if component.attempt != attempt || component.state != ComponentState::Starting {
      // A start abandoned during shutdown finally returned
      if let Ok(worker) = result {
        worker.kill();
      }
      if component.abandoned == Some(attempt) {
        debug!(component = %name, attempt, "abandoned_start_returned");
        component.abandoned = None;
      }
      return;
    }

    component.resource_log = resource_log;

    let result = result.and_then(|worker| match component.manifold.output() {
      None => Ok((worker, None)),
      Some(output) => match output.extract(worker.as_ref()) {
        Some(resource) => Ok((worker, Some(resource))),
        None => {
          worker.kill();
          Err(WorkerError::msg(format!(
            "worker does not provide declared output {}",
            output.type_name()
          )))
        }
      },
    });

    match result {
      Ok((worker, output)) => self.on_started(name, Arc::from(worker), output),
      Err(err) => self.on_start_failed(name, err),
    }
  }

  fn on_started(&mut self, name: &str, worker: Arc<dyn Worker>, output: Option<Resource>) {
    let Some(component) = self.components.get_mut(name) else {
      return;
    };

    component.generation += 1;
    component.start_count += 1;
    component.backoff.reset();
    component.error = None;
    component.crashed = false;
    component.state = ComponentState::Started;
    component.worker = Some(worker.clone());
    component.spawn_monitor(worker, &self.sender);

    let generation = component.generation;
    self.resources.publish(
      name,
      Published {
        generation,
        output,
        output_type: component.manifold.output_type(),
      },
    );

    info!(component = %name, generation, "component_started");
    self.notifier.notify(EngineEvent::ComponentStarted {
      name: name.to_string(),
      generation,
    });
    self.notify_dependents(name);
  }

  fn on_start_failed(&mut self, name: &str, err: WorkerError) {
    let Some(component) = self.components.get_mut(name) else {
      return;
    };

    let cancelled = component.start_cancelled() || self.shutting_down;
    component.clear_worker();
    match component.manifold.filter(err) {
      WorkerError::Uninstall => self.uninstall(name),
      WorkerError::Bounce => {
        debug!(component = %name, "component_start_bounced");
        component.state = ComponentState::Stopped;
        if !self.shutting_down {
          component.schedule_retry(self.config.bounce_delay(), &self.sender);
        }
      }
      // Giving up on a cancelled start is a clean stop
      err if cancelled => {
        info!(component = %name, error = %err, "component_start_cancelled");
        component.stop_requested = false;
        self.notifier.notify(EngineEvent::ComponentStopped {
          name: name.to_string(),
          error: None,
        });
        self.restart_after_bounce(name);
      }
      err => {
        component.state = ComponentState::Error;
        component.error = Some(err.to_string());
        component.crashed = false;
        let delay = component.backoff.record_failure(&self.config);

        let retry_in_ms = if self.shutting_down {
          None
        } else {
          component.schedule_retry(delay, &self.sender);
          Some(delay.as_millis() as u64)
        };

        warn!(
          component = %name,
          error = %err,
          failures = component.backoff.failures(),
          retry_in_ms,
          "component_start_failed"
        );
        self.notifier.notify(EngineEvent::ComponentStartFailed {
          name: name.to_string(),
          error: err.to_string(),
          retry_in_ms,
        });
        self.check_fatal(name, &err);
      }
    }
  }

  fn on_worker_exited(&mut self, name: &str, attempt: u64, result: Result<(), WorkerError>) {
    let Some(component) = self.components.get_mut(name) else {
      return;
    };

    if component.abandoned == Some(attempt) {
      debug!(component = %name, attempt, "abandoned_worker_exited");
      component.abandoned = None;
      return;
    }
    if component.attempt != attempt
      || !matches!(
        component.state,
        ComponentState::Started | ComponentState::Stopping
      )
    {
      return;
    }

    let requested = component.state == ComponentState::Stopping;
    component.clear_worker();
    component.stop_requested = false;
    self.resources.withdraw(name);

    let result = result.map_err(|err| component.manifold.filter(err));
    let error = result.as_ref().err().map(ToString::to_string);

    if requested {
      info!(component = %name, error = ?error, "component_stopped");
      self.notifier.notify(EngineEvent::ComponentStopped {
        name: name.to_string(),
        error: error.clone(),
      });
    } else {
      warn!(component = %name, error = ?error, "component_exited");
      self.notifier.notify(EngineEvent::ComponentExited {
        name: name.to_string(),
        error: error.clone(),
      });
    }

    match result {
      Err(WorkerError::Uninstall) => self.uninstall(name),
      Ok(()) | Err(WorkerError::Bounce) => self.restart_after_bounce(name),
      // A worker that errors while being stopped is not a crash
      Err(_) if requested => {
        if let Some(component) = self.components.get_mut(name) {
          component.error = error;
        }
        self.restart_after_bounce(name);
      }
      Err(err) => self.crashed(name, err),
    }

    self.notify_dependents(name);
  }

  fn restart_after_bounce(&mut self, name: &str) {
    let Some(component) = self.components.get_mut(name) else {
      return;
    };
    component.state = ComponentState::Stopped;
    if !self.shutting_down {
      component.schedule_retry(self.config.bounce_delay(), &self.sender);
    }
  }

  fn crashed(&mut self, name: &str, err: WorkerError) {
    let Some(component) = self.components.get_mut(name) else {
      return;
    };

    component.state = ComponentState::Error;
    component.error = Some(err.to_string());
    component.crashed = true;
    // A crash after a successful start begins a fresh backoff sequence
    component.backoff.reset();
    let delay = component.backoff.record_failure(&self.config);
    if !self.shutting_down {
      component.schedule_retry(delay, &self.sender);
    }

    error!(
      component = %name,
      error = %err,
      retry_in_ms = delay.as_millis() as u64,
      "component_crashed"
    );
    self.check_fatal(name, &err);
  }

  fn uninstall(&mut self, name: &str) {
    let Some(component) = self.components.get_mut(name) else {
      return;
    };

    component.state = ComponentState::Stopped;
    component.uninstalled = true;
    component.retry = None;
    info!(component = %name, "component_uninstalled");
    self.notifier.notify(EngineEvent::ComponentUninstalled {
      name: name.to_string(),
    });
  }

  fn on_stop_timed_out(&mut self, name: &str, attempt: u64, phase: ComponentState) {
    let grace_ms = self.config.stop_grace_ms;
    let Some(component) = self.components.get_mut(name) else {
      return;
    };
    if component.attempt != attempt || component.state != phase {
      return;
    }

    // The worker keeps running unsupervised; its late exit clears `abandoned`
    component.abandoned = Some(attempt);
    component.stop_timed_out = true;
    component.stop_requested = false;
    component.error = Some(format!("worker did not stop within {grace_ms}ms"));
    component.state = ComponentState::Stopped;
    component.clear_worker();
    self.resources.withdraw(name);

    error!(component = %name, grace_ms, "component_stop_timed_out");
    self.notifier.notify(EngineEvent::ComponentStopTimedOut {
      name: name.to_string(),
    });
    self.notify_dependents(name);
  }

  fn on_retry_due(&mut self, name: &str, ticket: u64) {
    let shutting_down = self.shutting_down;
    let Some(component) = self.components.get_mut(name) else {
      return;
    };
    if component.retry != Some(ticket) {
      return;
    }

    component.retry = None;
    if !shutting_down && component.state == ComponentState::Error {
      debug!(component = %name, "component_retry_due");
      component.state = ComponentState::Stopped;
    }
  }

  /// Ask direct dependents to restart if the output they started against is
  /// no longer the one published for `name`.
  fn notify_dependents(&mut self, name: &str) {
    let grace = self.config.stop_grace();
    let current = self
      .components
      .get(name)
      .filter(|c| c.state == ComponentState::Started)
      .map(|c| c.generation);

    for dependent in self.graph.dependents(name) {
      let Some(component) = self.components.get_mut(dependent) else {
        continue;
      };
      if !matches!(
        component.state,
        ComponentState::Started | ComponentState::Starting
      ) || component.stop_requested
      {
        continue;
      }

      let seen = component
        .input_generations
        .iter()
        .find(|(input, _)| input == name)
        .map(|(_, generation)| *generation);
      if seen != current {
        debug!(component = %dependent, input = %name, "input_changed");
        component.request_stop(grace, &self.sender);
      }
    }
  }

  fn begin_shutdown(&mut self) {
    info!("engine_stopping");
    self.shutting_down = true;
    self.board.set_state(EngineState::Stopping);
    self.notifier.notify(EngineEvent::EngineStopping);

    let grace = self.config.stop_grace();
    for component in self.components.values_mut() {
      component.retry = None;
      if component.state == ComponentState::Starting {
        component.cancel_start();
        component.spawn_stop_timer(grace, &self.sender);
      }
    }
  }

  fn reconcile(&mut self) {
    self.propagate_stop_requests();
    self.stop_components();
    if !self.shutting_down {
      self.start_components();
    }
  }

  fn propagate_stop_requests(&mut self) {
    let grace = self.config.stop_grace();
    for name in self.graph.start_order() {
      let stale = {
        let Some(component) = self.components.get(name) else {
          continue;
        };
        matches!(
          component.state,
          ComponentState::Started | ComponentState::Starting
        ) && !component.stop_requested
          && self.graph.inputs(name).iter().any(|input| {
            self
              .components
              .get(input)
              .is_some_and(|c| c.stop_requested)
          })
      };

      if stale {
        debug!(component = %name, "input_stopping");
        if let Some(component) = self.components.get_mut(name) {
          component.request_stop(grace, &self.sender);
        }
      }
    }
  }

  fn stop_components(&mut self) {
    let reason = if self.shutting_down {
      StopReason::Shutdown
    } else {
      StopReason::Bounce
    };
    let grace = self.config.stop_grace();

    for name in self.graph.stop_order() {
      let ready = {
        let Some(component) = self.components.get(name) else {
          continue;
        };
        component.state == ComponentState::Started
          && (component.stop_requested || self.shutting_down)
          && self.graph.dependents(name).iter().all(|dependent| {
            self
              .components
              .get(dependent)
              .is_none_or(|c| c.state.is_at_rest())
          })
      };
      if !ready {
        continue;
      }

      if let Some(component) = self.components.get_mut(name) {
        info!(component = %name, ?reason, "component_stopping");
        self.resources.withdraw(name);
        component.begin_stop(grace, &self.sender);
        self.notifier.notify(EngineEvent::ComponentStopping {
          name: name.to_string(),
          reason,
        });
      }
    }
  }

  fn start_components(&mut self) {
    for name in self.graph.start_order() {
      let inputs = {
        let Some(component) = self.components.get(name) else {
          continue;
        };
        if !component.is_startable() {
          continue;
        }

        let mut inputs = Vec::with_capacity(self.graph.inputs(name).len());
        for input in self.graph.inputs(name) {
          match self.components.get(input) {
            Some(c) if c.state == ComponentState::Started && !c.stop_requested => {
              inputs.push((input.clone(), c.generation));
            }
            _ => break,
          }
        }
        if inputs.len() != self.graph.inputs(name).len() {
          continue;
        }
        inputs
      };

      if let Some(component) = self.components.get_mut(name) {
        component.spawn_start(inputs, self.resources.clone(), &self.sender);
        debug!(component = %name, attempt = component.attempt, "component_starting");
        self.notifier.notify(EngineEvent::ComponentStarting {
          name: name.clone(),
          attempt: component.attempt,
        });
      }
    }
  }

  fn check_fatal(&mut self, name: &str, err: &WorkerError) {
    let fatal = self.fatal_check.as_ref().is_some_and(|check| check(err));
    if fatal && self.fatal.is_none() {
      error!(component = %name, error = %err, "component_fatal");
      self.fatal = Some((name.to_string(), err.clone()));
      self.cancel.cancel();
    }
  }

  fn is_quiescent(&self) -> bool {
    self.components.values().all(|c| c.state.is_at_rest())
  }

  fn build_report(&self, state: EngineState, error: Option<String>) -> Report {
    let components = self
      .components
      .iter()
      .map(|(name, component)| (name.clone(), component.report()))
      .collect::<BTreeMap<_, _>>();
    Report {
      state,
      components,
      error,
    }
  }

  fn publish_report(&self) {
    let state = if self.shutting_down {
      EngineState::Stopping
    } else {
      EngineState::Running
    };
    self.board.replace(self.build_report(state, None));
  }

  /// Collect what went wrong, settle every component in `Stopped`, and
  /// publish the final report.
  fn finish(mut self) -> Result<(), ShutdownError> {
    let mut failures = Vec::new();
    for name in self.graph.start_order() {
      let Some(component) = self.components.get_mut(name) else {
        continue;
      };
      let error = component.error.clone().unwrap_or_default();
      if component.stop_timed_out {
        failures.push(ComponentFailure {
          name: name.clone(),
          kind: FailureKind::StopTimeout,
          error,
        });
      } else if component.state == ComponentState::Error {
        let kind = if component.crashed {
          FailureKind::Crashed
        } else {
          FailureKind::StartFailed
        };
        failures.push(ComponentFailure {
          name: name.clone(),
          kind,
          error,
        });
      }
      component.state = ComponentState::Stopped;
    }

    let result = match self.fatal.take() {
      Some((name, error)) => Err(ShutdownError::Fatal {
        name,
        error,
        failures,
      }),
      None if failures.is_empty() => Ok(()),
      None => Err(ShutdownError::Unstable { failures }),
    };

    let error = result.as_ref().err().map(ToString::to_string);
    match &error {
      Some(error) => warn!(%error, "engine_stopped"),
      None => info!("engine_stopped"),
    }
    self
      .board
      .replace(self.build_report(EngineState::Stopped, error.clone()));
    self.notifier.notify(EngineEvent::EngineStopped { error });

    result
  }
}

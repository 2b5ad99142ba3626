//! The public engine handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use keel_config::EngineConfig;
use keel_graph::Graph;
use keel_manifold::{Manifold, Worker, WorkerError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::coordinator::Coordinator;
use crate::error::{EngineError, ShutdownError};
use crate::events::{EngineNotifier, NoopNotifier};
use crate::lifecycle::{Component, Message};
use crate::report::{EngineState, Report, StatusBoard};

type Outcome = Option<Result<(), ShutdownError>>;

/// Installed but not yet running.
struct Pending<N> {
  coordinator: Coordinator<N>,
  done: watch::Sender<Outcome>,
}

/// Supervises a fixed set of manifolds.
///
/// # Usage
///
/// ```ignore
/// let engine = Engine::install(EngineConfig::default(), [
///   ("clock", clock_manifold),
///   ("api", api_manifold),
/// ])?;
/// engine.start()?;
///
/// // Later
/// engine.kill();
/// engine.wait().await?;
/// ```
///
/// The engine is itself a [`Worker`], so it can be run as a component of
/// another engine.
pub struct Engine<N: EngineNotifier = NoopNotifier> {
  cancel: CancellationToken,
  sender: mpsc::UnboundedSender<Message>,
  board: Arc<StatusBoard>,
  pending: Mutex<Option<Pending<N>>>,
  done: watch::Receiver<Outcome>,
}

impl Engine<NoopNotifier> {
  /// Validate the configuration and manifold graph without starting anything.
  pub fn install<I, S>(config: EngineConfig, manifolds: I) -> Result<Self, EngineError>
  where
    I: IntoIterator<Item = (S, Manifold)>,
    S: Into<String>,
  {
    Self::with_notifier(config, manifolds, NoopNotifier)
  }
}

impl<N: EngineNotifier + 'static> Engine<N> {
  /// Like [`Engine::install`], reporting state changes to `notifier`.
  pub fn with_notifier<I, S>(
    config: EngineConfig,
    manifolds: I,
    notifier: N,
  ) -> Result<Self, EngineError>
  where
    I: IntoIterator<Item = (S, Manifold)>,
    S: Into<String>,
  {
    config.validate()?;

    let manifolds: Vec<(String, Manifold)> = manifolds
      .into_iter()
      .map(|(name, manifold)| (name.into(), manifold))
      .collect();
    let graph = Graph::new(
      manifolds
        .iter()
        .map(|(name, manifold)| (name.clone(), manifold.inputs().to_vec())),
    )?;

    let components: HashMap<String, Component> = manifolds
      .into_iter()
      .map(|(name, manifold)| (name.clone(), Component::new(name, manifold)))
      .collect();
    let board = Arc::new(StatusBoard::new(Report {
      state: EngineState::Installing,
      components: components
        .iter()
        .map(|(name, component)| (name.clone(), component.report()))
        .collect(),
      error: None,
    }));

    info!(components = graph.len(), "engine_installed");

    let (sender, receiver) = mpsc::unbounded_channel();
    let (done_sender, done) = watch::channel(None);
    let cancel = CancellationToken::new();
    let coordinator = Coordinator::new(
      config,
      graph,
      components,
      board.clone(),
      sender.clone(),
      receiver,
      cancel.clone(),
      notifier,
    );

    Ok(Self {
      cancel,
      sender,
      board,
      pending: Mutex::new(Some(Pending {
        coordinator,
        done: done_sender,
      })),
      done,
    })
  }

  /// Shut the engine down when a component error satisfies `check`.
  ///
  /// Has no effect once the engine is started.
  pub fn with_fatal<F>(self, check: F) -> Self
  where
    F: Fn(&WorkerError) -> bool + Send + Sync + 'static,
  {
    if let Some(pending) = self
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .as_mut()
    {
      pending.coordinator.fatal_check = Some(Arc::new(check));
    }
    self
  }

  /// Spawn the coordination loop on the current tokio runtime.
  pub fn start(&self) -> Result<(), EngineError> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
    let pending = self
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    let Some(pending) = pending else {
      return Err(if self.cancel.is_cancelled() {
        EngineError::NotRunning
      } else {
        EngineError::AlreadyStarted
      });
    };

    runtime.spawn(async move {
      let result = pending.coordinator.run().await;
      // Ignore send errors - every handle may already be gone
      let _ = pending.done.send(Some(result));
    });
    Ok(())
  }

  /// Begin an orderly shutdown. Returns immediately.
  pub fn kill(&self) {
    self.cancel.cancel();

    // Never started: nothing to stop
    let pending = self
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(pending) = pending {
      self.board.set_state(EngineState::Stopped);
      let _ = pending.done.send(Some(Ok(())));
    }
  }

  /// Wait for shutdown to complete.
  ///
  /// Fails if any component could not be stopped within the grace period,
  /// was left failing, or hit the fatal predicate.
  pub async fn wait(&self) -> Result<(), ShutdownError> {
    let mut done = self.done.clone();
    match done.wait_for(Option::is_some).await {
      Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
      Err(_) => Err(ShutdownError::Aborted),
    }
  }

  /// A consistent snapshot of every component.
  pub fn report(&self) -> Report {
    self.board.snapshot()
  }

  /// Restart a component and, transitively, everything that depends on it.
  pub fn bounce(&self, name: &str) -> Result<(), EngineError> {
    if !self.board.contains(name) {
      return Err(EngineError::UnknownComponent {
        name: name.to_string(),
      });
    }
    if self.cancel.is_cancelled() {
      return Err(EngineError::NotRunning);
    }
    self
      .sender
      .send(Message::Bounce {
        name: name.to_string(),
      })
      .map_err(|_| EngineError::NotRunning)
  }
}

#[async_trait]
impl<N: EngineNotifier + 'static> Worker for Engine<N> {
  fn kill(&self) {
    Engine::kill(self);
  }

  async fn wait(&self) -> Result<(), WorkerError> {
    Engine::wait(self).await.map_err(WorkerError::failed)
  }
}

impl<N: EngineNotifier> Drop for Engine<N> {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

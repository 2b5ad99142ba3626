//! Engine events and notifiers for observability.
//!
//! Events are emitted by the coordination loop on every component state
//! change, allowing consumers to observe restarts, persist history, stream to
//! UIs, or assert ordering in tests.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Why a started component is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
  /// An input changed, stopped, or the component was bounced explicitly.
  Bounce,
  /// The engine is shutting down.
  Shutdown,
}

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
  /// A start function has been invoked.
  ComponentStarting { name: String, attempt: u64 },

  /// A start function succeeded and the output was published.
  ComponentStarted { name: String, generation: u64 },

  /// A start function failed. `retry_in_ms` is absent during shutdown.
  ComponentStartFailed {
    name: String,
    error: String,
    retry_in_ms: Option<u64>,
  },

  /// A started component was asked to stop.
  ComponentStopping { name: String, reason: StopReason },

  /// A component stopped after being asked to.
  ComponentStopped { name: String, error: Option<String> },

  /// A started component exited on its own.
  ComponentExited { name: String, error: Option<String> },

  /// A worker ignored its stop request for the whole grace period.
  ComponentStopTimedOut { name: String },

  /// A component asked to be removed and will not be restarted.
  ComponentUninstalled { name: String },

  /// Shutdown has begun.
  EngineStopping,

  /// Every component is at rest and the coordination loop has exited.
  EngineStopped { error: Option<String> },
}

impl EngineEvent {
  /// Name of the component this event concerns, if any.
  pub fn component(&self) -> Option<&str> {
    match self {
      Self::ComponentStarting { name, .. }
      | Self::ComponentStarted { name, .. }
      | Self::ComponentStartFailed { name, .. }
      | Self::ComponentStopping { name, .. }
      | Self::ComponentStopped { name, .. }
      | Self::ComponentExited { name, .. }
      | Self::ComponentStopTimedOut { name }
      | Self::ComponentUninstalled { name } => Some(name),
      Self::EngineStopping | Self::EngineStopped { .. } => None,
    }
  }
}

/// Trait for receiving engine events.
///
/// The engine calls `notify` from its coordination loop, so implementations
/// must not block.
pub trait EngineNotifier: Send + Sync {
  fn notify(&self, event: EngineEvent);
}

/// A notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl EngineNotifier for NoopNotifier {
  fn notify(&self, _event: EngineEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls the coordination loop
  sender: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<EngineEvent>) -> Self {
    Self { sender }
  }
}

impl EngineNotifier for ChannelNotifier {
  fn notify(&self, event: EngineEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(event);
  }
}

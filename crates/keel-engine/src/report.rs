//! Point-in-time snapshots of engine state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use keel_manifold::ResourceAccess;
use serde::{Deserialize, Serialize};

/// Lifecycle state of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
  Stopped,
  Starting,
  Started,
  Stopping,
  /// The last start attempt or run failed; a retry is scheduled.
  Error,
}

impl ComponentState {
  /// Whether the component has no start call or worker in flight.
  pub fn is_at_rest(self) -> bool {
    matches!(self, Self::Stopped | Self::Error)
  }
}

impl fmt::Display for ComponentState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Stopped => "stopped",
      Self::Starting => "starting",
      Self::Started => "started",
      Self::Stopping => "stopping",
      Self::Error => "error",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
  /// Installed but not yet started.
  Installing,
  Running,
  Stopping,
  Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentReport {
  pub state: ComponentState,
  pub inputs: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output_type: Option<String>,
  /// Incremented on every successful start.
  pub generation: u64,
  pub start_count: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub uninstalled: bool,
  /// Getter calls made by the most recent start attempt.
  pub resource_log: Vec<ResourceAccess>,
}

/// A consistent snapshot of the whole engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
  pub state: EngineState,
  pub components: BTreeMap<String, ComponentReport>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl Report {
  pub fn component(&self, name: &str) -> Option<&ComponentReport> {
    self.components.get(name)
  }

  pub fn state_of(&self, name: &str) -> Option<ComponentState> {
    self.component(name).map(|c| c.state)
  }

  pub fn generation_of(&self, name: &str) -> Option<u64> {
    self.component(name).map(|c| c.generation)
  }

  /// Whether every component is started.
  pub fn all_started(&self) -> bool {
    self
      .components
      .values()
      .all(|c| c.state == ComponentState::Started)
  }
}

/// The latest report, replaced wholesale by the coordination loop.
#[derive(Debug)]
pub(crate) struct StatusBoard {
  report: RwLock<Report>,
}

impl StatusBoard {
  pub(crate) fn new(report: Report) -> Self {
    Self {
      report: RwLock::new(report),
    }
  }

  pub(crate) fn snapshot(&self) -> Report {
    self
      .report
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub(crate) fn replace(&self, report: Report) {
    *self.report.write().unwrap_or_else(PoisonError::into_inner) = report;
  }

  pub(crate) fn set_state(&self, state: EngineState) {
    self
      .report
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .state = state;
  }

  pub(crate) fn contains(&self, name: &str) -> bool {
    self
      .report
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .components
      .contains_key(name)
  }
}

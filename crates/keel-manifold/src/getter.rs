//! Dependency resolution for starting components.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::DependencyError;

/// A component's output value, shared with its dependents.
pub type Resource = Arc<dyn Any + Send + Sync>;

/// The published view of one started component.
#[derive(Clone)]
pub struct Published {
  pub generation: u64,
  pub output: Option<Resource>,
  pub output_type: Option<&'static str>,
}

impl std::fmt::Debug for Published {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Published")
      .field("generation", &self.generation)
      .field("output_type", &self.output_type)
      .finish()
  }
}

/// Outputs of every started component, keyed by name.
///
/// Written only by the engine's coordination loop; read by getters under a
/// short-lived read lock. A name is present exactly while its component is
/// started, and its output and generation are replaced together.
#[derive(Debug, Default)]
pub struct ResourceTable {
  entries: RwLock<HashMap<String, Published>>,
}

impl ResourceTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn publish(&self, name: &str, published: Published) {
    let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
    entries.insert(name.to_string(), published);
  }

  pub fn withdraw(&self, name: &str) {
    let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
    entries.remove(name);
  }

  /// Copy out the published entry for `name`, if started.
  pub fn lookup(&self, name: &str) -> Option<Published> {
    let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
    entries.get(name).cloned()
  }
}

/// One getter call, recorded for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAccess {
  pub name: String,
  /// `None` when only the dependency's presence was checked.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub requested_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

/// Read-only, type-checked access to a starting component's declared inputs.
///
/// A getter never blocks and is only valid while its start function runs;
/// afterwards every call fails with [`DependencyError::Expired`].
#[derive(Clone)]
pub struct Getter {
  requester: Arc<str>,
  inputs: Arc<[String]>,
  table: Arc<ResourceTable>,
  expired: Arc<AtomicBool>,
  log: Arc<Mutex<Vec<ResourceAccess>>>,
}

impl Getter {
  pub fn new(
    requester: impl Into<String>,
    inputs: Vec<String>,
    table: Arc<ResourceTable>,
  ) -> Self {
    Self {
      requester: Arc::from(requester.into()),
      inputs: Arc::from(inputs),
      table,
      expired: Arc::new(AtomicBool::new(false)),
      log: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Name of the component this getter was handed to.
  pub fn requester(&self) -> &str {
    &self.requester
  }

  /// Fetch a copy of a declared input's output.
  pub fn get<T: Clone + 'static>(&self, name: &str) -> Result<T, DependencyError> {
    let result = self.resolve(name).and_then(|published| {
      published
        .output
        .as_ref()
        .and_then(|resource| resource.downcast_ref::<T>())
        .cloned()
        .ok_or_else(|| DependencyError::TypeMismatch {
          name: name.to_string(),
          expected: type_name::<T>().to_string(),
          actual: published.output_type.unwrap_or("no output").to_string(),
        })
    });

    self.record(name, Some(type_name::<T>()), result.as_ref().err());
    result
  }

  /// Check that a declared input is started, without reading its output.
  pub fn require(&self, name: &str) -> Result<(), DependencyError> {
    let result = self.resolve(name).map(|_| ());
    self.record(name, None, result.as_ref().err());
    result
  }

  /// Invalidate the getter. Called by the engine once the start function returns.
  pub fn expire(&self) {
    self.expired.store(true, Ordering::Release);
  }

  pub fn is_expired(&self) -> bool {
    self.expired.load(Ordering::Acquire)
  }

  /// Every access made through this getter (and its clones), in order.
  pub fn resource_log(&self) -> Vec<ResourceAccess> {
    self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  fn resolve(&self, name: &str) -> Result<Published, DependencyError> {
    if self.is_expired() {
      return Err(DependencyError::Expired {
        requester: self.requester.to_string(),
      });
    }
    if !self.inputs.iter().any(|input| input == name) {
      return Err(DependencyError::MissingDependency {
        requester: self.requester.to_string(),
        name: name.to_string(),
      });
    }
    self
      .table
      .lookup(name)
      .ok_or_else(|| DependencyError::NotStarted {
        name: name.to_string(),
      })
  }

  fn record(&self, name: &str, requested_type: Option<&str>, error: Option<&DependencyError>) {
    let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
    log.push(ResourceAccess {
      name: name.to_string(),
      requested_type: requested_type.map(str::to_string),
      error: error.map(ToString::to_string),
    });
  }
}

impl std::fmt::Debug for Getter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Getter")
      .field("requester", &self.requester)
      .field("inputs", &self.inputs)
      .field("expired", &self.is_expired())
      .finish()
  }
}

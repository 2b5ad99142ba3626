//! Manifold descriptors.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;
use crate::getter::{Getter, Resource};
use crate::worker::Worker;

/// Future returned by a start function.
pub type StartFuture = BoxFuture<'static, Result<Box<dyn Worker>, WorkerError>>;

/// Type-erased start function.
pub type StartFn = Arc<dyn Fn(CancellationToken, Getter) -> StartFuture + Send + Sync>;

/// Translates a start or exit error before the engine interprets it.
pub type FilterFn = Arc<dyn Fn(WorkerError) -> WorkerError + Send + Sync>;

type ExtractFn = Arc<dyn Fn(&dyn Worker) -> Option<Resource> + Send + Sync>;

/// Declares the value a component exposes to its dependents.
///
/// The extraction runs once per successful start, against the concrete
/// worker type the start function returned.
#[derive(Clone)]
pub struct Output {
  type_name: &'static str,
  extract: ExtractFn,
}

impl Output {
  /// Expose a `T` derived from a started worker of type `W`.
  pub fn new<W, T, F>(f: F) -> Self
  where
    W: Worker,
    T: Send + Sync + 'static,
    F: Fn(&W) -> T + Send + Sync + 'static,
  {
    let extract: ExtractFn = Arc::new(move |worker: &dyn Worker| {
      worker
        .as_any()
        .downcast_ref::<W>()
        .map(|concrete| Arc::new(f(concrete)) as Resource)
    });

    Self {
      type_name: std::any::type_name::<T>(),
      extract,
    }
  }

  /// Name of the exposed type, for reports and error messages.
  pub fn type_name(&self) -> &'static str {
    self.type_name
  }

  /// Produce the output for a started worker, or `None` if the worker is not
  /// of the type this output was declared for.
  pub fn extract(&self, worker: &dyn Worker) -> Option<Resource> {
    (self.extract)(worker)
  }
}

impl fmt::Debug for Output {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Output")
      .field("type_name", &self.type_name)
      .finish()
  }
}

/// A declarative descriptor of a supervised component.
///
/// Immutable once installed in an engine.
#[derive(Clone)]
pub struct Manifold {
  inputs: Vec<String>,
  output: Option<Output>,
  start: StartFn,
  filter: Option<FilterFn>,
}

impl Manifold {
  /// Create a manifold with no inputs and no output.
  ///
  /// The start function receives a cancellation token scoped to this start
  /// attempt and a [`Getter`] over the declared inputs. It must return
  /// promptly; a dependency that cannot be resolved yet should be reported as
  /// an error so the engine retries later.
  pub fn new<F, Fut, W>(start: F) -> Self
  where
    F: Fn(CancellationToken, Getter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<W, WorkerError>> + Send + 'static,
    W: Worker,
  {
    let start: StartFn = Arc::new(move |cancel: CancellationToken, getter: Getter| {
      start(cancel, getter)
        .map(|result| result.map(|worker| Box::new(worker) as Box<dyn Worker>))
        .boxed()
    });

    Self {
      inputs: Vec::new(),
      output: None,
      start,
      filter: None,
    }
  }

  /// Declare the names of the components this one depends on.
  pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.inputs = inputs.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_output(mut self, output: Output) -> Self {
    self.output = Some(output);
    self
  }

  pub fn with_filter<F>(mut self, filter: F) -> Self
  where
    F: Fn(WorkerError) -> WorkerError + Send + Sync + 'static,
  {
    self.filter = Some(Arc::new(filter));
    self
  }

  pub fn inputs(&self) -> &[String] {
    &self.inputs
  }

  pub fn output(&self) -> Option<&Output> {
    self.output.as_ref()
  }

  pub fn output_type(&self) -> Option<&'static str> {
    self.output.as_ref().map(Output::type_name)
  }

  /// Invoke the start function.
  pub fn start(&self, cancel: CancellationToken, getter: Getter) -> StartFuture {
    (self.start)(cancel, getter)
  }

  /// Apply the filter, if any.
  pub fn filter(&self, error: WorkerError) -> WorkerError {
    match &self.filter {
      Some(filter) => filter(error),
      None => error,
    }
  }
}

impl fmt::Debug for Manifold {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Manifold")
      .field("inputs", &self.inputs)
      .field("output", &self.output)
      .field("filter", &self.filter.is_some())
      .finish()
  }
}

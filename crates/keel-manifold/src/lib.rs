//! Keel Manifold
//!
//! The authoring surface of the keel dependency engine. A component author
//! describes a supervised component with a [`Manifold`]: the names of the
//! components it depends on, an optional [`Output`] it exposes to its own
//! dependents, and an async start function that turns a [`Getter`] into a
//! running [`Worker`].
//!
//! ```ignore
//! let api = Manifold::new(|cancel, getter| async move {
//!   let clock: Clock = getter.get("clock")?;
//!   Ok(ValueWorker::new(ApiConn::dial(clock, cancel).await?))
//! })
//! .with_inputs(["clock"])
//! .with_output(Output::new(|w: &ValueWorker<ApiConn>| w.value().clone()));
//! ```
//!
//! The engine itself lives in `keel-engine`; this crate only defines the
//! contract between the engine and the components it runs.

mod error;
mod getter;
mod manifold;
mod worker;

pub use error::{DependencyError, WorkerError};
pub use getter::{Getter, Published, Resource, ResourceAccess, ResourceTable};
pub use manifold::{FilterFn, Manifold, Output, StartFn, StartFuture};
pub use worker::{AsAny, TaskWorker, ValueWorker, Worker};

//! Keel Engine
//!
//! This crate runs a fixed graph of manifolds. Each manifold is started once
//! all of its inputs are started, restarted with backoff when it fails, and
//! restarted along with every dependent whenever an input changes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │  - install(config, manifolds) validates the graph           │
//! │  - start() spawns the coordination loop                     │
//! │  - kill() / wait() / report() / bounce(name)                │
//! └─────────────────────────────────────────────────────────────┘
//!                               │ mpsc
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Coordinator                           │
//! │  - sole owner of component state                            │
//! │  - reconciles stops (reverse order) and starts (topo order) │
//! │  - publishes outputs and the status report                  │
//! └─────────────────────────────────────────────────────────────┘
//!                               │ spawns
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Lifecycle tasks                           │
//! │  - start calls, worker waits, grace and retry timers        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use keel_engine::{Engine, EngineConfig, Manifold, Output, ValueWorker};
//!
//! let clock = Manifold::new(|_cancel, _getter| async { Ok(ValueWorker::new(Clock::new())) })
//!   .with_output(Output::new(|w: &ValueWorker<Clock>| w.value().clone()));
//!
//! let api = Manifold::new(|_cancel, getter| async move {
//!   let clock: Clock = getter.get("clock")?;
//!   Ok(ValueWorker::new(ApiConn::connect(clock)))
//! })
//! .with_inputs(["clock"]);
//!
//! let engine = Engine::install(EngineConfig::default(), [("clock", clock), ("api", api)])?;
//! engine.start()?;
//! ```

mod backoff;
mod coordinator;
mod engine;
mod error;
mod events;
mod lifecycle;
mod report;

pub use coordinator::FatalFn;
pub use engine::Engine;
pub use error::{ComponentFailure, EngineError, FailureKind, ShutdownError};
pub use events::{ChannelNotifier, EngineEvent, EngineNotifier, NoopNotifier, StopReason};
pub use report::{ComponentReport, ComponentState, EngineState, Report};

// Re-export the building blocks so most users need only this crate
pub use keel_config::{ConfigError, EngineConfig};
pub use keel_graph::{Graph, GraphError};
pub use keel_manifold::{
  DependencyError, Getter, Manifold, Output, ResourceAccess, TaskWorker, ValueWorker, Worker,
  WorkerError,
};

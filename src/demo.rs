//! A sample agent: a clock, an API connection built on it, and a background
//! worker that uses the connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_engine::{Getter, Manifold, Output, TaskWorker, Worker, WorkerError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const COMPONENTS: [&str; 3] = ["clock", "api", "worker"];

#[derive(Debug, Clone)]
pub struct Clock {
  pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ApiConn {
  pub endpoint: String,
  pub interval: Duration,
}

/// One crash trigger per demo component.
#[derive(Debug, Clone)]
pub struct CrashSwitches {
  switches: HashMap<&'static str, Arc<Notify>>,
}

impl CrashSwitches {
  pub fn new() -> Self {
    Self {
      switches: COMPONENTS
        .iter()
        .map(|name| (*name, Arc::new(Notify::new())))
        .collect(),
    }
  }

  /// Make the named component's running worker fail. Returns false for an
  /// unknown name.
  pub fn trip(&self, name: &str) -> bool {
    match self.switches.get(name) {
      Some(switch) => {
        switch.notify_one();
        true
      }
      None => false,
    }
  }

  fn switch(&self, name: &str) -> Arc<Notify> {
    self.switches.get(name).cloned().unwrap_or_default()
  }
}

impl Default for CrashSwitches {
  fn default() -> Self {
    Self::new()
  }
}

/// Exposes `value` while a background loop runs.
struct DemoWorker<T> {
  value: T,
  task: TaskWorker,
}

#[async_trait]
impl<T: Send + Sync + 'static> Worker for DemoWorker<T> {
  fn kill(&self) {
    self.task.kill();
  }

  async fn wait(&self) -> Result<(), WorkerError> {
    self.task.wait().await
  }
}

/// Tick every `interval` until killed; fail when `crash` fires.
///
/// The loop also stops if the start attempt that spawned it is cancelled.
fn spawn_loop(
  name: &'static str,
  interval: Duration,
  start: &CancellationToken,
  crash: Arc<Notify>,
) -> TaskWorker {
  TaskWorker::spawn_with_token(start.child_token(), move |cancel| async move {
    let mut ticks = tokio::time::interval(interval);
    let mut count: u64 = 0;
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        _ = crash.notified() => {
          return Err(WorkerError::msg(format!("{name} crashed on request")));
        }
        _ = ticks.tick() => {
          count += 1;
          debug!(component = name, count, "tick");
        }
      }
    }
  })
}

async fn start_clock(
  cancel: CancellationToken,
  interval: Duration,
  crash: Arc<Notify>,
) -> Result<DemoWorker<Clock>, WorkerError> {
  Ok(DemoWorker {
    value: Clock { interval },
    task: spawn_loop("clock", interval, &cancel, crash),
  })
}

async fn start_api(
  cancel: CancellationToken,
  getter: Getter,
  endpoint: String,
  crash: Arc<Notify>,
) -> Result<DemoWorker<ApiConn>, WorkerError> {
  let clock = getter.get::<Clock>("clock")?;
  info!(component = getter.requester(), %endpoint, "api_connected");
  Ok(DemoWorker {
    value: ApiConn {
      endpoint,
      interval: clock.interval,
    },
    task: spawn_loop("api", clock.interval, &cancel, crash),
  })
}

async fn start_worker(
  cancel: CancellationToken,
  getter: Getter,
  crash: Arc<Notify>,
) -> Result<DemoWorker<()>, WorkerError> {
  let api = getter.get::<ApiConn>("api")?;
  debug!(component = getter.requester(), endpoint = %api.endpoint, "worker_attached");
  Ok(DemoWorker {
    value: (),
    task: spawn_loop("worker", api.interval * 2, &cancel, crash),
  })
}

/// The demo graph: `clock -> api -> worker`.
pub fn manifolds(
  interval: Duration,
  endpoint: &str,
  switches: &CrashSwitches,
) -> Vec<(&'static str, Manifold)> {
  let clock_crash = switches.switch("clock");
  let api_crash = switches.switch("api");
  let worker_crash = switches.switch("worker");
  let endpoint = endpoint.to_string();

  vec![
    (
      "clock",
      Manifold::new(move |cancel, _getter| start_clock(cancel, interval, clock_crash.clone()))
        .with_output(Output::new(|w: &DemoWorker<Clock>| w.value.clone())),
    ),
    (
      "api",
      Manifold::new(move |cancel, getter| {
        start_api(cancel, getter, endpoint.clone(), api_crash.clone())
      })
      .with_inputs(["clock"])
      .with_output(Output::new(|w: &DemoWorker<ApiConn>| w.value.clone())),
    ),
    (
      "worker",
      Manifold::new(move |cancel, getter| start_worker(cancel, getter, worker_crash.clone()))
        .with_inputs(["api"]),
    ),
  ]
}

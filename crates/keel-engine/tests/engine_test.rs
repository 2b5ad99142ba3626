//! Integration tests for Engine supervision: ordering, restarts, failures and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keel_engine::{
  ChannelNotifier, ComponentState, DependencyError, Engine, EngineConfig, EngineEvent,
  EngineNotifier, EngineState, FailureKind, Getter, Manifold, Output, Report, ShutdownError,
  StopReason, TaskWorker, ValueWorker, Worker, WorkerError,
};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
struct Clock {
  tick_ms: u64,
}

#[derive(Debug, Clone)]
struct ApiConn {
  tick_ms: u64,
}

/// A clock whose worker can be made to crash from outside.
struct ClockWorker {
  clock: Clock,
  task: TaskWorker,
}

#[async_trait]
impl Worker for ClockWorker {
  fn kill(&self) {
    self.task.kill();
  }

  async fn wait(&self) -> Result<(), WorkerError> {
    self.task.wait().await
  }
}

fn config() -> EngineConfig {
  EngineConfig {
    error_delay_ms: 20,
    bounce_delay_ms: 5,
    backoff_factor: 2.0,
    max_delay_ms: 200,
    stop_grace_ms: 500,
    jitter: false,
  }
}

async fn start_clock(crash: Arc<Notify>) -> Result<ClockWorker, WorkerError> {
  let task = TaskWorker::spawn(move |cancel| async move {
    tokio::select! {
      _ = cancel.cancelled() => Ok(()),
      _ = crash.notified() => Err(WorkerError::msg("clock crashed")),
    }
  });
  Ok(ClockWorker {
    clock: Clock { tick_ms: 10 },
    task,
  })
}

fn clock(crash: Arc<Notify>) -> Manifold {
  Manifold::new(move |_cancel, _getter| start_clock(crash.clone()))
    .with_output(Output::new(|w: &ClockWorker| w.clock.clone()))
}

/// Counts getter calls that observed an input that was not started.
async fn start_api(
  getter: Getter,
  not_started: Arc<AtomicUsize>,
) -> Result<ValueWorker<ApiConn>, WorkerError> {
  let clock = getter.get::<Clock>("clock").inspect_err(|err| {
    if matches!(err, DependencyError::NotStarted { .. }) {
      not_started.fetch_add(1, Ordering::SeqCst);
    }
  })?;
  Ok(ValueWorker::new(ApiConn {
    tick_ms: clock.tick_ms,
  }))
}

fn api(not_started: Arc<AtomicUsize>) -> Manifold {
  Manifold::new(move |_cancel, getter| start_api(getter, not_started.clone()))
    .with_inputs(["clock"])
    .with_output(Output::new(|w: &ValueWorker<ApiConn>| w.value().clone()))
}

async fn start_background(getter: Getter) -> Result<TaskWorker, WorkerError> {
  let api = getter.get::<ApiConn>("api")?;
  Ok(TaskWorker::spawn(move |cancel| async move {
    let _ = api.tick_ms;
    cancel.cancelled().await;
    Ok(())
  }))
}

fn background() -> Manifold {
  Manifold::new(|_cancel, getter| start_background(getter)).with_inputs(["api"])
}

async fn start_leaf() -> Result<ValueWorker<()>, WorkerError> {
  Ok(ValueWorker::new(()))
}

fn leaf() -> Manifold {
  Manifold::new(|_cancel, _getter| start_leaf())
}

/// A worker that takes `delay` to stop after being killed.
fn slow_stopping(delay: Duration) -> Manifold {
  Manifold::new(move |_cancel, _getter| async move {
    Ok(TaskWorker::spawn(move |cancel| async move {
      cancel.cancelled().await;
      tokio::time::sleep(delay).await;
      Ok(())
    }))
  })
}

/// A start that keeps dialing until its attempt is cancelled.
async fn start_dialer(cancel: CancellationToken) -> Result<ValueWorker<()>, WorkerError> {
  tokio::select! {
    _ = cancel.cancelled() => Err(WorkerError::msg("dial cancelled")),
    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(ValueWorker::new(())),
  }
}

fn dialer() -> Manifold {
  Manifold::new(|cancel, _getter| start_dialer(cancel))
}

/// Live and peak worker counts for one component.
#[derive(Default)]
struct LiveWorkers {
  live: AtomicUsize,
  peak: AtomicUsize,
}

/// Only the first worker takes `delay` to stop after being killed.
fn slow_first_stop(delay: Duration, workers: Arc<LiveWorkers>) -> Manifold {
  let spawned = Arc::new(AtomicUsize::new(0));
  Manifold::new(move |_cancel, _getter| {
    let workers = workers.clone();
    let first = spawned.fetch_add(1, Ordering::SeqCst) == 0;
    async move {
      let live = workers.live.fetch_add(1, Ordering::SeqCst) + 1;
      workers.peak.fetch_max(live, Ordering::SeqCst);
      Ok(TaskWorker::spawn(move |cancel| async move {
        cancel.cancelled().await;
        if first {
          tokio::time::sleep(delay).await;
        }
        workers.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
      }))
    }
  })
}

fn channel_engine<I>(
  manifolds: I,
) -> (Engine<ChannelNotifier>, mpsc::UnboundedReceiver<EngineEvent>)
where
  I: IntoIterator<Item = (&'static str, Manifold)>,
{
  let (sender, receiver) = mpsc::unbounded_channel();
  let engine = Engine::with_notifier(config(), manifolds, ChannelNotifier::new(sender))
    .expect("failed to install engine");
  (engine, receiver)
}

async fn wait_until<N, F>(engine: &Engine<N>, check: F) -> Report
where
  N: EngineNotifier + 'static,
  F: Fn(&Report) -> bool,
{
  let deadline = Instant::now() + Duration::from_secs(5);
  loop {
    let report = engine.report();
    if check(&report) {
      return report;
    }
    assert!(Instant::now() < deadline, "condition not reached: {report:#?}");
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
}

fn drain(receiver: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
  let mut events = Vec::new();
  while let Ok(event) = receiver.try_recv() {
    events.push(event);
  }
  events
}

fn started_names(events: &[EngineEvent]) -> Vec<&str> {
  events
    .iter()
    .filter_map(|event| match event {
      EngineEvent::ComponentStarted { name, .. } => Some(name.as_str()),
      _ => None,
    })
    .collect()
}

fn bounced_names(events: &[EngineEvent]) -> Vec<&str> {
  events
    .iter()
    .filter_map(|event| match event {
      EngineEvent::ComponentStopping {
        name,
        reason: StopReason::Bounce,
      } => Some(name.as_str()),
      _ => None,
    })
    .collect()
}

#[tokio::test]
async fn test_starts_in_dependency_order() {
  let not_started = Arc::new(AtomicUsize::new(0));
  let (engine, mut events) = channel_engine([
    ("worker", background()),
    ("api", api(not_started.clone())),
    ("clock", clock(Arc::new(Notify::new()))),
  ]);
  engine.start().unwrap();

  let report = wait_until(&engine, Report::all_started).await;
  assert_eq!(report.state, EngineState::Running);
  for component in report.components.values() {
    assert_eq!(component.generation, 1);
    assert_eq!(component.start_count, 1);
  }

  let api_report = report.component("api").unwrap();
  assert!(api_report.output_type.as_deref().unwrap().ends_with("ApiConn"));
  assert_eq!(api_report.resource_log.len(), 1);
  assert_eq!(api_report.resource_log[0].name, "clock");
  assert!(api_report.resource_log[0].error.is_none());

  engine.kill();
  engine.wait().await.unwrap();

  let events = drain(&mut events);
  assert_eq!(started_names(&events), vec!["clock", "api", "worker"]);

  // Dependents stop before their inputs
  let stopping: Vec<&str> = events
    .iter()
    .filter_map(|event| match event {
      EngineEvent::ComponentStopping { name, .. } => Some(name.as_str()),
      _ => None,
    })
    .collect();
  assert_eq!(stopping, vec!["worker", "api", "clock"]);
  assert_eq!(events.last(), Some(&EngineEvent::EngineStopped { error: None }));

  let report = engine.report();
  assert_eq!(report.state, EngineState::Stopped);
  assert!(
    report
      .components
      .values()
      .all(|c| c.state == ComponentState::Stopped)
  );
  assert_eq!(not_started.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_crash_restarts_component_and_dependents() {
  let crash = Arc::new(Notify::new());
  let not_started = Arc::new(AtomicUsize::new(0));
  let engine = Engine::install(
    config(),
    [
      ("clock", clock(crash.clone())),
      ("api", api(not_started.clone())),
      ("worker", background()),
    ],
  )
  .unwrap();
  engine.start().unwrap();
  wait_until(&engine, Report::all_started).await;

  crash.notify_one();

  let report = wait_until(&engine, |r| {
    r.all_started()
      && r.generation_of("clock") == Some(2)
      && r.generation_of("api") >= Some(2)
      && r.generation_of("worker") >= Some(2)
  })
  .await;
  assert!(report.component("clock").unwrap().error.is_none());

  engine.kill();
  engine.wait().await.unwrap();

  let report = engine.report();
  assert_eq!(report.generation_of("clock"), Some(2));
  assert_eq!(not_started.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_bounce_restarts_chain_in_order() {
  let (engine, mut events) = channel_engine([
    ("a", leaf()),
    ("b", leaf().with_inputs(["a"])),
    ("c", leaf().with_inputs(["b"])),
  ]);
  engine.start().unwrap();
  wait_until(&engine, Report::all_started).await;

  engine.bounce("a").unwrap();
  wait_until(&engine, |r| {
    r.all_started() && ["a", "b", "c"].iter().all(|n| r.generation_of(n) == Some(2))
  })
  .await;

  engine.kill();
  engine.wait().await.unwrap();

  let events = drain(&mut events);
  assert_eq!(bounced_names(&events), vec!["c", "b", "a"]);
  assert_eq!(
    started_names(&events),
    vec!["a", "b", "c", "a", "b", "c"]
  );
}

#[tokio::test]
async fn test_repeated_bounces_collapse_into_one_restart() {
  let (engine, mut events) = channel_engine([
    ("a", leaf()),
    ("b", slow_stopping(Duration::from_millis(100)).with_inputs(["a"])),
  ]);
  engine.start().unwrap();
  wait_until(&engine, Report::all_started).await;

  for _ in 0..5 {
    engine.bounce("a").unwrap();
  }

  wait_until(&engine, |r| {
    r.all_started() && r.generation_of("a") == Some(2) && r.generation_of("b") == Some(2)
  })
  .await;
  tokio::time::sleep(Duration::from_millis(100)).await;

  let report = engine.report();
  assert_eq!(report.generation_of("a"), Some(2));
  assert_eq!(report.generation_of("b"), Some(2));

  engine.kill();
  engine.wait().await.unwrap();

  let events = drain(&mut events);
  assert_eq!(bounced_names(&events), vec!["b", "a"]);
}

async fn start_flaky(attempts: Arc<AtomicUsize>) -> Result<ValueWorker<()>, WorkerError> {
  if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
    return Err(WorkerError::msg("not ready"));
  }
  Ok(ValueWorker::new(()))
}

#[tokio::test]
async fn test_start_failure_is_isolated_and_retried() {
  let attempts = Arc::new(AtomicUsize::new(0));
  let flaky = {
    let attempts = attempts.clone();
    Manifold::new(move |_cancel, _getter| start_flaky(attempts.clone()))
  };
  let (engine, mut events) = channel_engine([
    ("good", leaf()),
    ("flaky", flaky),
    ("user", leaf().with_inputs(["flaky"])),
  ]);
  engine.start().unwrap();

  let report = wait_until(&engine, |r| {
    r.state_of("flaky") == Some(ComponentState::Error)
      && r.state_of("good") == Some(ComponentState::Started)
  })
  .await;
  assert_eq!(
    report.component("flaky").unwrap().error.as_deref(),
    Some("not ready")
  );
  assert_eq!(report.generation_of("user"), Some(0));

  let report = wait_until(&engine, Report::all_started).await;
  let flaky = report.component("flaky").unwrap();
  assert!(flaky.error.is_none());
  assert_eq!(flaky.start_count, 1);
  assert_eq!(attempts.load(Ordering::SeqCst), 3);

  engine.kill();
  engine.wait().await.unwrap();

  let retries: Vec<Option<u64>> = drain(&mut events)
    .into_iter()
    .filter_map(|event| match event {
      EngineEvent::ComponentStartFailed { retry_in_ms, .. } => Some(retry_in_ms),
      _ => None,
    })
    .collect();
  assert_eq!(retries, vec![Some(20), Some(40)]);
}

#[tokio::test]
async fn test_stop_timeout_does_not_block_shutdown() {
  let stubborn = Manifold::new(|_cancel, _getter| async {
    Ok(TaskWorker::spawn(|_cancel| async {
      tokio::time::sleep(Duration::from_secs(30)).await;
      Ok(())
    }))
  });
  let config = EngineConfig {
    stop_grace_ms: 50,
    ..config()
  };
  let engine = Engine::install(config, [("stubborn", stubborn), ("steady", leaf())]).unwrap();
  engine.start().unwrap();
  wait_until(&engine, Report::all_started).await;

  engine.kill();
  let result = tokio::time::timeout(Duration::from_secs(2), engine.wait())
    .await
    .expect("wait blocked on a stuck worker");

  match result {
    Err(ShutdownError::Unstable { failures }) => {
      assert_eq!(failures.len(), 1);
      assert_eq!(failures[0].name, "stubborn");
      assert_eq!(failures[0].kind, FailureKind::StopTimeout);
    }
    other => panic!("unexpected result: {other:?}"),
  }

  let report = engine.report();
  assert!(report.error.as_deref().unwrap().contains("stubborn"));
  assert_eq!(report.state_of("stubborn"), Some(ComponentState::Stopped));
}

#[tokio::test]
async fn test_uninstall_stops_component_permanently() {
  let legacy = Manifold::new(|_cancel, _getter| async {
    if true {
      return Err(WorkerError::msg("feature disabled"));
    }
    Ok(ValueWorker::new(()))
  })
  .with_filter(|err| match err {
    WorkerError::Failed { .. } => WorkerError::Uninstall,
    other => other,
  });

  let (engine, mut events) = channel_engine([
    ("legacy", legacy),
    ("consumer", leaf().with_inputs(["legacy"])),
    ("other", leaf()),
  ]);
  engine.start().unwrap();

  wait_until(&engine, |r| {
    r.component("legacy").is_some_and(|c| c.uninstalled)
      && r.state_of("other") == Some(ComponentState::Started)
  })
  .await;
  tokio::time::sleep(Duration::from_millis(50)).await;

  let report = engine.report();
  let legacy = report.component("legacy").unwrap();
  assert_eq!(legacy.state, ComponentState::Stopped);
  assert_eq!(legacy.start_count, 0);
  assert_eq!(report.state_of("consumer"), Some(ComponentState::Stopped));

  engine.kill();
  engine.wait().await.unwrap();

  let events = drain(&mut events);
  let starts = events
    .iter()
    .filter(|e| matches!(e, EngineEvent::ComponentStarting { name, .. } if name == "legacy"))
    .count();
  assert_eq!(starts, 1);
  assert!(events.contains(&EngineEvent::ComponentUninstalled {
    name: "legacy".to_string()
  }));
}

#[tokio::test]
async fn test_fatal_error_shuts_engine_down() {
  let agent = Manifold::new(|_cancel, _getter| async {
    if true {
      return Err(WorkerError::msg("fatal: model removed"));
    }
    Ok(ValueWorker::new(()))
  });
  let engine = Engine::install(config(), [("agent", agent), ("other", leaf())])
    .unwrap()
    .with_fatal(|err| err.to_string().starts_with("fatal"));
  engine.start().unwrap();

  let result = tokio::time::timeout(Duration::from_secs(2), engine.wait())
    .await
    .expect("fatal error did not stop the engine");

  match result {
    Err(err @ ShutdownError::Fatal { .. }) => {
      assert_eq!(err.component_names(), vec!["agent"]);
      assert!(err.to_string().contains("model removed"));
    }
    other => panic!("unexpected result: {other:?}"),
  }
  assert_eq!(engine.report().state, EngineState::Stopped);
}

#[tokio::test]
async fn test_component_failing_at_shutdown_is_reported() {
  let broken = Manifold::new(|_cancel, _getter| async {
    if true {
      return Err(WorkerError::msg("connection refused"));
    }
    Ok(ValueWorker::new(()))
  });
  let engine = Engine::install(config(), [("broken", broken)]).unwrap();
  engine.start().unwrap();
  wait_until(&engine, |r| {
    r.state_of("broken") == Some(ComponentState::Error)
  })
  .await;

  engine.kill();
  match engine.wait().await {
    Err(ShutdownError::Unstable { failures }) => {
      assert_eq!(failures[0].name, "broken");
      assert_eq!(failures[0].kind, FailureKind::StartFailed);
      assert_eq!(failures[0].error, "connection refused");
    }
    other => panic!("unexpected result: {other:?}"),
  }
}

#[tokio::test]
async fn test_crashed_component_left_failing_is_reported() {
  let crash = Arc::new(Notify::new());
  let config = EngineConfig {
    error_delay_ms: 10_000,
    max_delay_ms: 20_000,
    ..config()
  };
  let engine = Engine::install(config, [("clock", clock(crash.clone()))]).unwrap();
  engine.start().unwrap();
  wait_until(&engine, Report::all_started).await;

  crash.notify_one();
  wait_until(&engine, |r| r.state_of("clock") == Some(ComponentState::Error)).await;

  engine.kill();
  match engine.wait().await {
    Err(ShutdownError::Unstable { failures }) => {
      assert_eq!(failures.len(), 1);
      assert_eq!(failures[0].name, "clock");
      assert_eq!(failures[0].kind, FailureKind::Crashed);
      assert_eq!(failures[0].error, "clock crashed");
    }
    other => panic!("unexpected result: {other:?}"),
  }
}

#[tokio::test]
async fn test_start_cancelled_by_shutdown_stops_cleanly() {
  let (engine, mut events) = channel_engine([("dialer", dialer()), ("steady", leaf())]);
  // Any failure that reached the fatal check would turn into an error
  let engine = engine.with_fatal(|_| true);
  engine.start().unwrap();
  wait_until(&engine, |r| {
    r.state_of("dialer") == Some(ComponentState::Starting)
      && r.state_of("steady") == Some(ComponentState::Started)
  })
  .await;

  engine.kill();
  tokio::time::timeout(Duration::from_secs(2), engine.wait())
    .await
    .expect("shutdown blocked on a cancelled start")
    .unwrap();

  let report = engine.report();
  let dialer = report.component("dialer").unwrap();
  assert_eq!(dialer.state, ComponentState::Stopped);
  assert!(dialer.error.is_none());
  assert!(report.error.is_none());

  let events = drain(&mut events);
  assert!(events.contains(&EngineEvent::ComponentStopped {
    name: "dialer".to_string(),
    error: None,
  }));
  assert!(
    !events
      .iter()
      .any(|e| matches!(e, EngineEvent::ComponentStartFailed { .. }))
  );
}

#[tokio::test]
async fn test_bounce_cancels_dependent_start_in_flight() {
  let (engine, mut events) = channel_engine([("a", leaf()), ("b", dialer().with_inputs(["a"]))]);
  engine.start().unwrap();
  wait_until(&engine, |r| {
    r.state_of("a") == Some(ComponentState::Started)
      && r.state_of("b") == Some(ComponentState::Starting)
  })
  .await;

  engine.bounce("a").unwrap();
  let report = tokio::time::timeout(
    Duration::from_secs(2),
    wait_until(&engine, |r| {
      r.state_of("a") == Some(ComponentState::Started)
        && r.generation_of("a") == Some(2)
        && r.state_of("b") == Some(ComponentState::Starting)
    }),
  )
  .await
  .expect("input restart waited on a dependent's start");
  assert!(report.component("b").unwrap().error.is_none());

  engine.kill();
  engine.wait().await.unwrap();

  let dialer_starts = drain(&mut events)
    .iter()
    .filter(|e| matches!(e, EngineEvent::ComponentStarting { name, .. } if name == "b"))
    .count();
  assert_eq!(dialer_starts, 2);
}

#[tokio::test]
async fn test_stop_timeout_while_running_keeps_one_worker() {
  let workers = Arc::new(LiveWorkers::default());
  let stop_delay = Duration::from_millis(300);
  let config = EngineConfig {
    stop_grace_ms: 50,
    ..config()
  };
  let engine = Engine::install(
    config,
    [
      ("a", leaf()),
      ("b", slow_first_stop(stop_delay, workers.clone()).with_inputs(["a"])),
    ],
  )
  .unwrap();
  engine.start().unwrap();
  wait_until(&engine, Report::all_started).await;

  let bounced = Instant::now();
  engine.bounce("a").unwrap();

  // The input is released once the stuck worker is abandoned
  let report = wait_until(&engine, |r| r.generation_of("a") == Some(2)).await;
  assert_eq!(report.generation_of("b"), Some(1));

  // The replacement only starts after the abandoned worker exits
  wait_until(&engine, |r| {
    r.state_of("b") == Some(ComponentState::Started) && r.generation_of("b") == Some(2)
  })
  .await;
  assert!(bounced.elapsed() >= stop_delay);
  assert_eq!(workers.peak.load(Ordering::SeqCst), 1);

  engine.kill();
  match engine.wait().await {
    Err(ShutdownError::Unstable { failures }) => {
      assert_eq!(failures.len(), 1);
      assert_eq!(failures[0].name, "b");
      assert_eq!(failures[0].kind, FailureKind::StopTimeout);
    }
    other => panic!("unexpected result: {other:?}"),
  }
  assert_eq!(workers.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_getter_expires_after_start() {
  let leaked: Arc<Mutex<Option<Getter>>> = Arc::new(Mutex::new(None));
  let holder = {
    let leaked = leaked.clone();
    Manifold::new(move |_cancel, getter: Getter| {
      *leaked.lock().unwrap() = Some(getter);
      start_leaf()
    })
    .with_inputs(["clock"])
  };
  let engine = Engine::install(
    config(),
    [("clock", clock(Arc::new(Notify::new()))), ("holder", holder)],
  )
  .unwrap();
  engine.start().unwrap();
  wait_until(&engine, Report::all_started).await;

  let getter = leaked.lock().unwrap().take().unwrap();
  assert!(matches!(
    getter.get::<Clock>("clock"),
    Err(DependencyError::Expired { .. })
  ));

  engine.kill();
  engine.wait().await.unwrap();
}

#[tokio::test]
async fn test_bounce_after_shutdown_is_rejected() {
  let engine = Engine::install(config(), [("a", leaf())]).unwrap();
  engine.start().unwrap();
  engine.kill();
  engine.wait().await.unwrap();

  assert!(engine.bounce("a").is_err());
}

#[tokio::test]
async fn test_engine_runs_as_component_of_another_engine() {
  async fn start_inner() -> Result<Engine, WorkerError> {
    let engine = Engine::install(config(), [("clock", clock(Arc::new(Notify::new())))])
      .map_err(WorkerError::failed)?;
    engine.start().map_err(WorkerError::failed)?;
    Ok(engine)
  }
  let inner = Manifold::new(|_cancel, _getter| start_inner())
    .with_output(Output::new(|engine: &Engine| engine.report()));

  async fn start_observer(getter: Getter) -> Result<ValueWorker<Report>, WorkerError> {
    let report = getter.get::<Report>("inner")?;
    Ok(ValueWorker::new(report))
  }
  let observer =
    Manifold::new(|_cancel, getter| start_observer(getter)).with_inputs(["inner"]);

  let engine = Engine::install(config(), [("inner", inner), ("observer", observer)]).unwrap();
  engine.start().unwrap();
  let report = wait_until(&engine, Report::all_started).await;

  let inner = report.component("inner").unwrap();
  assert!(inner.output_type.as_deref().unwrap().ends_with("Report"));

  engine.kill();
  tokio::time::timeout(Duration::from_secs(2), engine.wait())
    .await
    .expect("nested engine did not stop")
    .unwrap();
}

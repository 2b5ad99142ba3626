mod demo;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use keel_engine::{ChannelNotifier, Engine, EngineConfig, Graph};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::demo::CrashSwitches;

/// Keel - a dependency engine for long-running agent components
#[derive(Parser)]
#[command(name = "keel")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the engine config file (default: ~/.keel/engine.json, if present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Log at debug level (RUST_LOG takes precedence)
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the demo agent, then print its report as JSON
  Run {
    /// How long to run before shutting down
    #[arg(long, default_value_t = 2_000)]
    duration_ms: u64,

    /// Make a component's worker fail partway through the run
    #[arg(long)]
    crash: Option<String>,

    /// When to trigger the crash
    #[arg(long, default_value_t = 500)]
    crash_after_ms: u64,

    /// Tick interval of the demo components
    #[arg(long, default_value_t = 250, value_parser = clap::value_parser!(u64).range(1..))]
    tick_ms: u64,

    /// Endpoint the demo API component pretends to connect to
    #[arg(long, default_value = "http://localhost:8080")]
    endpoint: String,
  },

  /// Print the demo graph in start order
  Graph,

  /// Print the effective engine configuration
  Config,
}

struct RunOptions {
  duration: Duration,
  crash: Option<(String, Duration)>,
  tick: Duration,
  endpoint: String,
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let config = load_config(cli.config)?;

  match cli.command {
    Some(Commands::Run {
      duration_ms,
      crash,
      crash_after_ms,
      tick_ms,
      endpoint,
    }) => {
      let options = RunOptions {
        duration: Duration::from_millis(duration_ms),
        crash: crash.map(|name| (name, Duration::from_millis(crash_after_ms))),
        tick: Duration::from_millis(tick_ms),
        endpoint,
      };
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(async { run_demo(config, options).await })?;
    }
    Some(Commands::Graph) => print_graph()?,
    Some(Commands::Config) => {
      println!("{}", serde_json::to_string_pretty(&config)?);
    }
    None => {
      println!("keel - use --help to see available commands");
    }
  }

  Ok(())
}

fn init_tracing(verbose: bool) {
  let default = if verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .with_writer(std::io::stderr)
    .init();
}

fn default_config_path() -> Option<PathBuf> {
  dirs::home_dir().map(|home| home.join(".keel").join("engine.json"))
}

/// Load the explicit config file, else the default one if it exists, else defaults.
fn load_config(path: Option<PathBuf>) -> Result<EngineConfig> {
  let path = match path.or_else(|| default_config_path().filter(|p| p.exists())) {
    Some(path) => path,
    None => return Ok(EngineConfig::default()),
  };

  EngineConfig::from_path(&path)
    .with_context(|| format!("failed to load config: {}", path.display()))
}

fn print_graph() -> Result<()> {
  let manifolds = demo::manifolds(
    Duration::from_millis(250),
    "http://localhost:8080",
    &CrashSwitches::new(),
  );
  let graph = Graph::new(
    manifolds
      .iter()
      .map(|(name, manifold)| (*name, manifold.inputs().to_vec())),
  )
  .context("invalid demo graph")?;

  for name in graph.start_order() {
    let inputs = graph.inputs(name);
    if inputs.is_empty() {
      println!("{name}");
    } else {
      println!("{name} <- {}", inputs.join(", "));
    }
  }
  Ok(())
}

async fn run_demo(config: EngineConfig, options: RunOptions) -> Result<()> {
  if let Some((name, _)) = &options.crash {
    if !demo::COMPONENTS.contains(&name.as_str()) {
      bail!(
        "unknown component '{name}', expected one of: {}",
        demo::COMPONENTS.join(", ")
      );
    }
  }

  let switches = CrashSwitches::new();
  let (sender, mut events) = mpsc::unbounded_channel();
  let engine = Engine::with_notifier(
    config,
    demo::manifolds(options.tick, &options.endpoint, &switches),
    ChannelNotifier::new(sender),
  )
  .context("failed to install demo graph")?;

  tokio::spawn(async move {
    while let Some(event) = events.recv().await {
      debug!(?event, "engine_event");
    }
  });

  engine.start().context("failed to start engine")?;
  info!(duration_ms = options.duration.as_millis() as u64, "demo_running");

  let mut remaining = options.duration;
  if let Some((name, after)) = &options.crash {
    let after = (*after).min(options.duration);
    tokio::time::sleep(after).await;
    warn!(component = %name, "crashing_component");
    switches.trip(name);
    remaining = options.duration.saturating_sub(after);
  }

  tokio::select! {
    _ = tokio::time::sleep(remaining) => {}
    _ = tokio::signal::ctrl_c() => info!("interrupted"),
  }

  let report = engine.report();
  engine.kill();
  let result = engine.wait().await;

  println!("{}", serde_json::to_string_pretty(&report)?);
  result.context("engine did not shut down cleanly")
}

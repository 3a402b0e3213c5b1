// SPDX-License-Identifier: AGPL-3.0-only

mod listener;

pub mod config;
pub mod connections;
pub mod telemetry;

pub use listener::{WsListener, WsTransport};

use std::env;
use std::fs;
use std::sync::Arc;

use rlimit::Resource;
use tokio::signal;
use tracing::info;

use crate::config::Config;
use crate::connections::{access_logging, ConnectionRegistry, MiddlewareStack};

/// The server version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runs the tether server until a stop signal arrives.
///
/// This is the main entry point: it loads the configuration, initializes
/// telemetry, creates one connection manager per configured channel, starts
/// the WebSocket listener and shuts everything down gracefully on
/// SIGTERM/ctrl-c.
///
/// # Arguments
///
/// * `config_file` - Optional path to the TOML configuration file
/// * `worker_threads` - The number of worker threads the runtime was built
///   with, logged for operators
///
/// # Returns
///
/// Returns `Ok(())` on successful shutdown, or an error if any step fails
/// during startup or shutdown.
pub async fn run(config_file: Option<String>, worker_threads: usize) -> anyhow::Result<()> {
  let Config { telemetry, listener, connections, channels } = load_config(config_file)?;

  telemetry::init(telemetry)?;

  info!(version = VERSION, worker_threads = worker_threads, "🚀 tether server is starting...");

  // Size the file descriptor limit to the configured connection capacity.
  let capacity = connections.shard_count.saturating_mul(connections.initial_shard_capacity);
  set_file_descriptor_limit(capacity as u64)?;

  let registry = ConnectionRegistry::new((&connections).into());
  registry.initialize(channels.iter().map(|channel| channel.as_str()))?;

  let stack = Arc::new(MiddlewareStack::new());
  stack.use_middleware(access_logging());

  let mut ws_listener = WsListener::new(listener, &connections, registry.clone(), stack);
  ws_listener.bootstrap().await?;

  info!("waiting for stop signal... (press Ctrl+C to stop the server)");
  wait_for_stop_signal().await?;
  info!("received stop signal... gracefully shutting down...");

  ws_listener.shutdown().await?;
  registry.close().await;

  info!("tether server stopped");

  Ok(())
}

/// Sets up a custom panic hook that prints debugging context before the
/// process exits.
///
/// This should be called early in the application's initialization so all
/// panics are reported with it.
pub fn setup_panic_hook() {
  let orig_hook = std::panic::take_hook();
  std::panic::set_hook(Box::new(move |panic_info| {
    eprintln!("\ntether server has panicked. This is a bug. Please report it");
    eprintln!("at https://github.com/tether-io/tether/issues/new, including");
    eprintln!("the reproduction steps and a backtrace (re-run with the");
    eprintln!("RUST_BACKTRACE=1 env var set).");
    eprintln!();
    eprintln!("Platform: {} {}", env::consts::OS, env::consts::ARCH);
    eprintln!("Version: {}", VERSION);
    eprintln!("Args: {:?}", env::args().collect::<Vec<_>>());
    eprintln!();

    orig_hook(panic_info);

    std::process::exit(1);
  }));
}

fn load_config(config_file: Option<String>) -> anyhow::Result<Config> {
  let toml_file = config_file.unwrap_or("config.toml".to_string());

  let config: Config = match fs::read_to_string(&toml_file) {
    Ok(config_content) => toml::from_str(&config_content)
      .map_err(|err| anyhow::anyhow!("failed to parse config file: {}, {}", toml_file, err))?,
    Err(_) => Config::default(),
  };

  Ok(config)
}

async fn wait_for_stop_signal() -> anyhow::Result<()> {
  let mut sig_term = signal::unix::signal(signal::unix::SignalKind::terminate())?;

  tokio::select! {
    _ = signal::ctrl_c() => Ok(()),
    _ = sig_term.recv() => {
      Ok(())
    },
  }
}

fn set_file_descriptor_limit(capacity: u64) -> anyhow::Result<()> {
  // Desired fd limit: connection capacity + overhead (25% of it) + 32 for
  // internal usage.
  let overhead = capacity / 4;
  let desired_fd_limit = capacity + overhead + 32;

  let (soft, hard) = rlimit::getrlimit(Resource::NOFILE)?;

  let new_soft_limit = std::cmp::min(desired_fd_limit, hard);

  rlimit::setrlimit(Resource::NOFILE, new_soft_limit, hard)
    .map_err(|err| anyhow::anyhow!("failed to set file descriptor limit: {}", err))?;

  info!(new_soft_limit, soft_limit = soft, hard_limit = hard, "set file descriptor limit");

  Ok(())
}

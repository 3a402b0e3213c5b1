// SPDX-License-Identifier: AGPL-3.0-only

pub mod metrics;

use std::io::stdout;
use std::net::SocketAddr;

use anyhow::anyhow;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use tracing::metadata::LevelFilter;
use tracing_subscriber::fmt;

/// Configuration for the telemetry system
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
  /// the logging configuration
  #[serde(default)]
  logging: LoggingConfig,

  /// the configuration for metrics
  #[serde(default)]
  pub metrics: MetricsConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
  /// whether metrics are enabled
  #[serde(default)]
  pub enabled: bool,

  /// the port to expose Prometheus metrics on
  #[serde(default = "default_metrics_port")]
  pub port: u16,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self { enabled: false, port: default_metrics_port() }
  }
}

fn default_metrics_port() -> u16 {
  9090
}

/// Configuration for the logging system
#[derive(Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
  /// the logging level
  #[serde(default = "default_level")]
  level: String,

  /// the logging format
  #[serde(default = "default_format")]
  format: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self { level: default_level(), format: default_format() }
  }
}

fn default_level() -> String {
  "info".to_string()
}

fn default_format() -> String {
  "text".to_string()
}

/// Initializes the telemetry system based on the provided configuration.
///
/// # Arguments
/// * `config` - The configuration for the telemetry system
///
/// # Returns
/// An error if the telemetry system could not be initialized
pub fn init(config: Config) -> anyhow::Result<()> {
  let level_filter = match config.logging.level.to_lowercase().as_str() {
    "trace" => LevelFilter::TRACE,
    "debug" => LevelFilter::DEBUG,
    "info" => LevelFilter::INFO,
    "warn" => LevelFilter::WARN,
    "error" => LevelFilter::ERROR,
    _ => return Err(anyhow!("invalid logging level: {}", config.logging.level)),
  };

  match config.logging.format.as_str() {
    "json" => init_json_logger(level_filter),
    "text" => init_text_logger(level_filter),
    _ => return Err(anyhow!("invalid logging format: {}", config.logging.format)),
  };

  init_metrics(config.metrics)?;

  Ok(())
}

fn init_json_logger(level_filter: LevelFilter) {
  use tracing_subscriber::prelude::*;

  let fmt_layer =
    fmt::Layer::new().json().with_target(false).with_timer(fmt::time::UtcTime::rfc_3339()).with_writer(stdout);

  tracing_subscriber::registry().with(fmt_layer.with_filter(level_filter)).init();
}

fn init_text_logger(level_filter: LevelFilter) {
  use tracing_subscriber::prelude::*;

  let fmt_layer = fmt::Layer::new()
    .with_target(false)
    .with_file(false)
    .with_line_number(false)
    .with_writer(stdout)
    .compact();

  tracing_subscriber::registry().with(fmt_layer.with_filter(level_filter)).init();
}

fn init_metrics(config: MetricsConfig) -> anyhow::Result<()> {
  if !config.enabled {
    return Ok(());
  }

  let bind_address: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;

  PrometheusBuilder::new().with_http_listener(bind_address).install()?;

  metrics::describe_metrics();

  Ok(())
}

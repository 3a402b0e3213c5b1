// SPDX-License-Identifier: AGPL-3.0-only

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::connections::ConnectionConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListenerConfig {
  /// The address to bind to.
  #[serde(default = "default_bind_address")]
  pub bind_address: String,

  /// The port to bind to.
  #[serde(default = "default_port")]
  pub port: u16,
}

impl Default for ListenerConfig {
  fn default() -> Self {
    Self { bind_address: default_bind_address(), port: default_port() }
  }
}

fn default_bind_address() -> String {
  "0.0.0.0".to_string()
}

fn default_port() -> u16 {
  22722
}

/// Configuration for the connection engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionsSection {
  /// The deadline for a single transport write.
  #[serde(default = "default_write_timeout", with = "humantime_serde")]
  pub write_timeout: Duration,

  /// The deadline for a single transport read. Also bounds how long an
  /// idle connection may stay silent.
  #[serde(default = "default_read_timeout", with = "humantime_serde")]
  pub read_timeout: Duration,

  /// How long a sender may wait for the write loop to accept a message.
  #[serde(default = "default_request_timeout", with = "humantime_serde")]
  pub request_timeout: Duration,

  /// How long a requester may wait for the correlated response.
  #[serde(default = "default_response_timeout", with = "humantime_serde")]
  pub response_timeout: Duration,

  /// The read buffer size handed to the WebSocket handshake.
  #[serde(default = "default_read_buffer_size")]
  pub read_buffer_size: usize,

  /// The write buffer size handed to the WebSocket handshake.
  #[serde(default = "default_write_buffer_size")]
  pub write_buffer_size: usize,

  /// The capacity of each connection's outbound write queue.
  #[serde(default = "default_request_queue_size")]
  pub request_queue_size: usize,

  /// The number of lock-partitioned shards per connection manager.
  #[serde(default = "default_shard_count")]
  pub shard_count: usize,

  /// The initial connection capacity of each shard.
  #[serde(default = "default_initial_shard_capacity")]
  pub initial_shard_capacity: usize,
}

impl Default for ConnectionsSection {
  fn default() -> Self {
    Self {
      write_timeout: default_write_timeout(),
      read_timeout: default_read_timeout(),
      request_timeout: default_request_timeout(),
      response_timeout: default_response_timeout(),
      read_buffer_size: default_read_buffer_size(),
      write_buffer_size: default_write_buffer_size(),
      request_queue_size: default_request_queue_size(),
      shard_count: default_shard_count(),
      initial_shard_capacity: default_initial_shard_capacity(),
    }
  }
}

fn default_write_timeout() -> Duration {
  Duration::from_secs(2)
}

fn default_read_timeout() -> Duration {
  Duration::from_secs(300)
}

fn default_request_timeout() -> Duration {
  Duration::from_secs(1)
}

fn default_response_timeout() -> Duration {
  Duration::from_secs(5)
}

fn default_read_buffer_size() -> usize {
  1024
}

fn default_write_buffer_size() -> usize {
  1024
}

fn default_request_queue_size() -> usize {
  8
}

fn default_shard_count() -> usize {
  32
}

fn default_initial_shard_capacity() -> usize {
  256
}

impl From<&ConnectionsSection> for ConnectionConfig {
  fn from(section: &ConnectionsSection) -> Self {
    ConnectionConfig {
      write_timeout: section.write_timeout,
      read_timeout: section.read_timeout,
      request_timeout: section.request_timeout,
      response_timeout: section.response_timeout,
      request_queue_size: section.request_queue_size,
      shard_count: section.shard_count,
      initial_shard_capacity: section.initial_shard_capacity,
    }
  }
}

/// The root server configuration.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub telemetry: crate::telemetry::Config,

  #[serde(default)]
  pub listener: ListenerConfig,

  #[serde(default)]
  pub connections: ConnectionsSection,

  /// The logical channels to initialize a connection manager for.
  #[serde(default = "default_channels")]
  pub channels: Vec<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      telemetry: Default::default(),
      listener: ListenerConfig::default(),
      connections: ConnectionsSection::default(),
      channels: default_channels(),
    }
  }
}

fn default_channels() -> Vec<String> {
  vec!["default".to_string()]
}

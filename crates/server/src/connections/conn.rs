// SPDX-License-Identifier: AGPL-3.0-only

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use tether_protocol::Message;
use tether_util::string_atom::StringAtom;

use crate::connections::errors::ConnError;
use crate::connections::websocket::WebsocketConnection;

/// Opaque key/value bag supplied by the transport adapter.
pub type Metadata = HashMap<StringAtom, StringAtom>;

/// The fully chained message handler supplied by the caller.
///
/// Handlers are invoked with the originating connection, the message being
/// delivered (absent for pure error notifications) and the error, if any.
pub type MessageHandler = Arc<dyn Fn(&dyn Connection, Option<&Message>, Option<&ConnError>) + Send + Sync>;

/// A single unit read from or written to a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
  /// An opaque message body carrying a wire-encoded `Message`.
  Binary(Vec<u8>),

  /// The transport-level close signal.
  Close,
}

/// The reading half of a transport.
///
/// Deadlines are applied by the connection's read loop; implementations only
/// need to block until a frame arrives or the transport fails.
#[async_trait]
pub trait TransportReader: Send + 'static {
  async fn read_message(&mut self) -> anyhow::Result<Frame>;
}

/// The writing half of a transport.
#[async_trait]
pub trait TransportWriter: Send + 'static {
  async fn write_message(&mut self, frame: Frame) -> anyhow::Result<()>;

  /// Closes the underlying socket.
  async fn close(&mut self) -> anyhow::Result<()>;
}

/// A bidirectional transport, split into its two halves before the I/O
/// loops start. Only the write loop ever touches the writer, which keeps
/// writes to a single socket totally ordered.
pub trait Transport: Send + 'static {
  fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>);
}

/// Tunables consumed by the connection engine. Assembled from the server
/// configuration by the caller; every blocking wait in the engine is
/// bounded by one of these durations.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
  /// The deadline for a single transport write.
  pub write_timeout: Duration,

  /// The deadline for a single transport read.
  pub read_timeout: Duration,

  /// How long a sender may wait for the write loop to accept a message.
  pub request_timeout: Duration,

  /// How long a requester may wait for the correlated response.
  pub response_timeout: Duration,

  /// The capacity of the outbound write queue.
  pub request_queue_size: usize,

  /// The number of lock-partitioned shards per manager.
  pub shard_count: usize,

  /// The initial connection capacity of each shard.
  pub initial_shard_capacity: usize,
}

impl Default for ConnectionConfig {
  fn default() -> Self {
    Self {
      write_timeout: Duration::from_secs(2),
      read_timeout: Duration::from_secs(300),
      request_timeout: Duration::from_secs(1),
      response_timeout: Duration::from_secs(5),
      request_queue_size: 8,
      shard_count: 32,
      initial_shard_capacity: 256,
    }
  }
}

/// The capability set every transport-specific connection provides.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
  /// The key under which the connection is registered in its manager.
  fn identifier(&self) -> StringAtom;

  /// Distinguishes successive connections reusing the same identifier.
  fn request_id(&self) -> u64;

  fn created_at(&self) -> SystemTime;

  /// The closing time, once the connection has closed.
  fn closed_at(&self) -> Option<SystemTime>;

  /// The last time the peer showed signs of life.
  fn last_pinged_at(&self) -> SystemTime;

  fn closed(&self) -> bool;

  fn connection_type(&self) -> &'static str;

  fn metadata(&self) -> &Metadata;

  fn message_handler(&self) -> MessageHandler;

  /// Sends a fire-and-forget payload to the peer.
  ///
  /// Fails with `ConnError::Closed` on a closed connection; never panics
  /// and never blocks beyond the configured timeouts.
  async fn send(&self, payload: Vec<u8>) -> Result<(), ConnError>;

  /// Closes the connection. Idempotent: the first caller wins and every
  /// later call is a no-op.
  fn close(&self);

  /// Blocks until the connection's I/O loops have exited.
  async fn wait(&self);

  /// Downcast hook for request-capable transports.
  fn as_websocket(&self) -> Option<&WebsocketConnection> {
    None
  }
}

// SPDX-License-Identifier: AGPL-3.0-only

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{info, trace};

use tether_util::string_atom::StringAtom;

use crate::connections::conn::{Connection, ConnectionConfig, Frame, Metadata, MessageHandler, Transport};
use crate::connections::errors::ConnError;
use crate::connections::http::{HttpConnection, HttpConnectionKind};
use crate::connections::shard::Shard;
use crate::connections::websocket::WebsocketConnection;

/// The set of live connections for one logical channel, partitioned into
/// independently locked shards.
///
/// An identifier maps to at most one live connection per manager at any
/// instant; registering a duplicate closes the existing connection before
/// the replacement starts. A closed manager refuses registrations and
/// drains every live connection.
pub struct ConnectionManager {
  id: StringAtom,
  closed: AtomicBool,
  config: Arc<ConnectionConfig>,
  shards: Vec<Arc<Shard>>,

  /// Monotonic per-manager counter stamping each connection incarnation.
  next_request_id: AtomicU64,
}

// ===== impl ConnectionManager =====

impl ConnectionManager {
  pub(crate) fn new(id: StringAtom, config: Arc<ConnectionConfig>) -> Arc<Self> {
    let shard_count = config.shard_count.max(1);
    let mut shards = Vec::with_capacity(shard_count);
    for _ in 0..shard_count {
      shards.push(Shard::with_capacity(config.initial_shard_capacity));
    }

    Arc::new(Self { id, closed: AtomicBool::new(false), config, shards, next_request_id: AtomicU64::new(1) })
  }

  pub fn id(&self) -> StringAtom {
    self.id.clone()
  }

  pub fn closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Builds, registers and starts a WebSocket connection.
  ///
  /// On a closed manager the raw transport is closed without registering.
  /// A live connection under the same identifier is atomically swapped out
  /// and closed before the new one starts (last writer wins).
  pub async fn new_websocket_connection(
    &self,
    identifier: impl Into<StringAtom>,
    transport: Box<dyn Transport>,
    handler: MessageHandler,
    metadata: Metadata,
  ) -> Result<Arc<WebsocketConnection>, ConnError> {
    let identifier = identifier.into();

    if self.closed() {
      Self::discard_transport(transport).await;
      return Err(ConnError::ManagerClosed);
    }

    let shard = self.shard_for(&identifier);
    let conn = WebsocketConnection::new(
      identifier.clone(),
      self.next_request_id(),
      handler,
      metadata,
      Arc::downgrade(shard),
      self.config.clone(),
    );

    let replaced = match shard.register(conn.clone()) {
      Ok(replaced) => replaced,
      Err(err) => {
        Self::discard_transport(transport).await;
        return Err(err);
      },
    };

    if let Some(superseded) = replaced {
      trace!(manager = %self.id, identifier = %identifier, "closing superseded connection");
      superseded.close();
    }

    conn.start(transport);

    trace!(manager = %self.id, identifier = %identifier, connection_count = self.count(), "connection registered");

    Ok(conn)
  }

  /// Builds and starts an unregistered push connection: the request body
  /// was already consumed by the adapter, so there is nothing to register
  /// or look up afterwards.
  pub fn new_push_connection(
    &self,
    identifier: impl Into<StringAtom>,
    handler: MessageHandler,
    metadata: Metadata,
  ) -> Result<Arc<HttpConnection>, ConnError> {
    if self.closed() {
      return Err(ConnError::ManagerClosed);
    }

    let conn = Arc::new(HttpConnection::new(
      identifier.into(),
      self.next_request_id(),
      HttpConnectionKind::Push,
      handler,
      metadata,
      None,
      None,
    ));
    conn.start();

    Ok(conn)
  }

  /// Builds, registers and starts a long-poll connection, returning the
  /// receiving side of its single-slot rendezvous for the adapter to await.
  pub fn new_poll_connection(
    &self,
    identifier: impl Into<StringAtom>,
    handler: MessageHandler,
    metadata: Metadata,
  ) -> Result<(Arc<HttpConnection>, oneshot::Receiver<Vec<u8>>), ConnError> {
    let identifier = identifier.into();

    if self.closed() {
      return Err(ConnError::ManagerClosed);
    }

    let (slot_tx, slot_rx) = oneshot::channel();
    let shard = self.shard_for(&identifier);
    let conn = Arc::new(HttpConnection::new(
      identifier.clone(),
      self.next_request_id(),
      HttpConnectionKind::Poll,
      handler,
      metadata,
      Some(Arc::downgrade(shard)),
      Some(slot_tx),
    ));

    let replaced = shard.register(conn.clone())?;
    if let Some(superseded) = replaced {
      trace!(manager = %self.id, identifier = %identifier, "closing superseded connection");
      superseded.close();
    }

    conn.start();

    Ok((conn, slot_rx))
  }

  pub fn find_connection(&self, identifier: &str) -> Option<Arc<dyn Connection>> {
    let identifier = StringAtom::from(identifier);
    self.shard_for(&identifier).find(&identifier)
  }

  pub fn count(&self) -> usize {
    self.shards.iter().map(|shard| shard.count()).sum()
  }

  /// Returns up to `page_size` connections whose identifiers sort strictly
  /// after `last_id`, in identifier order. An empty `last_id` starts the
  /// scan from the beginning.
  pub fn scan(&self, last_id: &str, page_size: usize) -> Vec<Arc<dyn Connection>> {
    let mut conns = Vec::new();
    for shard in &self.shards {
      shard.collect_after(last_id, &mut conns);
    }
    conns.sort_by(|a, b| a.identifier().as_ref().cmp(b.identifier().as_ref()));
    conns.truncate(page_size);
    conns
  }

  /// Latches the manager closed, then closes every shard concurrently,
  /// each shard closing and joining its connections concurrently. Returns
  /// once every connection has fully drained.
  pub async fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);

    let connection_count = self.count();

    let mut tasks = Vec::with_capacity(self.shards.len());
    for shard in &self.shards {
      let shard = shard.clone();
      tasks.push(tokio::spawn(async move { shard.close().await }));
    }
    for task in tasks {
      let _ = task.await;
    }

    info!(manager = %self.id, connection_count = connection_count, "connection manager closed");
  }

  fn next_request_id(&self) -> u64 {
    self.next_request_id.fetch_add(1, Ordering::Relaxed)
  }

  fn shard_for(&self, identifier: &StringAtom) -> &Arc<Shard> {
    let mut hasher = DefaultHasher::new();
    identifier.hash(&mut hasher);
    &self.shards[(hasher.finish() as usize) % self.shards.len()]
  }

  async fn discard_transport(transport: Box<dyn Transport>) {
    let (_, mut writer) = transport.split();
    let _ = writer.write_message(Frame::Close).await;
    let _ = writer.close().await;
  }
}

impl std::fmt::Debug for ConnectionManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectionManager")
      .field("id", &self.id)
      .field("closed", &self.closed())
      .field("connection_count", &self.count())
      .finish()
  }
}

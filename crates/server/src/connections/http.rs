// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex as PlMutex;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use tether_protocol::Message;
use tether_util::string_atom::StringAtom;

use crate::connections::conn::{Connection, Metadata, MessageHandler};
use crate::connections::errors::ConnError;
use crate::connections::shard::Shard;

/// The flavor of an HTTP connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HttpConnectionKind {
  /// The payload was fully read by the adapter; sending is a no-op.
  Push,

  /// A long-poll cycle: one send fulfills the poll and closes the
  /// connection.
  Poll,
}

/// A single HTTP request/response or polling cycle viewed as a connection.
///
/// A poll connection carries a single-slot rendezvous the adapter awaits to
/// fulfill the long-poll response; exactly one send completes it. Start and
/// close synthesize Connect/Disconnect so the handler chain behaves the
/// same as for WebSocket connections.
pub struct HttpConnection {
  identifier: StringAtom,
  request_id: u64,
  kind: HttpConnectionKind,
  created_at: SystemTime,
  closed_at: PlMutex<Option<SystemTime>>,
  closed: AtomicBool,
  metadata: Metadata,
  handler: MessageHandler,

  /// Weak handle back to the owning shard; `None` for unregistered push
  /// connections.
  shard: Option<Weak<Shard>>,

  /// The poll rendezvous slot; `None` for push connections and after the
  /// slot has been consumed.
  slot: PlMutex<Option<oneshot::Sender<Vec<u8>>>>,
}

// ===== impl HttpConnection =====

impl HttpConnection {
  pub(crate) fn new(
    identifier: StringAtom,
    request_id: u64,
    kind: HttpConnectionKind,
    handler: MessageHandler,
    metadata: Metadata,
    shard: Option<Weak<Shard>>,
    slot: Option<oneshot::Sender<Vec<u8>>>,
  ) -> Self {
    Self {
      identifier,
      request_id,
      kind,
      created_at: SystemTime::now(),
      closed_at: PlMutex::new(None),
      closed: AtomicBool::new(false),
      metadata,
      handler,
      shard,
      slot: PlMutex::new(slot),
    }
  }

  pub fn kind(&self) -> HttpConnectionKind {
    self.kind
  }

  /// Synthesizes the Connect message to the handler.
  pub(crate) fn start(&self) {
    trace!(identifier = %self.identifier, kind = ?self.kind, "http connection started");
    self.dispatch(Some(&Message::connect()), None);
  }

  /// Delivers a payload to the peer.
  ///
  /// On a poll connection the payload fulfills the rendezvous slot and the
  /// connection closes immediately; a second send fails with `Closed`. On a
  /// push connection the adapter already consumed the request body, so the
  /// send is a no-op while the connection is open.
  pub fn send(&self, payload: Vec<u8>) -> Result<(), ConnError> {
    if self.closed() {
      return Err(ConnError::Closed);
    }

    if self.kind == HttpConnectionKind::Push {
      return Ok(());
    }

    let slot = match self.slot.lock().take() {
      Some(slot) => slot,
      None => return Err(ConnError::Closed),
    };

    let res = slot.send(payload).map_err(|_| ConnError::Closed);

    // A poll connection is single-use: the send that fulfills it also
    // completes it.
    self.close();

    res
  }

  /// Closes the connection. Idempotent.
  pub fn close(&self) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }

    *self.closed_at.lock() = Some(SystemTime::now());
    self.slot.lock().take();

    self.dispatch(Some(&Message::disconnect()), None);

    if let Some(shard) = self.shard.as_ref() {
      match shard.upgrade() {
        Some(shard) => shard.unregister(&self.identifier, self.request_id),
        None => {
          let err = ConnError::Unregister("shard dropped before connection close".to_string());
          warn!(identifier = %self.identifier, "{}", err);
        },
      }
    }

    trace!(identifier = %self.identifier, "http connection closed");
  }

  fn dispatch(&self, msg: Option<&Message>, err: Option<&ConnError>) {
    (self.handler)(self, msg, err);
  }
}

#[async_trait]
impl Connection for HttpConnection {
  fn identifier(&self) -> StringAtom {
    self.identifier.clone()
  }

  fn request_id(&self) -> u64 {
    self.request_id
  }

  fn created_at(&self) -> SystemTime {
    self.created_at
  }

  fn closed_at(&self) -> Option<SystemTime> {
    *self.closed_at.lock()
  }

  fn last_pinged_at(&self) -> SystemTime {
    // HTTP connections have no heartbeat concept.
    self.created_at
  }

  fn closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  fn connection_type(&self) -> &'static str {
    "http"
  }

  fn metadata(&self) -> &Metadata {
    &self.metadata
  }

  fn message_handler(&self) -> MessageHandler {
    self.handler.clone()
  }

  async fn send(&self, payload: Vec<u8>) -> Result<(), ConnError> {
    HttpConnection::send(self, payload)
  }

  fn close(&self) {
    HttpConnection::close(self)
  }

  async fn wait(&self) {}
}

impl std::fmt::Debug for HttpConnection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HttpConnection")
      .field("identifier", &self.identifier)
      .field("kind", &self.kind)
      .field("closed", &self.closed())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use tether_protocol::MessageKind;

  use crate::connections::conn::{ConnectionConfig, Metadata};
  use crate::connections::manager::ConnectionManager;
  use crate::connections::testing::{count_kind, recording_handler};

  use super::*;

  fn test_manager() -> Arc<ConnectionManager> {
    ConnectionManager::new(StringAtom::from("test-channel"), Arc::new(ConnectionConfig::default()))
  }

  #[tokio::test]
  async fn test_poll_connection_is_single_use() {
    let manager = test_manager();
    let (handler, events) = recording_handler();

    let (conn, slot_rx) = manager.new_poll_connection("dev-1", handler, Metadata::new()).unwrap();
    assert_eq!(count_kind(&events, MessageKind::Connect), 1);
    assert_eq!(manager.count(), 1);
    assert_eq!(conn.last_pinged_at(), conn.created_at());

    conn.send(b"payload".to_vec()).unwrap();

    // The one send fulfills the rendezvous and completes the connection.
    assert_eq!(slot_rx.await.unwrap(), b"payload");
    assert!(conn.closed());
    assert!(conn.closed_at().is_some());
    assert_eq!(count_kind(&events, MessageKind::Disconnect), 1);
    assert_eq!(manager.count(), 0);

    assert_eq!(conn.send(b"again".to_vec()).unwrap_err(), ConnError::Closed);
  }

  #[tokio::test]
  async fn test_push_connection_is_not_registered() {
    let manager = test_manager();
    let (handler, events) = recording_handler();

    let conn = manager.new_push_connection("dev-1", handler, Metadata::new()).unwrap();
    assert_eq!(manager.count(), 0);
    assert_eq!(count_kind(&events, MessageKind::Connect), 1);

    // The adapter already consumed the request body; sending is a no-op.
    conn.send(b"ignored".to_vec()).unwrap();
    assert!(!conn.closed());

    conn.close();
    assert_eq!(count_kind(&events, MessageKind::Disconnect), 1);
    assert_eq!(conn.send(b"late".to_vec()).unwrap_err(), ConnError::Closed);
  }

  #[tokio::test]
  async fn test_close_is_idempotent() {
    let manager = test_manager();
    let (handler, events) = recording_handler();

    let (conn, _slot_rx) = manager.new_poll_connection("dev-1", handler, Metadata::new()).unwrap();

    conn.close();
    conn.close();
    conn.wait().await;

    assert_eq!(count_kind(&events, MessageKind::Disconnect), 1);
    assert_eq!(manager.count(), 0);
  }

  #[tokio::test]
  async fn test_poll_replacement_closes_superseded_connection() {
    let manager = test_manager();

    let (handler, _) = recording_handler();
    let (first, _first_rx) = manager.new_poll_connection("dev-1", handler, Metadata::new()).unwrap();

    let (handler, _) = recording_handler();
    let (second, _second_rx) = manager.new_poll_connection("dev-1", handler, Metadata::new()).unwrap();

    assert_eq!(manager.count(), 1);
    assert!(first.closed());
    assert!(!second.closed());
  }
}

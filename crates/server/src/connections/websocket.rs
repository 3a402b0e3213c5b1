// SPDX-License-Identifier: AGPL-3.0-only

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex as PlMutex;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{trace, warn};

use tether_protocol::{Message, MessageKind, unmarshal};
use tether_util::id;
use tether_util::string_atom::StringAtom;

use crate::connections::conn::{
  Connection, ConnectionConfig, Frame, Metadata, MessageHandler, Transport, TransportReader, TransportWriter,
};
use crate::connections::errors::ConnError;
use crate::connections::shard::Shard;
use crate::telemetry::metrics;

/// The outcome a write-request waiter resolves to: `None` for a plain write
/// acknowledgment, `Some(message)` for a correlated response.
type WriteOutcome = Result<Option<Message>, ConnError>;

/// One unit of work for the write loop.
struct WriteRequest {
  msg: Message,

  /// The waiter for non-Request kinds. Request waiters live in the
  /// pending-request table instead, keyed by message id.
  waiter: Option<oneshot::Sender<WriteOutcome>>,
}

/// The per-connection table correlating an outstanding Request's id to its
/// response waiter.
///
/// An entry exists only while the request is in flight: the requester
/// installs it before enqueueing and removes it on every failure path, the
/// read loop removes it on delivery, and `close` drains whatever is left.
#[derive(Debug, Default)]
struct PendingRequests {
  waiters: PlMutex<HashMap<StringAtom, oneshot::Sender<WriteOutcome>>>,
}

// ===== impl PendingRequests =====

impl PendingRequests {
  fn insert(&self, id: StringAtom, waiter: oneshot::Sender<WriteOutcome>) {
    self.waiters.lock().insert(id, waiter);
  }

  fn remove(&self, id: &StringAtom) -> Option<oneshot::Sender<WriteOutcome>> {
    self.waiters.lock().remove(id)
  }

  fn drain(&self) -> Vec<oneshot::Sender<WriteOutcome>> {
    self.waiters.lock().drain().map(|(_, waiter)| waiter).collect()
  }

  fn len(&self) -> usize {
    self.waiters.lock().len()
  }
}

/// A WebSocket-backed connection.
///
/// Two cooperating loops own the transport halves: the read loop decodes
/// inbound frames and feeds the handler and the pending-request table, the
/// write loop serializes every outbound write onto the socket. Senders and
/// requesters talk to the write loop exclusively through a bounded queue.
pub struct WebsocketConnection {
  identifier: StringAtom,
  request_id: u64,
  created_at: SystemTime,
  last_pinged_at: PlMutex<SystemTime>,
  closed_at: PlMutex<Option<SystemTime>>,
  closed: AtomicBool,
  metadata: Metadata,
  handler: MessageHandler,

  /// Weak handle back to the owning shard, resolved only to unregister.
  shard: Weak<Shard>,

  config: Arc<ConnectionConfig>,

  /// The master sender for the write queue; taken on close so the write
  /// loop drains and exits once in-flight clones are gone.
  write_tx: PlMutex<Option<mpsc::Sender<WriteRequest>>>,

  /// The queue receiver, handed to the write loop on start.
  write_rx: PlMutex<Option<mpsc::Receiver<WriteRequest>>>,

  pending: PendingRequests,
  read_cancel: CancellationToken,
  tracker: TaskTracker,
}

// ===== impl WebsocketConnection =====

impl WebsocketConnection {
  pub(crate) fn new(
    identifier: StringAtom,
    request_id: u64,
    handler: MessageHandler,
    metadata: Metadata,
    shard: Weak<Shard>,
    config: Arc<ConnectionConfig>,
  ) -> Arc<Self> {
    let (write_tx, write_rx) = mpsc::channel(config.request_queue_size);
    let now = SystemTime::now();

    Arc::new(Self {
      identifier,
      request_id,
      created_at: now,
      last_pinged_at: PlMutex::new(now),
      closed_at: PlMutex::new(None),
      closed: AtomicBool::new(false),
      metadata,
      handler,
      shard,
      config,
      write_tx: PlMutex::new(Some(write_tx)),
      write_rx: PlMutex::new(Some(write_rx)),
      pending: PendingRequests::default(),
      read_cancel: CancellationToken::new(),
      tracker: TaskTracker::new(),
    })
  }

  /// Starts the two I/O loops and synthesizes the Connect message.
  pub(crate) fn start(self: &Arc<Self>, transport: Box<dyn Transport>) {
    let write_rx = match self.write_rx.lock().take() {
      Some(write_rx) => write_rx,
      None => return,
    };
    let (reader, writer) = transport.split();

    self.tracker.spawn(self.clone().read_loop(reader));
    self.tracker.spawn(self.clone().write_loop(writer, write_rx));
    self.tracker.close();

    trace!(identifier = %self.identifier, "websocket connection started");

    self.dispatch(Some(&Message::connect()), None);
  }

  /// Sends a fire-and-forget payload (kind Send).
  pub async fn send(&self, payload: Vec<u8>) -> Result<(), ConnError> {
    self.send_message(MessageKind::Send, payload).await.map(|_| ())
  }

  /// Sends a fire-and-forget response payload (kind Response).
  pub async fn send_response(&self, payload: Vec<u8>) -> Result<(), ConnError> {
    self.send_message(MessageKind::Response, payload).await.map(|_| ())
  }

  /// Sends a request and awaits its correlated response payload.
  pub async fn request(&self, payload: Vec<u8>) -> Result<Vec<u8>, ConnError> {
    let response = self.send_message(MessageKind::Request, payload).await?;
    Ok(response.map(Message::into_payload).unwrap_or_default())
  }

  /// The number of requests currently awaiting a response.
  pub fn pending_requests(&self) -> usize {
    self.pending.len()
  }

  /// Closes the connection. Exactly-once: the first caller marks the
  /// connection closed, cancels the read loop, lets the write loop drain
  /// and emit the final Disconnect frame, fails every pending waiter,
  /// dispatches the synthetic Disconnect and unregisters from the shard.
  pub fn close(&self) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }

    *self.closed_at.lock() = Some(SystemTime::now());
    self.read_cancel.cancel();
    self.write_tx.lock().take();

    for waiter in self.pending.drain() {
      let _ = waiter.send(Err(ConnError::Closed));
    }

    self.dispatch(Some(&Message::disconnect()), None);
    self.unregister();

    trace!(identifier = %self.identifier, "websocket connection closed");
  }

  /// Blocks until both I/O loops have exited.
  pub async fn wait(&self) {
    self.tracker.wait().await;
  }

  fn dispatch(&self, msg: Option<&Message>, err: Option<&ConnError>) {
    (self.handler)(self, msg, err);
  }

  fn unregister(&self) {
    match self.shard.upgrade() {
      Some(shard) => shard.unregister(&self.identifier, self.request_id),
      None => {
        let err = ConnError::Unregister("shard dropped before connection close".to_string());
        warn!(identifier = %self.identifier, "{}", err);
      },
    }
  }

  /// The shared implementation behind `send`, `send_response` and
  /// `request`: enqueue bounded by the enqueue timeout, then await the
  /// waiter bounded by the response timeout (Request) or the enqueue
  /// timeout (everything else).
  async fn send_message(&self, kind: MessageKind, payload: Vec<u8>) -> Result<Option<Message>, ConnError> {
    let msg = Message::new(kind, id::next_id(), payload);
    let msg_id = msg.id().clone();
    let is_request = kind == MessageKind::Request;

    let waiter_rx = self.enqueue(msg).await?;

    let wait_timeout = if is_request { self.config.response_timeout } else { self.config.request_timeout };

    match tokio::time::timeout(wait_timeout, waiter_rx).await {
      Ok(Ok(outcome)) => outcome,
      Ok(Err(_)) => {
        // The waiter was dropped without an outcome: the loops are gone.
        if is_request {
          self.pending.remove(&msg_id);
        }
        Err(ConnError::Closed)
      },
      Err(_) => {
        if is_request {
          self.pending.remove(&msg_id);
        }
        Err(ConnError::ResponseTimeout(wait_timeout))
      },
    }
  }

  async fn enqueue(&self, msg: Message) -> Result<oneshot::Receiver<WriteOutcome>, ConnError> {
    if self.closed() {
      return Err(ConnError::Closed);
    }

    let write_tx = match self.write_tx.lock().clone() {
      Some(write_tx) => write_tx,
      None => return Err(ConnError::Closed),
    };

    let msg_id = msg.id().clone();
    let is_request = msg.kind() == MessageKind::Request;

    let (waiter_tx, waiter_rx) = oneshot::channel();
    let waiter = if is_request {
      self.pending.insert(msg_id.clone(), waiter_tx);
      None
    } else {
      Some(waiter_tx)
    };

    match write_tx.send_timeout(WriteRequest { msg, waiter }, self.config.request_timeout).await {
      Ok(()) => Ok(waiter_rx),
      Err(SendTimeoutError::Timeout(_)) => {
        if is_request {
          self.pending.remove(&msg_id);
        }
        Err(ConnError::RequestTimeout(self.config.request_timeout))
      },
      Err(SendTimeoutError::Closed(_)) => {
        if is_request {
          self.pending.remove(&msg_id);
        }
        Err(ConnError::Closed)
      },
    }
  }

  async fn read_loop(self: Arc<Self>, mut reader: Box<dyn TransportReader>) {
    loop {
      let frame = tokio::select! {
        _ = self.read_cancel.cancelled() => return,
        res = tokio::time::timeout(self.config.read_timeout, reader.read_message()) => {
          match res {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
              let err = ConnError::transport(err);
              self.dispatch(None, Some(&err));
              self.close();
              return;
            },
            Err(_) => {
              let err = ConnError::Transport(format!("read deadline exceeded after {:?}", self.config.read_timeout));
              self.dispatch(None, Some(&err));
              self.close();
              return;
            },
          }
        },
      };

      *self.last_pinged_at.lock() = SystemTime::now();

      let raw = match frame {
        Frame::Binary(raw) => raw,
        Frame::Close => {
          // The transport-level close maps to the synthetic Disconnect
          // that `close` dispatches.
          self.close();
          return;
        },
      };

      match unmarshal(&raw) {
        Err(err) => {
          let err = ConnError::from(err);
          self.dispatch(None, Some(&err));
        },
        Ok(msg) if msg.kind() == MessageKind::Disconnect => {
          self.close();
          return;
        },
        Ok(msg) if msg.kind() == MessageKind::Response => {
          metrics::message_received(self.connection_type());
          match self.pending.remove(msg.id()) {
            Some(waiter) => {
              let _ = waiter.send(Ok(Some(msg.clone())));
              self.dispatch(Some(&msg), None);
            },
            None => {
              self.dispatch(Some(&msg), Some(&ConnError::UnexpectedResponse));
            },
          }
        },
        Ok(msg) => {
          metrics::message_received(self.connection_type());
          self.dispatch(Some(&msg), None);
        },
      }
    }
  }

  async fn write_loop(self: Arc<Self>, mut writer: Box<dyn TransportWriter>, mut write_rx: mpsc::Receiver<WriteRequest>) {
    while let Some(WriteRequest { mut msg, waiter }) = write_rx.recv().await {
      let raw = match msg.marshal() {
        Ok(raw) => raw,
        Err(err) => {
          // Malformed outbound messages are reported to the waiter but are
          // not fatal to the loop.
          self.fail_waiter(&msg, waiter, ConnError::from(err));
          continue;
        },
      };

      let res = tokio::time::timeout(self.config.write_timeout, writer.write_message(Frame::Binary(raw))).await;

      let err = match res {
        Ok(Ok(())) => {
          metrics::message_sent(self.connection_type());
          if msg.kind() != MessageKind::Request {
            if let Some(waiter) = waiter {
              let _ = waiter.send(Ok(None));
            }
          }
          // A Request's waiter stays in the pending table until its
          // response arrives or the requester times out.
          continue;
        },
        Ok(Err(err)) => ConnError::transport(err),
        Err(_) => ConnError::Transport(format!("write deadline exceeded after {:?}", self.config.write_timeout)),
      };

      // Transport-level write failures are fatal; the handler learns about
      // it through the synthetic Disconnect dispatched by close.
      self.fail_waiter(&msg, waiter, err);
      self.close();
    }

    // The queue is closed: emit the final Disconnect frame and close the
    // transport. This is the only path that closes it.
    let _ = tokio::time::timeout(self.config.write_timeout, writer.write_message(Frame::Close)).await;
    let _ = tokio::time::timeout(self.config.write_timeout, writer.close()).await;

    trace!(identifier = %self.identifier, "write loop drained");
  }

  fn fail_waiter(&self, msg: &Message, waiter: Option<oneshot::Sender<WriteOutcome>>, err: ConnError) {
    match waiter {
      Some(waiter) => {
        let _ = waiter.send(Err(err));
      },
      None => {
        if let Some(waiter) = self.pending.remove(msg.id()) {
          let _ = waiter.send(Err(err));
        }
      },
    }
  }
}

#[async_trait]
impl Connection for WebsocketConnection {
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
    *self.last_pinged_at.lock()
  }

  fn closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  fn connection_type(&self) -> &'static str {
    "websocket"
  }

  fn metadata(&self) -> &Metadata {
    &self.metadata
  }

  fn message_handler(&self) -> MessageHandler {
    self.handler.clone()
  }

  async fn send(&self, payload: Vec<u8>) -> Result<(), ConnError> {
    WebsocketConnection::send(self, payload).await
  }

  fn close(&self) {
    WebsocketConnection::close(self)
  }

  async fn wait(&self) {
    WebsocketConnection::wait(self).await
  }

  fn as_websocket(&self) -> Option<&WebsocketConnection> {
    Some(self)
  }
}

impl std::fmt::Debug for WebsocketConnection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WebsocketConnection")
      .field("identifier", &self.identifier)
      .field("request_id", &self.request_id)
      .field("closed", &self.closed())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use parking_lot::Mutex as PlMutex;

  use crate::connections::manager::ConnectionManager;
  use crate::connections::testing::{count_kind, mock_transport, recording_handler, MockRemote, RecordedEvent};

  use super::*;

  fn test_config() -> ConnectionConfig {
    ConnectionConfig {
      write_timeout: Duration::from_millis(500),
      read_timeout: Duration::from_secs(5),
      request_timeout: Duration::from_millis(200),
      response_timeout: Duration::from_millis(500),
      request_queue_size: 8,
      shard_count: 4,
      initial_shard_capacity: 8,
    }
  }

  fn test_manager(config: ConnectionConfig) -> Arc<ConnectionManager> {
    ConnectionManager::new(StringAtom::from("test-channel"), Arc::new(config))
  }

  async fn attach(
    manager: &ConnectionManager,
    identifier: &str,
  ) -> (Arc<WebsocketConnection>, MockRemote, Arc<PlMutex<Vec<RecordedEvent>>>) {
    let (transport, remote) = mock_transport();
    let (handler, events) = recording_handler();
    let conn = manager.new_websocket_connection(identifier, transport, handler, Metadata::new()).await.unwrap();
    (conn, remote, events)
  }

  async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
      if condition() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
  }

  /// Answers every request frame with a response carrying the given
  /// payload, until the connection's transport closes.
  fn spawn_responder(mut remote: MockRemote, payload: &'static [u8]) {
    tokio::spawn(async move {
      while let Some(frame) = remote.next_frame().await {
        let raw = match frame {
          Frame::Binary(raw) => raw,
          Frame::Close => break,
        };
        let msg = unmarshal(&raw).unwrap();
        if msg.kind() == MessageKind::Request {
          let mut reply = Message::new(MessageKind::Response, msg.id().clone(), payload.to_vec());
          remote.push_binary(reply.marshal().unwrap());
        }
      }
    });
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_send_writes_frame_and_dispatches_connect() {
    let manager = test_manager(test_config());
    let (conn, mut remote, events) = attach(&manager, "dev-1").await;

    assert_eq!(count_kind(&events, MessageKind::Connect), 1);

    conn.send(b"hi".to_vec()).await.unwrap();

    let frame = remote.next_frame().await.unwrap();
    let raw = match frame {
      Frame::Binary(raw) => raw,
      Frame::Close => panic!("unexpected close frame"),
    };
    let msg = unmarshal(&raw).unwrap();
    assert_eq!(msg.kind(), MessageKind::Send);
    assert!(!msg.id().is_empty());
    assert_eq!(msg.payload(), b"hi");

    conn.close();
    conn.wait().await;
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_request_receives_correlated_response() {
    let manager = test_manager(test_config());
    let (conn, remote, events) = attach(&manager, "dev-1").await;

    spawn_responder(remote, b"pong");

    let response = conn.request(b"ping".to_vec()).await.unwrap();
    assert_eq!(response, b"pong");
    assert_eq!(conn.pending_requests(), 0);

    // The response is also delivered to the handler.
    wait_until(|| count_kind(&events, MessageKind::Response) == 1).await;

    conn.close();
    conn.wait().await;
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_response_timeout_leaves_no_pending_state() {
    let config = test_config();
    let response_timeout = config.response_timeout;
    let manager = test_manager(config);
    let (conn, _remote, _events) = attach(&manager, "dev-1").await;

    let err = conn.request(b"ping".to_vec()).await.unwrap_err();
    assert_eq!(err, ConnError::ResponseTimeout(response_timeout));
    assert_eq!(conn.pending_requests(), 0);

    conn.close();
    conn.wait().await;
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_request_times_out_when_write_queue_stalls() {
    let mut config = test_config();
    config.request_queue_size = 1;
    config.request_timeout = Duration::from_millis(100);
    let request_timeout = config.request_timeout;

    let manager = test_manager(config);
    let (conn, remote, _events) = attach(&manager, "dev-1").await;

    remote.set_blocked(true);

    // The first send is stuck inside the transport write, the second fills
    // the queue slot.
    for _ in 0..2 {
      let conn = conn.clone();
      tokio::spawn(async move {
        let _ = conn.send(b"stuck".to_vec()).await;
      });
      tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let err = conn.request(b"ping".to_vec()).await.unwrap_err();
    assert_eq!(err, ConnError::RequestTimeout(request_timeout));
    assert_eq!(conn.pending_requests(), 0);

    remote.set_blocked(false);
    conn.close();
    conn.wait().await;
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_send_on_closed_connection_fails() {
    let manager = test_manager(test_config());
    let (conn, _remote, _events) = attach(&manager, "dev-1").await;

    conn.close();

    let err = conn.send(b"late".to_vec()).await.unwrap_err();
    assert_eq!(err, ConnError::Closed);

    let err = conn.request(b"late".to_vec()).await.unwrap_err();
    assert_eq!(err, ConnError::Closed);

    conn.wait().await;
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_exactly_once_close_under_concurrent_callers() {
    let manager = test_manager(test_config());
    let (conn, _remote, events) = attach(&manager, "dev-1").await;

    let mut tasks = Vec::new();
    for _ in 0..16 {
      let conn = conn.clone();
      tasks.push(tokio::spawn(async move { conn.close() }));
    }
    for task in tasks {
      task.await.unwrap();
    }
    conn.wait().await;

    assert!(conn.closed());
    assert!(conn.closed_at().is_some());
    assert_eq!(count_kind(&events, MessageKind::Disconnect), 1);
    assert_eq!(manager.count(), 0);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_unexpected_response_is_reported_but_not_fatal() {
    let manager = test_manager(test_config());
    let (conn, remote, events) = attach(&manager, "dev-1").await;

    remote.push_binary(b"4|nope|data".to_vec());

    wait_until(|| events.lock().iter().any(|e| e.error == Some(ConnError::UnexpectedResponse))).await;
    assert!(!conn.closed());

    conn.close();
    conn.wait().await;
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_protocol_error_is_reported_but_not_fatal() {
    let manager = test_manager(test_config());
    let (conn, remote, events) = attach(&manager, "dev-1").await;

    remote.push_binary(b"7|bad|kind".to_vec());

    wait_until(|| events.lock().iter().any(|e| matches!(e.error, Some(ConnError::Protocol(_))))).await;
    assert!(!conn.closed());

    conn.close();
    conn.wait().await;
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_read_transport_error_closes_connection() {
    let manager = test_manager(test_config());
    let (conn, remote, events) = attach(&manager, "dev-1").await;

    remote.push_read_error("boom");

    conn.wait().await;

    assert!(conn.closed());
    assert!(events.lock().iter().any(|e| matches!(e.error, Some(ConnError::Transport(_)))));
    assert_eq!(count_kind(&events, MessageKind::Disconnect), 1);
    assert_eq!(manager.count(), 0);
    assert!(remote.closed());
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_write_failure_fails_sender_and_closes() {
    let manager = test_manager(test_config());
    let (conn, remote, _events) = attach(&manager, "dev-1").await;

    remote.set_fail_writes(true);

    let err = conn.send(b"doomed".to_vec()).await.unwrap_err();
    assert!(matches!(err, ConnError::Transport(_)));

    conn.wait().await;
    assert!(conn.closed());
    assert_eq!(manager.count(), 0);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_close_frame_maps_to_disconnect() {
    let manager = test_manager(test_config());
    let (conn, remote, events) = attach(&manager, "dev-1").await;

    remote.push_close();

    conn.wait().await;
    assert!(conn.closed());
    assert_eq!(count_kind(&events, MessageKind::Disconnect), 1);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_decoded_disconnect_closes_connection() {
    let manager = test_manager(test_config());
    let (conn, remote, events) = attach(&manager, "dev-1").await;

    remote.push_binary(b"9||".to_vec());

    conn.wait().await;
    assert!(conn.closed());
    assert_eq!(count_kind(&events, MessageKind::Disconnect), 1);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_burst_leaves_no_correlation_state() {
    let mut config = test_config();
    config.request_queue_size = 1024;
    config.response_timeout = Duration::from_secs(5);
    let manager = test_manager(config);
    let (conn, remote, _events) = attach(&manager, "dev-1").await;

    spawn_responder(remote, b"ok");

    let mut tasks = Vec::new();
    for i in 0..1000 {
      let conn = conn.clone();
      tasks.push(tokio::spawn(async move {
        match i % 3 {
          0 => conn.send(b"fire".to_vec()).await.map(|_| Vec::new()),
          1 => conn.send_response(b"reply".to_vec()).await.map(|_| Vec::new()),
          _ => conn.request(b"ask".to_vec()).await,
        }
      }));
    }
    for task in tasks {
      task.await.unwrap().unwrap();
    }

    conn.close();
    conn.wait().await;

    assert_eq!(conn.pending_requests(), 0);
    assert_eq!(manager.count(), 0);
  }
}

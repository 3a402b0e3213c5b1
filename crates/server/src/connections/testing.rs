// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory test doubles for the connection engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex as PlMutex;
use tokio::sync::{mpsc, watch};

use tether_protocol::{Message, MessageKind};
use tether_util::string_atom::StringAtom;

use crate::connections::conn::{
  Connection, Frame, Metadata, MessageHandler, Transport, TransportReader, TransportWriter,
};
use crate::connections::errors::ConnError;

/// A transport backed by in-memory channels, with the far side scripted by
/// a `MockRemote`.
pub(crate) struct MockTransport {
  incoming_rx: mpsc::UnboundedReceiver<anyhow::Result<Frame>>,
  outgoing_tx: mpsc::UnboundedSender<Frame>,
  blocked_rx: watch::Receiver<bool>,
  fail_writes: Arc<AtomicBool>,
  closed: Arc<AtomicBool>,
}

/// The peer's end of a `MockTransport`.
pub(crate) struct MockRemote {
  incoming_tx: mpsc::UnboundedSender<anyhow::Result<Frame>>,
  pub(crate) outgoing_rx: mpsc::UnboundedReceiver<Frame>,
  blocked_tx: watch::Sender<bool>,
  fail_writes: Arc<AtomicBool>,
  closed: Arc<AtomicBool>,
}

pub(crate) fn mock_transport() -> (Box<dyn Transport>, MockRemote) {
  let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
  let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
  let (blocked_tx, blocked_rx) = watch::channel(false);
  let fail_writes = Arc::new(AtomicBool::new(false));
  let closed = Arc::new(AtomicBool::new(false));

  let transport = MockTransport {
    incoming_rx,
    outgoing_tx,
    blocked_rx,
    fail_writes: fail_writes.clone(),
    closed: closed.clone(),
  };
  let remote = MockRemote { incoming_tx, outgoing_rx, blocked_tx, fail_writes, closed };

  (Box::new(transport), remote)
}

// ===== impl MockRemote =====

impl MockRemote {
  /// Queues a raw frame for the connection's read loop.
  pub(crate) fn push_binary(&self, raw: impl Into<Vec<u8>>) {
    let _ = self.incoming_tx.send(Ok(Frame::Binary(raw.into())));
  }

  pub(crate) fn push_close(&self) {
    let _ = self.incoming_tx.send(Ok(Frame::Close));
  }

  pub(crate) fn push_read_error(&self, detail: &str) {
    let _ = self.incoming_tx.send(Err(anyhow::anyhow!("{}", detail)));
  }

  /// Stalls (or releases) the write side, as a peer that stops reading
  /// would.
  pub(crate) fn set_blocked(&self, blocked: bool) {
    let _ = self.blocked_tx.send(blocked);
  }

  pub(crate) fn set_fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  pub(crate) fn closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// The next frame the connection wrote, if any.
  pub(crate) async fn next_frame(&mut self) -> Option<Frame> {
    self.outgoing_rx.recv().await
  }
}

impl Transport for MockTransport {
  fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
    let reader = MockReader { incoming_rx: self.incoming_rx };
    let writer = MockWriter {
      outgoing_tx: self.outgoing_tx,
      blocked_rx: self.blocked_rx,
      fail_writes: self.fail_writes,
      closed: self.closed,
    };
    (Box::new(reader), Box::new(writer))
  }
}

struct MockReader {
  incoming_rx: mpsc::UnboundedReceiver<anyhow::Result<Frame>>,
}

#[async_trait]
impl TransportReader for MockReader {
  async fn read_message(&mut self) -> anyhow::Result<Frame> {
    match self.incoming_rx.recv().await {
      Some(res) => res,
      None => anyhow::bail!("connection reset by peer"),
    }
  }
}

struct MockWriter {
  outgoing_tx: mpsc::UnboundedSender<Frame>,
  blocked_rx: watch::Receiver<bool>,
  fail_writes: Arc<AtomicBool>,
  closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportWriter for MockWriter {
  async fn write_message(&mut self, frame: Frame) -> anyhow::Result<()> {
    loop {
      let blocked = *self.blocked_rx.borrow();
      if !blocked {
        break;
      }
      if self.blocked_rx.changed().await.is_err() {
        break;
      }
    }

    if self.fail_writes.load(Ordering::SeqCst) {
      anyhow::bail!("simulated write failure");
    }

    self.outgoing_tx.send(frame).map_err(|_| anyhow::anyhow!("peer went away"))
  }

  async fn close(&mut self) -> anyhow::Result<()> {
    self.closed.store(true, Ordering::SeqCst);
    Ok(())
  }
}

/// One handler invocation, as recorded by `recording_handler`.
#[derive(Clone, Debug)]
pub(crate) struct RecordedEvent {
  pub(crate) kind: Option<MessageKind>,
  pub(crate) payload: Vec<u8>,
  pub(crate) error: Option<ConnError>,
}

/// A handler that records every dispatch it sees.
pub(crate) fn recording_handler() -> (MessageHandler, Arc<PlMutex<Vec<RecordedEvent>>>) {
  let events: Arc<PlMutex<Vec<RecordedEvent>>> = Arc::new(PlMutex::new(Vec::new()));

  let sink = events.clone();
  let handler: MessageHandler = Arc::new(move |_conn, msg: Option<&Message>, err: Option<&ConnError>| {
    sink.lock().push(RecordedEvent {
      kind: msg.map(|m| m.kind()),
      payload: msg.map(|m| m.payload().to_vec()).unwrap_or_default(),
      error: err.cloned(),
    });
  });

  (handler, events)
}

pub(crate) fn count_kind(events: &PlMutex<Vec<RecordedEvent>>, kind: MessageKind) -> usize {
  events.lock().iter().filter(|e| e.kind == Some(kind)).count()
}

/// A do-nothing connection for exercising handlers in isolation.
pub(crate) struct NullConnection {
  created_at: SystemTime,
  metadata: Metadata,
}

impl Default for NullConnection {
  fn default() -> Self {
    Self { created_at: SystemTime::now(), metadata: Metadata::default() }
  }
}

#[async_trait]
impl Connection for NullConnection {
  fn identifier(&self) -> StringAtom {
    StringAtom::from("null")
  }

  fn request_id(&self) -> u64 {
    0
  }

  fn created_at(&self) -> SystemTime {
    self.created_at
  }

  fn closed_at(&self) -> Option<SystemTime> {
    None
  }

  fn last_pinged_at(&self) -> SystemTime {
    self.created_at
  }

  fn closed(&self) -> bool {
    false
  }

  fn connection_type(&self) -> &'static str {
    "null"
  }

  fn metadata(&self) -> &Metadata {
    &self.metadata
  }

  fn message_handler(&self) -> MessageHandler {
    Arc::new(|_, _, _| {})
  }

  async fn send(&self, _payload: Vec<u8>) -> Result<(), ConnError> {
    Ok(())
  }

  fn close(&self) {}

  async fn wait(&self) {}
}

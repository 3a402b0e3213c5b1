// SPDX-License-Identifier: AGPL-3.0-only

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, info, warn};

use tether_util::string_atom::StringAtom;

use crate::config::{ConnectionsSection, ListenerConfig};
use crate::connections::{
  ConnectionManager, ConnectionRegistry, Frame, Metadata, MiddlewareStack, Transport, TransportReader,
  TransportWriter,
};

/// The WebSocket front door: accepts sockets, performs the handshake and
/// attaches the connection to the channel named in the request path
/// (`/ws/<channel>/<device>`).
pub struct WsListener {
  config: ListenerConfig,
  ws_config: WebSocketConfig,
  registry: Arc<ConnectionRegistry>,
  stack: Arc<MiddlewareStack>,

  /// The channel to signal the accept loop to stop.
  done_tx: Option<mpsc::Sender<()>>,

  /// The local address of the listener.
  local_address: Option<SocketAddr>,
}

// ===== impl WsListener =====

impl WsListener {
  pub fn new(
    config: ListenerConfig,
    connections: &ConnectionsSection,
    registry: Arc<ConnectionRegistry>,
    stack: Arc<MiddlewareStack>,
  ) -> Self {
    let mut ws_config = WebSocketConfig::default();
    ws_config.write_buffer_size = connections.write_buffer_size;
    ws_config.max_message_size = Some(connections.read_buffer_size.max(64 * 1024));

    Self { config, ws_config, registry, stack, done_tx: None, local_address: None }
  }

  /// Binds the listener and starts accepting connections.
  pub async fn bootstrap(&mut self) -> anyhow::Result<()> {
    assert!(self.done_tx.is_none());

    let (done_tx, mut done_rx) = mpsc::channel(1);
    self.done_tx = Some(done_tx);

    let listener = TcpListener::bind(self.address()).await?;
    self.local_address = Some(listener.local_addr()?);

    let registry = self.registry.clone();
    let stack = self.stack.clone();
    let ws_config = self.ws_config;

    let (running_tx, running_rx) = oneshot::channel();

    tokio::spawn(async move {
      let _ = running_tx.send(());

      loop {
        tokio::select! {
          res = listener.accept() => {
            match res {
              Ok((stream, peer)) => {
                debug!(peer = %peer, "accepted connection");

                let registry = registry.clone();
                let stack = stack.clone();
                tokio::spawn(async move {
                  if let Err(err) = handle_connection(stream, peer, registry, stack, ws_config).await {
                    warn!(peer = %peer, error = %err, "failed to handle connection");
                  }
                });
              },
              Err(err) => {
                warn!(error = %err, "failed to accept connection");
              },
            }
          },
          _ = done_rx.recv() => {
            break;
          },
        }
      }
    });

    // Wait for the accept loop to start.
    running_rx.await?;

    info!(address = self.address(), "accepting websocket connections");
    Ok(())
  }

  /// Stops accepting new connections. Live connections are left to their
  /// managers; closing the registry drains them.
  pub async fn shutdown(&mut self) -> anyhow::Result<()> {
    assert!(self.done_tx.is_some());

    self.done_tx.take().unwrap().send(()).await?;

    info!(address = self.address(), "stopped accepting websocket connections");
    Ok(())
  }

  /// Returns the bound address, once `bootstrap` has succeeded.
  pub fn local_address(&self) -> Option<SocketAddr> {
    self.local_address
  }

  fn address(&self) -> String {
    format!("{}:{}", self.config.bind_address, self.config.port)
  }
}

async fn handle_connection(
  stream: TcpStream,
  peer: SocketAddr,
  registry: Arc<ConnectionRegistry>,
  stack: Arc<MiddlewareStack>,
  ws_config: WebSocketConfig,
) -> anyhow::Result<()> {
  let mut attach: Option<(Arc<ConnectionManager>, String)> = None;

  let callback = |req: &Request, resp: Response| {
    let (channel, device) = match parse_attach_path(req.uri().path()) {
      Some(pair) => pair,
      None => return Err(reject(StatusCode::NOT_FOUND, "unknown path")),
    };

    let manager = match registry.find_connection_manager(&channel) {
      Some(manager) => manager,
      None => return Err(reject(StatusCode::NOT_FOUND, "channel is not found")),
    };

    attach = Some((manager, device));
    Ok(resp)
  };

  let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;

  let (manager, device) = match attach {
    Some(attach) => attach,
    None => bail!("handshake completed without an attach target"),
  };

  let handler = stack.chain(None);

  let mut metadata = Metadata::new();
  metadata.insert(StringAtom::from("remote-address"), StringAtom::from(peer.to_string().as_str()));

  manager.new_websocket_connection(device.as_str(), Box::new(WsTransport::new(ws_stream)), handler, metadata).await?;

  Ok(())
}

/// Parses `/ws/<channel>/<device>` into its channel and device parts.
fn parse_attach_path(path: &str) -> Option<(String, String)> {
  let mut parts = path.split('/').filter(|part| !part.is_empty());

  match (parts.next(), parts.next(), parts.next(), parts.next()) {
    (Some("ws"), Some(channel), Some(device), None) => Some((channel.to_string(), device.to_string())),
    _ => None,
  }
}

fn reject(status: StatusCode, detail: &str) -> ErrorResponse {
  let mut resp = ErrorResponse::new(Some(detail.to_string()));
  *resp.status_mut() = status;
  resp
}

/// A `Transport` over an accepted WebSocket stream.
pub struct WsTransport {
  stream: WebSocketStream<TcpStream>,
}

// ===== impl WsTransport =====

impl WsTransport {
  pub fn new(stream: WebSocketStream<TcpStream>) -> Self {
    Self { stream }
  }
}

impl Transport for WsTransport {
  fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
    let (sink, stream) = self.stream.split();
    (Box::new(WsReader { stream }), Box::new(WsWriter { sink }))
  }
}

struct WsReader {
  stream: SplitStream<WebSocketStream<TcpStream>>,
}

#[async_trait]
impl TransportReader for WsReader {
  async fn read_message(&mut self) -> anyhow::Result<Frame> {
    loop {
      match self.stream.next().await {
        None => bail!("connection reset by peer"),
        Some(Err(err)) => return Err(err.into()),
        Some(Ok(WsMessage::Binary(raw))) => return Ok(Frame::Binary(raw)),
        Some(Ok(WsMessage::Text(text))) => return Ok(Frame::Binary(text.into_bytes())),
        Some(Ok(WsMessage::Close(_))) => return Ok(Frame::Close),
        // Ping/pong control frames are answered by the protocol layer.
        Some(Ok(_)) => continue,
      }
    }
  }
}

struct WsWriter {
  sink: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
}

#[async_trait]
impl TransportWriter for WsWriter {
  async fn write_message(&mut self, frame: Frame) -> anyhow::Result<()> {
    match frame {
      Frame::Binary(raw) => self.sink.send(WsMessage::Binary(raw)).await?,
      Frame::Close => self.sink.send(WsMessage::Close(None)).await?,
    }
    Ok(())
  }

  async fn close(&mut self) -> anyhow::Result<()> {
    self.sink.close().await?;
    Ok(())
  }
}

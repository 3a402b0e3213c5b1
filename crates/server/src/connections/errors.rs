// SPDX-License-Identifier: AGPL-3.0-only

use std::fmt::Display;
use std::time::Duration;

use tether_protocol::ProtocolError;

/// A connection-scoped failure.
///
/// Only transport failures are fatal to their connection; everything else
/// is surfaced to the caller or the handler and the connection keeps
/// running. No variant ever terminates the process.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnError {
  /// A malformed wire message.
  Protocol(ProtocolError),

  /// An underlying read/write failure. Fatal: closes the connection.
  Transport(String),

  /// The write loop did not accept the message within the enqueue timeout.
  RequestTimeout(Duration),

  /// No correlated response arrived within the response timeout.
  ResponseTimeout(Duration),

  /// The operation targeted an already-closed connection.
  Closed,

  /// The operation targeted a closed connection manager.
  ManagerClosed,

  /// A Response frame arrived with no matching pending request.
  UnexpectedResponse,

  /// A connection could not be unregistered from its shard. Defensive:
  /// raised only when an internal invariant is violated.
  Unregister(String),
}

// ===== impl ConnError =====

impl ConnError {
  /// Tells whether the error is fatal to the connection.
  pub fn is_fatal(&self) -> bool {
    matches!(self, Self::Transport(_))
  }

  pub(crate) fn transport(err: impl Display) -> Self {
    Self::Transport(err.to_string())
  }
}

impl Display for ConnError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Protocol(err) => write!(f, "{}", err),
      Self::Transport(detail) => write!(f, "transport error: {}", detail),
      Self::RequestTimeout(timeout) => write!(f, "request timed out for {:?}", timeout),
      Self::ResponseTimeout(timeout) => write!(f, "response timed out for {:?}", timeout),
      Self::Closed => write!(f, "connection is closed"),
      Self::ManagerClosed => write!(f, "connection manager is closed"),
      Self::UnexpectedResponse => {
        write!(f, "unexpected response message received, probably due to response timeout?")
      },
      Self::Unregister(detail) => write!(f, "failed to unregister connection: {}", detail),
    }
  }
}

impl std::error::Error for ConnError {}

impl From<ProtocolError> for ConnError {
  fn from(err: ProtocolError) -> Self {
    Self::Protocol(err)
  }
}

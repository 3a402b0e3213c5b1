// SPDX-License-Identifier: AGPL-3.0-only

use std::fmt::Display;

use crate::error::ProtocolError;

/// The discriminator of a wire message.
///
/// `Connect` and `Disconnect` are synthetic lifecycle signals: they are
/// dispatched to handlers when a connection starts or closes and are never
/// required on the wire.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum MessageKind {
  /// A device-initiated payload upload.
  Upload = 1,

  /// A server-initiated request that awaits a correlated response.
  Request = 2,

  /// A fire-and-forget server-to-device send.
  Send = 3,

  /// The reply to an outstanding request, correlated by message id.
  Response = 4,

  /// Synthetic connection-established signal.
  Connect = 8,

  /// Synthetic connection-closed signal.
  Disconnect = 9,
}

// ===== impl MessageKind =====

impl MessageKind {
  /// Returns the wire discriminant of the kind.
  pub fn as_u8(self) -> u8 {
    self as u8
  }

  /// Returns the lowercase name of the kind.
  pub fn as_str(self) -> &'static str {
    match self {
      MessageKind::Upload => "upload",
      MessageKind::Request => "request",
      MessageKind::Send => "send",
      MessageKind::Response => "response",
      MessageKind::Connect => "connect",
      MessageKind::Disconnect => "disconnect",
    }
  }

  /// Tells whether the kind is a synthetic lifecycle signal.
  pub fn is_synthetic(self) -> bool {
    matches!(self, MessageKind::Connect | MessageKind::Disconnect)
  }

  /// Tells whether the kind requires a non-empty message id.
  pub fn requires_id(self) -> bool {
    matches!(self, MessageKind::Request | MessageKind::Response)
  }
}

impl TryFrom<i64> for MessageKind {
  type Error = ProtocolError;

  fn try_from(value: i64) -> Result<Self, Self::Error> {
    match value {
      1 => Ok(MessageKind::Upload),
      2 => Ok(MessageKind::Request),
      3 => Ok(MessageKind::Send),
      4 => Ok(MessageKind::Response),
      8 => Ok(MessageKind::Connect),
      9 => Ok(MessageKind::Disconnect),
      other => Err(ProtocolError::UnsupportedKind(other)),
    }
  }
}

impl Display for MessageKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

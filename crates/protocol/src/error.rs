// SPDX-License-Identifier: AGPL-3.0-only

use std::fmt::Display;

use crate::kind::MessageKind;

/// A malformed wire message.
///
/// Protocol errors are always surfaced to the caller and never retried;
/// they are not fatal to the connection that produced them.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolError {
  /// The kind integer is not one of the defined values.
  UnsupportedKind(i64),

  /// The kind prefix is not an integer at all.
  InvalidKind(String),

  /// A payload-bearing kind was encoded without a payload.
  MissingPayload(MessageKind),

  /// A Request/Response was encoded without a message id.
  MissingId(MessageKind),

  /// A Request/Response was decoded with an empty message id.
  EmptyId(MessageKind),

  /// The raw message does not contain two structural separators.
  SeparatorCount(usize),
}

// ===== impl ProtocolError =====

impl Display for ProtocolError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::UnsupportedKind(kind) => write!(f, "unsupported message kind {}", kind),
      Self::InvalidKind(raw) => write!(f, "invalid message kind: {}", raw),
      Self::MissingPayload(kind) => write!(f, "missing payload for message kind {}", kind),
      Self::MissingId(kind) => write!(f, "missing message id for message kind {}", kind),
      Self::EmptyId(kind) => write!(f, "empty message id for message kind {}", kind),
      Self::SeparatorCount(count) => write!(f, "expected 2 separators instead of {}", count),
    }
  }
}

impl std::error::Error for ProtocolError {}

// SPDX-License-Identifier: AGPL-3.0-only

use tether_util::id;
use tether_util::string_atom::StringAtom;

use crate::error::ProtocolError;
use crate::kind::MessageKind;

/// The structural separator of the wire format.
pub const SEPARATOR: u8 = b'|';

/// An immutable unit of wire exchange.
///
/// Wire format: `<kind-int>|<id>|<payload-bytes>`. Only the first two
/// separator occurrences are structural; the payload may contain the
/// separator byte.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
  kind: MessageKind,
  id: StringAtom,
  payload: Option<Vec<u8>>,
}

// ===== impl Message =====

impl Message {
  /// Creates a new message with the given kind, id and payload.
  ///
  /// An empty id is permitted for every kind except Request/Response;
  /// `marshal` fills it with a generated time-based hexadecimal id.
  pub fn new(kind: MessageKind, id: impl Into<StringAtom>, payload: Vec<u8>) -> Self {
    Self { kind, id: id.into(), payload: Some(payload) }
  }

  /// Creates the synthetic connection-established message.
  pub fn connect() -> Self {
    Self { kind: MessageKind::Connect, id: StringAtom::default(), payload: None }
  }

  /// Creates the synthetic connection-closed message.
  pub fn disconnect() -> Self {
    Self { kind: MessageKind::Disconnect, id: StringAtom::default(), payload: None }
  }

  pub fn kind(&self) -> MessageKind {
    self.kind
  }

  pub fn id(&self) -> &StringAtom {
    &self.id
  }

  pub fn payload(&self) -> &[u8] {
    self.payload.as_deref().unwrap_or_default()
  }

  /// Consumes the message, returning its payload.
  pub fn into_payload(self) -> Vec<u8> {
    self.payload.unwrap_or_default()
  }

  /// Encodes the message into its wire representation.
  ///
  /// An empty id is filled with a generated one (never overwritten), except
  /// for Request/Response where a missing id is an error. A missing payload
  /// is an error for every kind except Connect/Disconnect, which get an
  /// empty one.
  pub fn marshal(&mut self) -> Result<Vec<u8>, ProtocolError> {
    if self.payload.is_none() {
      if !self.kind.is_synthetic() {
        return Err(ProtocolError::MissingPayload(self.kind));
      }
      self.payload = Some(Vec::new());
    }

    if self.id.is_empty() {
      if self.kind.requires_id() {
        return Err(ProtocolError::MissingId(self.kind));
      }
      self.id = id::next_id();
    }

    let payload = self.payload.as_deref().unwrap_or_default();

    let mut raw = Vec::with_capacity(4 + self.id.len() + payload.len());
    raw.extend_from_slice(self.kind.as_u8().to_string().as_bytes());
    raw.push(SEPARATOR);
    raw.extend_from_slice(self.id.as_bytes());
    raw.push(SEPARATOR);
    raw.extend_from_slice(payload);

    Ok(raw)
  }
}

/// Decodes a message from its wire representation.
///
/// The first separator splits the kind from the id, the second splits the id
/// from the payload; any further separator bytes belong to the payload. A
/// body with fewer than two separators is valid only for the synthetic
/// Connect/Disconnect kinds, which decode to an empty id and payload.
pub fn unmarshal(raw: &[u8]) -> Result<Message, ProtocolError> {
  let mut separators = 0;
  let mut first = 0;
  let mut second = 0;

  for (idx, b) in raw.iter().enumerate() {
    if *b != SEPARATOR {
      continue;
    }
    separators += 1;
    if separators == 1 {
      first = idx;
    } else {
      second = idx;
      break;
    }
  }

  let kind_bytes = if separators == 0 { raw } else { &raw[..first] };
  let kind_str = String::from_utf8_lossy(kind_bytes);
  let kind_int = kind_str.parse::<i64>().map_err(|_| ProtocolError::InvalidKind(kind_str.into_owned()))?;
  let kind = MessageKind::try_from(kind_int)?;

  if separators < 2 {
    if kind.is_synthetic() {
      return Ok(Message { kind, id: StringAtom::default(), payload: Some(Vec::new()) });
    }
    return Err(ProtocolError::SeparatorCount(separators));
  }

  let id_bytes = &raw[first + 1..second];
  let id = StringAtom::from(String::from_utf8_lossy(id_bytes).as_ref());

  let id = if id.is_empty() {
    if kind.requires_id() {
      return Err(ProtocolError::EmptyId(kind));
    }
    id::next_id()
  } else {
    id
  };

  Ok(Message { kind, id, payload: Some(raw[second + 1..].to_vec()) })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_round_trip_preserves_provided_id() {
    let mut msg = Message::new(MessageKind::Request, "abc123", b"ping".to_vec());
    let raw = msg.marshal().unwrap();
    assert_eq!(raw, b"2|abc123|ping");

    let decoded = unmarshal(&raw).unwrap();
    assert_eq!(decoded, msg);
  }

  #[test]
  fn test_marshal_fills_empty_id_only() {
    let mut msg = Message::new(MessageKind::Send, "", b"hi".to_vec());
    let raw = msg.marshal().unwrap();

    // The generated id is written back into the message, never regenerated.
    assert!(!msg.id().is_empty());
    let decoded = unmarshal(&raw).unwrap();
    assert_eq!(decoded.id(), msg.id());
    assert_eq!(decoded.payload(), b"hi");
    assert_eq!(decoded.kind(), MessageKind::Send);
  }

  #[test]
  fn test_payload_preserves_embedded_separators() {
    let decoded = unmarshal(b"2|1|abc|def").unwrap();
    assert_eq!(decoded.kind(), MessageKind::Request);
    assert_eq!(decoded.id().as_ref(), "1");
    assert_eq!(decoded.payload(), b"abc|def");
  }

  #[test]
  fn test_marshal_missing_payload() {
    let mut msg = Message { kind: MessageKind::Upload, id: StringAtom::from("1"), payload: None };
    let err = msg.marshal().unwrap_err();
    assert_eq!(err, ProtocolError::MissingPayload(MessageKind::Upload));
    assert_eq!(err.to_string(), "missing payload for message kind upload");
  }

  #[test]
  fn test_marshal_missing_id_for_request_and_response() {
    for kind in [MessageKind::Request, MessageKind::Response] {
      let mut msg = Message::new(kind, "", b"x".to_vec());
      assert_eq!(msg.marshal().unwrap_err(), ProtocolError::MissingId(kind));
    }
  }

  #[test]
  fn test_marshal_synthetic_kinds_without_payload() {
    let mut msg = Message::disconnect();
    let raw = msg.marshal().unwrap();
    let decoded = unmarshal(&raw).unwrap();
    assert_eq!(decoded.kind(), MessageKind::Disconnect);
    assert!(decoded.payload().is_empty());
  }

  #[test]
  fn test_unmarshal_unsupported_kind() {
    let err = unmarshal(b"7|1|x").unwrap_err();
    assert_eq!(err, ProtocolError::UnsupportedKind(7));
    assert_eq!(err.to_string(), "unsupported message kind 7");
  }

  #[test]
  fn test_unmarshal_non_numeric_kind() {
    assert!(matches!(unmarshal(b"x|1|x").unwrap_err(), ProtocolError::InvalidKind(_)));
  }

  #[test]
  fn test_unmarshal_separator_count() {
    let err = unmarshal(b"1|no-second-separator").unwrap_err();
    assert_eq!(err, ProtocolError::SeparatorCount(1));
    assert_eq!(err.to_string(), "expected 2 separators instead of 1");

    assert_eq!(unmarshal(b"3").unwrap_err(), ProtocolError::SeparatorCount(0));
  }

  #[test]
  fn test_unmarshal_short_body_is_valid_for_synthetic_kinds() {
    let decoded = unmarshal(b"9").unwrap();
    assert_eq!(decoded.kind(), MessageKind::Disconnect);
    assert!(decoded.id().is_empty());
    assert!(decoded.payload().is_empty());

    let decoded = unmarshal(b"8|leftover").unwrap();
    assert_eq!(decoded.kind(), MessageKind::Connect);
    assert!(decoded.id().is_empty());
  }

  #[test]
  fn test_unmarshal_empty_id() {
    for (raw, kind) in [(b"2||x".as_slice(), MessageKind::Request), (b"4||x".as_slice(), MessageKind::Response)] {
      assert_eq!(unmarshal(raw).unwrap_err(), ProtocolError::EmptyId(kind));
    }

    // Other kinds get a generated id instead.
    let decoded = unmarshal(b"1||data").unwrap();
    assert!(!decoded.id().is_empty());
    assert_eq!(decoded.payload(), b"data");
  }
}

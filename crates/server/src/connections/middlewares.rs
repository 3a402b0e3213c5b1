// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connections::conn::MessageHandler;
use crate::connections::middleware::Middleware;

/// The name the access-logging middleware is registered under.
pub const ACCESS_LOGGING: &str = "access-logging";

/// An access-logging middleware: logs every dispatched message and every
/// connection error with structured fields, then forwards to the next
/// handler.
pub fn access_logging() -> Middleware {
  Middleware::new(ACCESS_LOGGING, |next: MessageHandler| {
    Arc::new(move |conn, msg, err| {
      if let Some(err) = err {
        warn!(
          identifier = %conn.identifier(),
          connection_type = conn.connection_type(),
          error = %err,
          "connection error"
        );
      } else if let Some(msg) = msg {
        debug!(
          identifier = %conn.identifier(),
          connection_type = conn.connection_type(),
          kind = %msg.kind(),
          message_id = %msg.id(),
          payload_length = msg.payload().len(),
          "message dispatched"
        );
      }

      next(conn, msg, err);
    })
  })
}

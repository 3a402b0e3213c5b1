// SPDX-License-Identifier: AGPL-3.0-only

mod error;
mod kind;
mod message;

pub use error::ProtocolError;
pub use kind::MessageKind;
pub use message::{Message, SEPARATOR, unmarshal};

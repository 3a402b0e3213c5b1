// SPDX-License-Identifier: AGPL-3.0-only

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Metric names used throughout the server
pub mod names {
  /// Number of clients currently registered across all managers
  pub const CONNECTIONS_CONNECTED: &str = "tether_connections_connected";

  /// Total number of messages received from clients
  pub const MESSAGES_RECEIVED: &str = "tether_messages_received_total";

  /// Total number of messages written to clients
  pub const MESSAGES_SENT: &str = "tether_messages_sent_total";
}

/// Increment the connected-clients gauge
pub fn connection_registered() {
  gauge!(names::CONNECTIONS_CONNECTED).increment(1.0);
}

/// Decrement the connected-clients gauge
pub fn connection_unregistered() {
  gauge!(names::CONNECTIONS_CONNECTED).decrement(1.0);
}

/// Count one inbound message
pub fn message_received(connection_type: &'static str) {
  counter!(names::MESSAGES_RECEIVED, "connection_type" => connection_type).increment(1);
}

/// Count one outbound message
pub fn message_sent(connection_type: &'static str) {
  counter!(names::MESSAGES_SENT, "connection_type" => connection_type).increment(1);
}

/// Describes all metrics (should be called after installing the exporter)
pub fn describe_metrics() {
  describe_gauge!(names::CONNECTIONS_CONNECTED, "Number of clients currently registered across all managers");
  describe_counter!(names::MESSAGES_RECEIVED, "Total number of messages received from clients");
  describe_counter!(names::MESSAGES_SENT, "Total number of messages written to clients");
}

// SPDX-License-Identifier: AGPL-3.0-only

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use parking_lot::RwLock as PlRwLock;
use tracing::info;

use tether_util::string_atom::StringAtom;

use crate::connections::conn::ConnectionConfig;
use crate::connections::manager::ConnectionManager;

/// The named set of connection managers owned by the server's top-level
/// context: one manager per logical channel.
///
/// Once closed, the registry refuses new managers; closing drains every
/// manager concurrently.
pub struct ConnectionRegistry {
  config: Arc<ConnectionConfig>,
  inner: PlRwLock<RegistryInner>,
}

struct RegistryInner {
  closed: bool,
  managers: HashMap<StringAtom, Arc<ConnectionManager>>,
}

// ===== impl ConnectionRegistry =====

impl ConnectionRegistry {
  pub fn new(config: ConnectionConfig) -> Arc<Self> {
    Arc::new(Self {
      config: Arc::new(config),
      inner: PlRwLock::new(RegistryInner { closed: false, managers: HashMap::new() }),
    })
  }

  /// Creates one manager per channel id.
  pub fn initialize(&self, ids: impl IntoIterator<Item = impl Into<StringAtom>>) -> anyhow::Result<()> {
    for id in ids {
      self.new_connection_manager(id)?;
    }
    Ok(())
  }

  /// Creates and registers a new connection manager under the given id.
  pub fn new_connection_manager(&self, id: impl Into<StringAtom>) -> anyhow::Result<Arc<ConnectionManager>> {
    let id = id.into();

    let mut inner = self.inner.write();

    if inner.closed {
      bail!("connection registry is closed");
    }
    if inner.managers.contains_key(&id) {
      bail!("connection manager {} already initialized", id);
    }

    let manager = ConnectionManager::new(id.clone(), self.config.clone());
    inner.managers.insert(id.clone(), manager.clone());

    info!(manager = %id, "connection manager initialized");

    Ok(manager)
  }

  pub fn find_connection_manager(&self, id: &str) -> Option<Arc<ConnectionManager>> {
    self.inner.read().managers.get(&StringAtom::from(id)).cloned()
  }

  /// Removes and drains the named manager.
  pub async fn close_connection_manager(&self, id: &str) -> anyhow::Result<()> {
    let manager = {
      let mut inner = self.inner.write();
      match inner.managers.remove(&StringAtom::from(id)) {
        Some(manager) => manager,
        None => bail!("connection manager {} is not found", id),
      }
    };

    manager.close().await;
    Ok(())
  }

  /// Returns the per-manager connection counts and their total.
  pub fn counts(&self) -> (HashMap<StringAtom, usize>, usize) {
    let managers: Vec<_> = self.inner.read().managers.values().cloned().collect();

    let mut counts = HashMap::with_capacity(managers.len());
    let mut total = 0;
    for manager in managers {
      let count = manager.count();
      total += count;
      counts.insert(manager.id(), count);
    }

    (counts, total)
  }

  /// Latches the registry closed and drains every manager concurrently.
  pub async fn close(&self) {
    let managers: Vec<_> = {
      let mut inner = self.inner.write();
      inner.closed = true;
      inner.managers.drain().map(|(_, manager)| manager).collect()
    };

    let mut tasks = Vec::with_capacity(managers.len());
    for manager in managers {
      tasks.push(tokio::spawn(async move { manager.close().await }));
    }
    for task in tasks {
      let _ = task.await;
    }

    info!("connection registry closed");
  }
}

#[cfg(test)]
mod tests {
  use crate::connections::conn::Metadata;
  use crate::connections::testing::{mock_transport, recording_handler};

  use super::*;

  #[tokio::test]
  async fn test_duplicate_manager_id_is_refused() {
    let registry = ConnectionRegistry::new(ConnectionConfig::default());

    registry.new_connection_manager("home").unwrap();
    let err = registry.new_connection_manager("home").unwrap_err();
    assert_eq!(err.to_string(), "connection manager home already initialized");
  }

  #[tokio::test]
  async fn test_find_connection_manager() {
    let registry = ConnectionRegistry::new(ConnectionConfig::default());
    registry.initialize(["home", "lab"]).unwrap();

    assert!(registry.find_connection_manager("home").is_some());
    assert!(registry.find_connection_manager("lab").is_some());
    assert!(registry.find_connection_manager("garage").is_none());
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_counts_aggregate_across_managers() {
    let registry = ConnectionRegistry::new(ConnectionConfig::default());
    registry.initialize(["home", "lab"]).unwrap();

    let home = registry.find_connection_manager("home").unwrap();
    let lab = registry.find_connection_manager("lab").unwrap();

    let mut remotes = Vec::new();
    for i in 0..3 {
      let (transport, remote) = mock_transport();
      let (handler, _) = recording_handler();
      home.new_websocket_connection(format!("dev-{}", i).as_str(), transport, handler, Metadata::new()).await.unwrap();
      remotes.push(remote);
    }
    let (transport, remote) = mock_transport();
    let (handler, _) = recording_handler();
    lab.new_websocket_connection("dev-0", transport, handler, Metadata::new()).await.unwrap();
    remotes.push(remote);

    let (counts, total) = registry.counts();
    assert_eq!(total, 4);
    assert_eq!(counts.get(&StringAtom::from("home")), Some(&3));
    assert_eq!(counts.get(&StringAtom::from("lab")), Some(&1));

    registry.close().await;
  }

  #[tokio::test]
  async fn test_close_refuses_new_managers() {
    let registry = ConnectionRegistry::new(ConnectionConfig::default());
    registry.initialize(["home"]).unwrap();

    registry.close().await;

    let err = registry.new_connection_manager("lab").unwrap_err();
    assert_eq!(err.to_string(), "connection registry is closed");
    assert!(registry.find_connection_manager("home").is_none());
  }

  #[tokio::test]
  async fn test_close_connection_manager() {
    let registry = ConnectionRegistry::new(ConnectionConfig::default());
    registry.initialize(["home"]).unwrap();

    registry.close_connection_manager("home").await.unwrap();
    assert!(registry.find_connection_manager("home").is_none());

    let err = registry.close_connection_manager("home").await.unwrap_err();
    assert_eq!(err.to_string(), "connection manager home is not found");
  }
}

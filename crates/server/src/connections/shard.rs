// SPDX-License-Identifier: AGPL-3.0-only

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as PlMutex;

use tether_util::string_atom::StringAtom;

use crate::connections::conn::Connection;
use crate::connections::errors::ConnError;
use crate::telemetry::metrics;

/// One lock-partitioned bucket of a manager's connection registry.
///
/// The shard exclusively owns the authoritative reference to each
/// registered connection; connections hold only a weak handle back, used
/// for unregistration.
pub(crate) struct Shard {
  inner: PlMutex<ShardInner>,
}

struct ShardInner {
  closed: bool,
  conns: HashMap<StringAtom, Arc<dyn Connection>>,
}

// ===== impl Shard =====

impl Shard {
  pub(crate) fn with_capacity(capacity: usize) -> Arc<Self> {
    Arc::new(Self { inner: PlMutex::new(ShardInner { closed: false, conns: HashMap::with_capacity(capacity) }) })
  }

  /// Installs a connection, atomically swapping out any live connection
  /// registered under the same identifier. At no instant do two
  /// connections answer for one identifier; the caller closes the returned
  /// superseded connection.
  pub(crate) fn register(&self, conn: Arc<dyn Connection>) -> Result<Option<Arc<dyn Connection>>, ConnError> {
    let replaced = {
      let mut inner = self.inner.lock();
      if inner.closed {
        return Err(ConnError::ManagerClosed);
      }
      inner.conns.insert(conn.identifier(), conn)
    };

    if replaced.is_none() {
      metrics::connection_registered();
    }

    Ok(replaced)
  }

  /// Removes the identifier's entry if it still belongs to the given
  /// connection incarnation. A successor registered under the same
  /// identifier is left untouched.
  pub(crate) fn unregister(&self, identifier: &StringAtom, request_id: u64) {
    let removed = {
      let mut inner = self.inner.lock();
      match inner.conns.get(identifier) {
        Some(existing) if existing.request_id() == request_id => inner.conns.remove(identifier),
        _ => None,
      }
    };

    if removed.is_some() {
      metrics::connection_unregistered();
    }
  }

  pub(crate) fn find(&self, identifier: &StringAtom) -> Option<Arc<dyn Connection>> {
    self.inner.lock().conns.get(identifier).cloned()
  }

  pub(crate) fn count(&self) -> usize {
    self.inner.lock().conns.len()
  }

  /// Appends every connection whose identifier sorts strictly after
  /// `last_id`.
  pub(crate) fn collect_after(&self, last_id: &str, out: &mut Vec<Arc<dyn Connection>>) {
    let inner = self.inner.lock();
    out.extend(inner.conns.iter().filter(|(id, _)| id.as_ref() > last_id).map(|(_, conn)| conn.clone()));
  }

  /// Marks the shard closed, then closes and joins every member
  /// concurrently. No registration succeeds afterwards.
  pub(crate) async fn close(&self) {
    let conns: Vec<_> = {
      let mut inner = self.inner.lock();
      inner.closed = true;
      inner.conns.values().cloned().collect()
    };

    let mut tasks = Vec::with_capacity(conns.len());
    for conn in conns {
      tasks.push(tokio::spawn(async move {
        conn.close();
        conn.wait().await;
      }));
    }
    for task in tasks {
      let _ = task.await;
    }
  }
}

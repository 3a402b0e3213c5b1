// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::Arc;

use parking_lot::Mutex as PlMutex;

use tether_util::string_atom::StringAtom;

use crate::connections::conn::MessageHandler;

/// A named message-handler decorator.
#[derive(Clone)]
pub struct Middleware {
  name: StringAtom,
  decorator: Arc<dyn Fn(MessageHandler) -> MessageHandler + Send + Sync>,
}

// ===== impl Middleware =====

impl Middleware {
  /// Creates a new middleware with the given name and decorator.
  pub fn new(
    name: impl Into<StringAtom>,
    decorator: impl Fn(MessageHandler) -> MessageHandler + Send + Sync + 'static,
  ) -> Self {
    Self { name: name.into(), decorator: Arc::new(decorator) }
  }

  pub fn name(&self) -> &StringAtom {
    &self.name
  }
}

impl std::fmt::Debug for Middleware {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Middleware").field("name", &self.name).finish()
  }
}

/// An ordered, mutable pipeline of middlewares.
///
/// The first element of the sequence is the outermost wrapper: it sees each
/// dispatch first on the way in and last on the way out.
#[derive(Debug, Default)]
pub struct MiddlewareStack {
  middlewares: PlMutex<Vec<Middleware>>,
}

// ===== impl MiddlewareStack =====

impl MiddlewareStack {
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends a middleware to the end of the sequence.
  pub fn use_middleware(&self, middleware: Middleware) {
    self.middlewares.lock().push(middleware);
  }

  /// Inserts a middleware immediately before the named anchor.
  ///
  /// Returns `false` without mutating the stack when the anchor is absent.
  pub fn insert_before(&self, middleware: Middleware, anchor: &str) -> bool {
    let mut middlewares = self.middlewares.lock();
    match Self::position(&middlewares, anchor) {
      Some(idx) => {
        middlewares.insert(idx, middleware);
        true
      },
      None => false,
    }
  }

  /// Inserts a middleware immediately after the named anchor.
  ///
  /// Returns `false` without mutating the stack when the anchor is absent.
  pub fn insert_after(&self, middleware: Middleware, anchor: &str) -> bool {
    let mut middlewares = self.middlewares.lock();
    match Self::position(&middlewares, anchor) {
      Some(idx) => {
        middlewares.insert(idx + 1, middleware);
        true
      },
      None => false,
    }
  }

  /// Removes the named middleware, preserving the order of the others.
  pub fn remove(&self, name: &str) -> bool {
    let mut middlewares = self.middlewares.lock();
    match Self::position(&middlewares, name) {
      Some(idx) => {
        middlewares.remove(idx);
        true
      },
      None => false,
    }
  }

  pub fn len(&self) -> usize {
    self.middlewares.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.middlewares.lock().is_empty()
  }

  /// Folds the sequence right-to-left around the final handler, so the
  /// first-added middleware wraps everything else.
  pub fn chain(&self, final_handler: Option<MessageHandler>) -> MessageHandler {
    let mut handler: MessageHandler = final_handler.unwrap_or_else(|| Arc::new(|_, _, _| {}));

    let middlewares = self.middlewares.lock();
    for middleware in middlewares.iter().rev() {
      handler = (middleware.decorator)(handler);
    }
    handler
  }

  fn position(middlewares: &[Middleware], name: &str) -> Option<usize> {
    middlewares.iter().position(|m| m.name.as_ref() == name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;

  fn tracing_middleware(name: &str, log: Arc<Mutex<Vec<String>>>) -> Middleware {
    let tag = name.to_string();
    Middleware::new(name, move |next: MessageHandler| {
      let log = log.clone();
      let tag = tag.clone();
      Arc::new(move |conn, msg, err| {
        log.lock().push(format!("{}-enter", tag));
        next(conn, msg, err);
        log.lock().push(format!("{}-exit", tag));
      })
    })
  }

  fn run_chain(stack: &MiddlewareStack, log: Arc<Mutex<Vec<String>>>) {
    let final_log = log.clone();
    let handler = stack.chain(Some(Arc::new(move |_, _, _| {
      final_log.lock().push("final".to_string());
    })));

    let conn = crate::connections::testing::NullConnection::default();
    handler(&conn, None, None);
  }

  #[test]
  fn test_first_added_wraps_outermost() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let stack = MiddlewareStack::new();
    stack.use_middleware(tracing_middleware("a", log.clone()));
    stack.use_middleware(tracing_middleware("b", log.clone()));

    run_chain(&stack, log.clone());

    assert_eq!(*log.lock(), vec!["a-enter", "b-enter", "final", "b-exit", "a-exit"]);
  }

  #[test]
  fn test_insert_before_and_after() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let stack = MiddlewareStack::new();
    stack.use_middleware(tracing_middleware("b", log.clone()));

    assert!(stack.insert_before(tracing_middleware("a", log.clone()), "b"));
    assert!(stack.insert_after(tracing_middleware("c", log.clone()), "b"));

    run_chain(&stack, log.clone());

    assert_eq!(*log.lock(), vec!["a-enter", "b-enter", "c-enter", "final", "c-exit", "b-exit", "a-exit"]);
  }

  #[test]
  fn test_insert_with_absent_anchor_is_a_noop() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let stack = MiddlewareStack::new();
    stack.use_middleware(tracing_middleware("a", log.clone()));

    assert!(!stack.insert_before(tracing_middleware("x", log.clone()), "missing"));
    assert!(!stack.insert_after(tracing_middleware("y", log.clone()), "missing"));
    assert_eq!(stack.len(), 1);
  }

  #[test]
  fn test_remove_preserves_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let stack = MiddlewareStack::new();
    stack.use_middleware(tracing_middleware("a", log.clone()));
    stack.use_middleware(tracing_middleware("b", log.clone()));
    stack.use_middleware(tracing_middleware("c", log.clone()));

    assert!(stack.remove("b"));
    assert!(!stack.remove("b"));

    run_chain(&stack, log.clone());

    assert_eq!(*log.lock(), vec!["a-enter", "c-enter", "final", "c-exit", "a-exit"]);
  }

  #[test]
  fn test_chain_without_final_handler() {
    let stack = MiddlewareStack::new();
    let handler = stack.chain(None);

    let conn = crate::connections::testing::NullConnection::default();
    handler(&conn, None, None);
  }
}

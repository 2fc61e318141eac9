//! Registry of local methods the server may invoke.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::protocol::TypeHint;

/// Opaque value handed back to the callback on every dispatch.
pub type HandlerState = Option<Arc<dyn Any + Send + Sync>>;

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Handler callback. Errors are logged by the dispatcher and never stop
/// other handlers of the same method.
pub type HandlerFn =
    Arc<dyn Fn(Vec<Value>, HandlerState) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
pub(crate) struct HandlerEntry {
    key: u64,
    pub(crate) parameter_hints: Vec<TypeHint>,
    pub(crate) callback: HandlerFn,
    pub(crate) state: HandlerState,
}

/// The handlers of one method. Reified as its own allocation so a
/// [`Subscription`] stays valid even if the registry no longer references
/// the list.
pub(crate) struct HandlerList {
    entries: Mutex<Vec<HandlerEntry>>,
}

pub(crate) struct HandlerRegistry {
    methods: DashMap<String, Arc<HandlerList>>,
    next_key: AtomicU64,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            methods: DashMap::new(),
            next_key: AtomicU64::new(0),
        }
    }

    /// Appends a handler to the method's list. The per-key map update is
    /// atomic; concurrent registrations on one method append to the same
    /// shared list.
    pub(crate) fn register(
        &self,
        method: &str,
        parameter_hints: Vec<TypeHint>,
        callback: HandlerFn,
        state: HandlerState,
    ) -> Subscription {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let list = self
            .methods
            .entry(method.to_owned())
            .or_insert_with(|| {
                Arc::new(HandlerList {
                    entries: Mutex::new(Vec::new()),
                })
            })
            .clone();
        list.entries
            .lock()
            .expect("handler list lock poisoned")
            .push(HandlerEntry {
                key,
                parameter_hints,
                callback,
                state,
            });
        Subscription {
            method: method.to_owned(),
            key,
            list: Arc::downgrade(&list),
        }
    }

    /// Copy of the method's handlers, for dispatch outside the list lock.
    pub(crate) fn snapshot(&self, method: &str) -> Vec<HandlerEntry> {
        match self.methods.get(method) {
            Some(list) => list
                .entries
                .lock()
                .expect("handler list lock poisoned")
                .clone(),
            None => Vec::new(),
        }
    }

    /// Declared parameter hints of the method's first handler. First
    /// registration wins; later handlers are not merged in.
    pub(crate) fn parameter_hints(&self, method: &str) -> Vec<TypeHint> {
        match self.methods.get(method) {
            Some(list) => list
                .entries
                .lock()
                .expect("handler list lock poisoned")
                .first()
                .map(|entry| entry.parameter_hints.clone())
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

/// Handle to one registered handler. Dropping it removes exactly that
/// handler; dropping it after the handler is already gone does nothing.
pub struct Subscription {
    method: String,
    key: u64,
    list: Weak<HandlerList>,
}

impl Subscription {
    /// Method this subscription was registered for.
    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.entries
                .lock()
                .expect("handler list lock poisoned")
                .retain(|entry| entry.key != self.key);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("method", &self.method)
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    fn noop() -> HandlerFn {
        Arc::new(|_, _| async { Ok(()) }.boxed())
    }

    #[test]
    fn snapshot_reflects_registrations_and_drops() {
        let registry = HandlerRegistry::new();
        let first = registry.register("Notify", vec![], noop(), None);
        let second = registry.register("Notify", vec![], noop(), None);
        assert_eq!(registry.snapshot("Notify").len(), 2);

        drop(first);
        assert_eq!(registry.snapshot("Notify").len(), 1);
        drop(second);
        assert!(registry.snapshot("Notify").is_empty());
    }

    #[test]
    fn first_handler_hints_are_authoritative() {
        let registry = HandlerRegistry::new();
        let _first =
            registry.register("Notify", vec![TypeHint::Text], noop(), None);
        let _second =
            registry.register("Notify", vec![TypeHint::Int], noop(), None);
        assert_eq!(registry.parameter_hints("Notify"), vec![TypeHint::Text]);
    }

    #[test]
    fn unknown_method_has_no_hints() {
        let registry = HandlerRegistry::new();
        assert!(registry.parameter_hints("Nope").is_empty());
        assert!(registry.snapshot("Nope").is_empty());
    }

    #[test]
    fn drop_after_registry_is_gone_is_a_no_op() {
        let registry = HandlerRegistry::new();
        let subscription = registry.register("Notify", vec![], noop(), None);
        drop(registry);
        drop(subscription);
    }
}

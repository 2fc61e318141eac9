//! Correlation table for in-flight invocations.

use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use tokio_util::sync::CancellationToken;

use super::invocation::InvocationRequest;
use crate::error::{HubError, HubResult};
use crate::protocol::TypeHint;

/// Map and terminated flag live under one mutex: every insert observes the
/// session state in the same critical section shutdown runs in, so no entry
/// can slip in after shutdown has begun.
struct Inner {
    calls: AHashMap<String, Arc<InvocationRequest>>,
    terminated: bool,
}

pub(crate) struct PendingCalls {
    inner: Mutex<Inner>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                calls: AHashMap::new(),
                terminated: false,
            }),
        }
    }

    /// Registers a request. Fails when the session has terminated or the id
    /// is already taken; an existing entry is never disturbed.
    pub(crate) fn insert(
        &self,
        request: Arc<InvocationRequest>,
    ) -> HubResult<()> {
        let mut inner = self.inner.lock().expect("pending lock poisoned");
        if inner.terminated {
            return Err(HubError::ConnectionTerminated);
        }
        let id = request.id().to_owned();
        match inner.calls.entry(id) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                Err(HubError::DuplicateInvocationId(entry.key().clone()))
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(request);
                Ok(())
            }
        }
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<InvocationRequest>> {
        self.inner
            .lock()
            .expect("pending lock poisoned")
            .calls
            .remove(id)
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<InvocationRequest>> {
        self.inner
            .lock()
            .expect("pending lock poisoned")
            .calls
            .get(id)
            .cloned()
    }

    /// Declared result hint of a pending invocation, for the binder.
    pub(crate) fn result_hint(&self, id: &str) -> TypeHint {
        self.inner
            .lock()
            .expect("pending lock poisoned")
            .calls
            .get(id)
            .map_or(TypeHint::Unknown, |request| request.result_hint())
    }

    /// Re-opens the table for a fresh session.
    pub(crate) fn revive(&self) {
        let mut inner = self.inner.lock().expect("pending lock poisoned");
        debug_assert!(inner.calls.is_empty());
        inner.terminated = false;
    }

    /// Terminates the session: cancels the active signal and settles every
    /// entry exactly once, all inside the critical section. Returns whether
    /// this call performed the termination.
    pub(crate) fn shutdown(
        &self,
        active: &CancellationToken,
        error: Option<HubError>,
    ) -> bool {
        let mut inner = self.inner.lock().expect("pending lock poisoned");
        if inner.terminated {
            return false;
        }
        inner.terminated = true;
        active.cancel();
        for (_, request) in inner.calls.drain() {
            match &error {
                Some(error) => request.fail(error.clone()),
                None => request.complete(None, None),
            }
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("pending lock poisoned").calls.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn unary(
        id: &str,
    ) -> (
        Arc<InvocationRequest>,
        tokio::sync::oneshot::Receiver<HubResult<serde_json::Value>>,
    ) {
        InvocationRequest::unary(
            id.into(),
            TypeHint::Value,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn duplicate_id_is_refused_and_first_entry_survives() {
        let pending = PendingCalls::new();
        let (first, rx) = unary("1");
        let (second, _rx2) = unary("1");
        pending.insert(first).unwrap();
        assert_eq!(
            pending.insert(second).unwrap_err(),
            HubError::DuplicateInvocationId("1".into())
        );
        pending.get("1").unwrap().complete(Some(json!(1)), None);
        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn insert_after_shutdown_is_refused() {
        let pending = PendingCalls::new();
        let active = CancellationToken::new();
        assert!(pending.shutdown(&active, None));
        assert!(active.is_cancelled());
        let (request, _rx) = unary("1");
        assert_eq!(
            pending.insert(request).unwrap_err(),
            HubError::ConnectionTerminated
        );
    }

    #[tokio::test]
    async fn shutdown_fails_every_entry_once_and_empties_the_table() {
        let pending = PendingCalls::new();
        let (first, rx1) = unary("1");
        let (second, rx2) = unary("2");
        pending.insert(first).unwrap();
        pending.insert(second).unwrap();

        let active = CancellationToken::new();
        let error = HubError::Transport("gone".into());
        assert!(pending.shutdown(&active, Some(error.clone())));
        assert!(!pending.shutdown(&active, Some(error.clone())));

        assert_eq!(pending.len(), 0);
        assert_eq!(rx1.await.unwrap().unwrap_err(), error);
        assert_eq!(rx2.await.unwrap().unwrap_err(), error);
    }

    #[tokio::test]
    async fn result_hint_is_unknown_for_missing_entries() {
        let pending = PendingCalls::new();
        assert_eq!(pending.result_hint("9"), TypeHint::Unknown);
        let (request, _rx) = InvocationRequest::unary(
            "9".into(),
            TypeHint::Int,
            CancellationToken::new(),
        );
        pending.insert(request).unwrap();
        assert_eq!(pending.result_hint("9"), TypeHint::Int);
    }
}

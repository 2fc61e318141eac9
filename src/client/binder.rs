//! The connection's answers to the codec.

use std::sync::Arc;

use super::handlers::HandlerRegistry;
use super::pending::PendingCalls;
use crate::protocol::{Binder, TypeHint};

/// Binds inbound frames against the handler registry and the pending-call
/// table without exposing either to the codec.
pub(crate) struct ConnectionBinder {
    registry: Arc<HandlerRegistry>,
    pending: Arc<PendingCalls>,
}

impl ConnectionBinder {
    pub(crate) fn new(
        registry: Arc<HandlerRegistry>,
        pending: Arc<PendingCalls>,
    ) -> Self {
        Self { registry, pending }
    }
}

impl Binder for ConnectionBinder {
    fn parameter_hints(&self, target: &str) -> Vec<TypeHint> {
        self.registry.parameter_hints(target)
    }

    fn result_hint(&self, invocation_id: &str) -> TypeHint {
        self.pending.result_hint(invocation_id)
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of invocation correlation ids.
///
/// Ids only need to be unique within one session, but the default source is
/// process-local and monotonic, so ids also strictly increase when read as
/// integers. The trait exists so tests can force collisions.
pub trait InvocationIdSource: Send + Sync {
    fn next_id(&self) -> String;
}

/// Default source: a counter starting at 1, rendered in decimal.
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }
}

impl InvocationIdSource for SequentialIds {
    fn next_id(&self) -> String {
        (self.next.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

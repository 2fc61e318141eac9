//! Per-invocation state shared between the caller and the receive path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, HubResult};
use crate::protocol::TypeHint;

/// Where terminal frames for this invocation land.
///
/// The senders live behind a mutex so a terminal delivery can take them out,
/// which is what enforces at-most-once resolution together with the
/// `settled` flag.
enum Sink {
    Unary(Mutex<Option<oneshot::Sender<HubResult<Value>>>>),
    Stream(Mutex<Option<mpsc::Sender<HubResult<Value>>>>),
}

/// One registered invocation: its id, the declared result shape, the
/// completion sink, and the caller's cancellation observer.
pub(crate) struct InvocationRequest {
    id: String,
    result_hint: TypeHint,
    sink: Sink,
    /// Caller-supplied token. Once it fires, deliveries become no-ops.
    canceled: CancellationToken,
    /// Fired on terminal resolution or disposal, whichever comes first.
    done: CancellationToken,
    settled: AtomicBool,
}

impl InvocationRequest {
    /// Single-result invocation. Returns the request and the receiver the
    /// caller awaits.
    pub(crate) fn unary(
        id: String,
        result_hint: TypeHint,
        canceled: CancellationToken,
    ) -> (Arc<Self>, oneshot::Receiver<HubResult<Value>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                id,
                result_hint,
                sink: Sink::Unary(Mutex::new(Some(tx))),
                canceled,
                done: CancellationToken::new(),
                settled: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Streaming invocation with a bounded item queue.
    pub(crate) fn stream(
        id: String,
        result_hint: TypeHint,
        canceled: CancellationToken,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<HubResult<Value>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Arc::new(Self {
                id,
                result_hint,
                sink: Sink::Stream(Mutex::new(Some(tx))),
                canceled,
                done: CancellationToken::new(),
                settled: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn result_hint(&self) -> TypeHint {
        self.result_hint
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.is_cancelled()
    }

    /// Token fired once this request has resolved or been disposed.
    pub(crate) fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Enqueues one stream item. Returns whether the queue is still open.
    /// Waits for queue space; backpressure deliberately stalls the receive
    /// path.
    pub(crate) async fn stream_item(&self, item: Value) -> bool {
        if self.settled.load(Ordering::SeqCst) {
            return false;
        }
        let Sink::Stream(slot) = &self.sink else {
            return false;
        };
        let sender = slot.lock().expect("sink lock poisoned").clone();
        match sender {
            Some(sender) => sender.send(Ok(item)).await.is_ok(),
            None => false,
        }
    }

    /// Resolves the request from a completion frame: `error` fails it, a
    /// result succeeds it after a hint check, neither succeeds it empty.
    pub(crate) fn complete(&self, result: Option<Value>, error: Option<String>) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.done.cancel();
        match &self.sink {
            Sink::Unary(slot) => {
                let outcome = match (error, result) {
                    (Some(message), _) => Err(HubError::Server(message)),
                    (None, Some(value)) => {
                        if self.result_hint.matches(&value) {
                            Ok(value)
                        } else {
                            Err(HubError::Codec(format!(
                                "completion result does not match the declared {} hint",
                                self.result_hint
                            )))
                        }
                    }
                    (None, None) => Ok(Value::Null),
                };
                if let Some(tx) = slot.lock().expect("sink lock poisoned").take()
                {
                    let _ = tx.send(outcome);
                }
            }
            Sink::Stream(slot) => {
                let sender =
                    slot.lock().expect("sink lock poisoned").take();
                if let (Some(sender), Some(message)) = (sender, error) {
                    // Queue may be full at teardown; the close itself still
                    // reaches the reader through the dropped sender.
                    let _ = sender.try_send(Err(HubError::Server(message)));
                }
            }
        }
    }

    /// Fails the request with a local error.
    pub(crate) fn fail(&self, error: HubError) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.done.cancel();
        match &self.sink {
            Sink::Unary(slot) => {
                if let Some(tx) = slot.lock().expect("sink lock poisoned").take()
                {
                    let _ = tx.send(Err(error));
                }
            }
            Sink::Stream(slot) => {
                let sender =
                    slot.lock().expect("sink lock poisoned").take();
                if let Some(sender) = sender {
                    let _ = sender.try_send(Err(error));
                }
            }
        }
    }

    /// Releases the sink without delivering anything. Idempotent.
    pub(crate) fn dispose(&self) {
        self.settled.store(true, Ordering::SeqCst);
        self.done.cancel();
        match &self.sink {
            Sink::Unary(slot) => {
                slot.lock().expect("sink lock poisoned").take();
            }
            Sink::Stream(slot) => {
                slot.lock().expect("sink lock poisoned").take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn unary_resolves_once() {
        let (request, rx) = InvocationRequest::unary(
            "1".into(),
            TypeHint::Int,
            CancellationToken::new(),
        );
        request.complete(Some(json!(5)), None);
        request.complete(Some(json!(6)), None);
        request.fail(HubError::Canceled);
        assert_eq!(rx.await.unwrap().unwrap(), json!(5));
    }

    #[tokio::test]
    async fn unary_hint_mismatch_fails_the_call() {
        let (request, rx) = InvocationRequest::unary(
            "1".into(),
            TypeHint::Int,
            CancellationToken::new(),
        );
        request.complete(Some(json!("five")), None);
        assert!(matches!(rx.await.unwrap(), Err(HubError::Codec(_))));
    }

    #[tokio::test]
    async fn empty_completion_resolves_to_null() {
        let (request, rx) = InvocationRequest::unary(
            "1".into(),
            TypeHint::Unit,
            CancellationToken::new(),
        );
        request.complete(None, None);
        assert_eq!(rx.await.unwrap().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn stream_items_then_clean_close() {
        let (request, mut rx) = InvocationRequest::stream(
            "1".into(),
            TypeHint::Int,
            CancellationToken::new(),
            4,
        );
        assert!(request.stream_item(json!(10)).await);
        assert!(request.stream_item(json!(20)).await);
        request.complete(None, None);
        assert!(!request.stream_item(json!(30)).await);
        assert_eq!(rx.recv().await.unwrap().unwrap(), json!(10));
        assert_eq!(rx.recv().await.unwrap().unwrap(), json!(20));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_error_completion_surfaces_then_closes() {
        let (request, mut rx) = InvocationRequest::stream(
            "1".into(),
            TypeHint::Int,
            CancellationToken::new(),
            4,
        );
        request.complete(None, Some("boom".into()));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Err(HubError::Server(_))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_closes_the_sink() {
        let (request, rx) = InvocationRequest::unary(
            "1".into(),
            TypeHint::Value,
            CancellationToken::new(),
        );
        request.dispose();
        request.dispose();
        assert!(request.done_token().is_cancelled());
        assert!(rx.await.is_err());
    }
}

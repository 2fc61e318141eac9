//! The hub connection orchestrator.
//!
//! One [`HubConnection`] owns a single logical session: it starts a
//! transport, announces the codec, then multiplexes invocations, streams,
//! notifications and server-initiated calls over it until the transport goes
//! away.
//!
//! Locking is deliberately small: the async connection lock serializes
//! lifecycle transitions and every outbound frame, the pending-call table
//! has its own short critical section, and the two are only ever taken in
//! that order.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::binder::ConnectionBinder;
use super::handlers::{
    HandlerFuture, HandlerRegistry, HandlerState, Subscription,
};
use super::ids::{InvocationIdSource, SequentialIds};
use super::invocation::InvocationRequest;
use super::pending::PendingCalls;
use super::watchdog::Watchdog;
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::protocol::{HubMessage, HubProtocol, TypeHint, handshake};
use crate::transport::{Transport, TransportEvent, TransportFactory};

/// Inbound event queue depth between the transport and the receive task.
const EVENT_BUFFER: usize = 64;

type ClosedCallback = Arc<dyn Fn(Option<&HubError>) + Send + Sync>;

/// Builder for a [`HubConnection`].
pub struct HubConnectionBuilder {
    factory: Box<dyn TransportFactory>,
    protocol: Arc<dyn HubProtocol>,
    config: HubConfig,
    ids: Arc<dyn InvocationIdSource>,
}

impl HubConnectionBuilder {
    pub fn new(
        factory: impl TransportFactory + 'static,
        protocol: impl HubProtocol,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            protocol: Arc::new(protocol),
            config: HubConfig::default(),
            ids: Arc::new(SequentialIds::new()),
        }
    }

    /// Replaces the whole configuration, for example one loaded with
    /// [`HubConfig::load`].
    #[must_use]
    pub fn with_config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn server_timeout(mut self, timeout: Duration) -> Self {
        self.config.server_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Zero disables client keep-alive pings.
    #[must_use]
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval_ms = interval.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn stream_buffer(mut self, capacity: usize) -> Self {
        self.config.stream_buffer = capacity;
        self
    }

    /// Swaps the invocation id source.
    #[must_use]
    pub fn invocation_ids(mut self, ids: Arc<dyn InvocationIdSource>) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn build(self) -> HubConnection {
        HubConnection {
            core: Arc::new(Core {
                factory: self.factory,
                protocol: self.protocol,
                registry: Arc::new(HandlerRegistry::new()),
                pending: Arc::new(PendingCalls::new()),
                ids: self.ids,
                server_timeout_ms: Arc::new(AtomicU64::new(
                    self.config.server_timeout_ms,
                )),
                keep_alive_interval_ms: self.config.keep_alive_interval_ms,
                stream_buffer: self.config.stream_buffer,
                state: tokio::sync::Mutex::new(LifecycleState {
                    started: false,
                    disposed: false,
                    link: None,
                }),
                closed_callbacks: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Client endpoint of one hub session. Cheap to clone; clones share the
/// session.
#[derive(Clone)]
pub struct HubConnection {
    core: Arc<Core>,
}

struct LifecycleState {
    started: bool,
    disposed: bool,
    link: Option<Arc<Link>>,
}

/// Everything that exists only while connected.
struct Link {
    transport: Arc<dyn Transport>,
    /// Session-scoped signal, cancelled exactly once at shutdown.
    active: CancellationToken,
    watchdog: Watchdog,
    shutdown_done: AtomicBool,
}

struct Core {
    factory: Box<dyn TransportFactory>,
    protocol: Arc<dyn HubProtocol>,
    registry: Arc<HandlerRegistry>,
    pending: Arc<PendingCalls>,
    ids: Arc<dyn InvocationIdSource>,
    server_timeout_ms: Arc<AtomicU64>,
    keep_alive_interval_ms: u64,
    stream_buffer: usize,
    /// The connection lock: lifecycle transitions and all outbound frames.
    state: tokio::sync::Mutex<LifecycleState>,
    closed_callbacks: std::sync::Mutex<Vec<ClosedCallback>>,
}

impl HubConnection {
    /// Connects the transport, announces the codec and begins receiving.
    pub async fn start(&self) -> HubResult<()> {
        let core = &self.core;
        let mut state = core.state.lock().await;
        if state.disposed {
            return Err(HubError::Disposed);
        }
        if state.link.is_some() {
            return Err(HubError::AlreadyStarted);
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let transport: Arc<dyn Transport> = Arc::from(
            core.factory
                .connect(core.protocol.transfer_format(), events_tx)
                .await?,
        );
        core.pending.revive();

        let frame = handshake::handshake_frame(core.protocol.name())?;
        if let Err(send_error) = transport.send(frame).await {
            transport.close().await;
            return Err(HubError::HandshakeFailed(send_error.to_string()));
        }

        let needed = !transport.has_inherent_keep_alive();
        let watchdog = Watchdog::new(
            needed,
            Arc::clone(&core.server_timeout_ms),
            {
                let transport = Arc::clone(&transport);
                move |timeout| {
                    warn!(?timeout, "server idle timeout; aborting transport");
                    transport.abort(HubError::ServerTimeout(timeout));
                }
            },
        );
        watchdog.rearm();

        let link = Arc::new(Link {
            transport,
            active: CancellationToken::new(),
            watchdog,
            shutdown_done: AtomicBool::new(false),
        });
        tokio::spawn(Core::receive_loop(
            Arc::clone(&self.core),
            Arc::clone(&link),
            events_rx,
        ));
        if core.keep_alive_interval_ms > 0 {
            tokio::spawn(Core::keep_alive_loop(
                Arc::downgrade(&self.core),
                Arc::downgrade(&link),
                Duration::from_millis(core.keep_alive_interval_ms),
            ));
        }

        state.link = Some(link);
        state.started = true;
        info!(
            protocol = core.protocol.name(),
            keep_alive = !needed,
            "hub connection started"
        );
        Ok(())
    }

    /// Closes the transport and settles everything in flight.
    pub async fn stop(&self) -> HubResult<()> {
        let link = {
            let mut state = self.core.state.lock().await;
            if state.disposed {
                return Err(HubError::Disposed);
            }
            let link = state.link.take().ok_or(HubError::NotConnected)?;
            state.started = false;
            link
        };
        link.transport.close().await;
        self.core.shutdown(&link, None);
        Ok(())
    }

    /// Releases the connection. Safe to call any number of times.
    pub async fn dispose(&self) {
        let link = {
            let mut state = self.core.state.lock().await;
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.started = false;
            state.link.take()
        };
        if let Some(link) = link {
            link.transport.close().await;
            self.core.shutdown(&link, None);
        }
    }

    /// Registers a handler the server can invoke. Dropping the returned
    /// [`Subscription`] removes exactly this handler.
    ///
    /// The parameter hints of the *first* handler registered for a method
    /// are what inbound frames bind against; later handlers are not merged.
    pub fn on(
        &self,
        method: &str,
        parameter_hints: Vec<TypeHint>,
        callback: impl Fn(Vec<Value>, HandlerState) -> HandlerFuture
        + Send
        + Sync
        + 'static,
        state: HandlerState,
    ) -> Subscription {
        self.core
            .registry
            .register(method, parameter_hints, Arc::new(callback), state)
    }

    /// Runs `callback` once when the session ends, with the terminating
    /// error if there was one.
    pub fn on_closed(
        &self,
        callback: impl Fn(Option<&HubError>) + Send + Sync + 'static,
    ) {
        self.core
            .closed_callbacks
            .lock()
            .expect("closed callbacks lock poisoned")
            .push(Arc::new(callback));
    }

    /// Fire-and-forget notification. No id is allocated and nothing is
    /// tracked; the call resolves when the transport accepts the bytes.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> HubResult<()> {
        self.send_with(target, arguments, CancellationToken::new()).await
    }

    pub async fn send_with(
        &self,
        target: &str,
        arguments: Vec<Value>,
        token: CancellationToken,
    ) -> HubResult<()> {
        let state = self.core.state.lock().await;
        let link = ready_link(&state)?;
        if link.active.is_cancelled() {
            return Err(HubError::ConnectionTerminated);
        }
        if token.is_cancelled() {
            return Err(HubError::Canceled);
        }
        let message = HubMessage::Invocation {
            invocation_id: None,
            target: target.to_owned(),
            arguments,
            binding_error: None,
        };
        self.core.transmit(link, &message).await
    }

    /// Invokes a server method and awaits its single result.
    pub async fn invoke(
        &self,
        target: &str,
        result: TypeHint,
        arguments: Vec<Value>,
    ) -> HubResult<Value> {
        self.invoke_with(target, result, arguments, CancellationToken::new())
            .await
    }

    /// Like [`HubConnection::invoke`] with a caller cancellation token.
    /// Cancellation is local: the pending entry is dropped and the server's
    /// eventual completion is discarded, but no frame is sent.
    pub async fn invoke_with(
        &self,
        target: &str,
        result: TypeHint,
        arguments: Vec<Value>,
        token: CancellationToken,
    ) -> HubResult<Value> {
        let (request, mut response) = {
            let state = self.core.state.lock().await;
            let link = ready_link(&state)?;
            if link.active.is_cancelled() {
                return Err(HubError::ConnectionTerminated);
            }
            let id = self.core.ids.next_id();
            let (request, response) =
                InvocationRequest::unary(id.clone(), result, token.clone());
            self.core.pending.insert(Arc::clone(&request))?;
            let message = HubMessage::Invocation {
                invocation_id: Some(id),
                target: target.to_owned(),
                arguments,
                binding_error: None,
            };
            if let Err(send_error) = self.core.transmit(link, &message).await {
                self.core.pending.remove(request.id());
                request.dispose();
                return Err(send_error);
            }
            (request, response)
        };

        tokio::select! {
            biased;
            outcome = &mut response => {
                outcome.unwrap_or(Err(HubError::ConnectionTerminated))
            }
            () = token.cancelled() => {
                self.core.pending.remove(request.id());
                request.dispose();
                Err(HubError::Canceled)
            }
        }
    }

    /// Invokes a server streaming method. Returns immediately with the item
    /// channel; the stream ends when the server completes it, errors, the
    /// token fires, or the session shuts down.
    pub async fn stream(
        &self,
        target: &str,
        item: TypeHint,
        arguments: Vec<Value>,
    ) -> HubResult<HubStream> {
        self.stream_with(target, item, arguments, CancellationToken::new())
            .await
    }

    /// Like [`HubConnection::stream`] with a caller cancellation token.
    /// Cancellation completes the channel locally and, while the session is
    /// still active, sends a best-effort cancel frame to the server.
    pub async fn stream_with(
        &self,
        target: &str,
        item: TypeHint,
        arguments: Vec<Value>,
        token: CancellationToken,
    ) -> HubResult<HubStream> {
        let state = self.core.state.lock().await;
        let link = ready_link(&state)?;
        if link.active.is_cancelled() {
            return Err(HubError::ConnectionTerminated);
        }
        let id = self.core.ids.next_id();
        let (request, items) = InvocationRequest::stream(
            id.clone(),
            item,
            token.clone(),
            self.core.stream_buffer,
        );
        self.core.pending.insert(Arc::clone(&request))?;
        let message = HubMessage::StreamInvocation {
            invocation_id: id.clone(),
            target: target.to_owned(),
            arguments,
            binding_error: None,
        };
        if let Err(send_error) = self.core.transmit(link, &message).await {
            self.core.pending.remove(&id);
            request.dispose();
            return Err(send_error);
        }
        // The watcher holds weak references only; a live stream request must
        // not keep the connection alive.
        tokio::spawn(Core::stream_cancel_watcher(
            Arc::downgrade(&self.core),
            Arc::downgrade(link),
            id,
            token,
            request.done_token(),
        ));
        Ok(HubStream { items })
    }

    /// Current server-idle timeout.
    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(
            self.core.server_timeout_ms.load(Ordering::Relaxed),
        )
    }

    /// Updates the server-idle timeout. Takes effect at the next watchdog
    /// rearm, so at the next inbound frame.
    pub fn set_server_timeout(&self, timeout: Duration) {
        self.core
            .server_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }
}

fn ready_link(state: &LifecycleState) -> HubResult<&Arc<Link>> {
    if state.disposed {
        return Err(HubError::Disposed);
    }
    if !state.started {
        return Err(HubError::NotStarted);
    }
    state.link.as_ref().ok_or(HubError::NotConnected)
}

impl Core {
    /// Serializes and writes one frame. Caller holds the connection lock.
    async fn transmit(
        &self,
        link: &Link,
        message: &HubMessage,
    ) -> HubResult<()> {
        let frame = self.protocol.write_message(message)?;
        link.transport.send(frame).await
    }

    async fn receive_loop(
        core: Arc<Core>,
        link: Arc<Link>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let binder =
            ConnectionBinder::new(Arc::clone(&core.registry), Arc::clone(&core.pending));
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Data(batch) => {
                    link.watchdog.rearm();
                    let messages =
                        match core.protocol.parse_messages(&batch, &binder) {
                            Ok(messages) => messages,
                            Err(fatal @ HubError::ProtocolViolation(_)) => {
                                error!(error = %fatal, "protocol violation; terminating");
                                link.transport.abort(fatal.clone());
                                core.shutdown(&link, Some(fatal));
                                return;
                            }
                            Err(soft) => {
                                warn!(error = %soft, "dropping undecodable inbound batch");
                                continue;
                            }
                        };
                    for message in messages {
                        if let Err(fatal) = core.dispatch(message).await {
                            error!(error = %fatal, "protocol violation; terminating");
                            link.transport.abort(fatal.clone());
                            core.shutdown(&link, Some(fatal));
                            return;
                        }
                    }
                }
                TransportEvent::Closed(error) => {
                    core.shutdown(&link, error);
                    return;
                }
            }
        }
        // Transport dropped its event channel without a closed event.
        core.shutdown(&link, None);
    }

    /// Routes one inbound message. An error return is fatal to the session.
    async fn dispatch(&self, message: HubMessage) -> HubResult<()> {
        match message {
            HubMessage::Invocation {
                target,
                arguments,
                binding_error,
                ..
            } => {
                if let Some(detail) = binding_error {
                    warn!(%target, error = %detail, "dropping invocation that does not bind");
                    return Ok(());
                }
                let handlers = self.registry.snapshot(&target);
                if handlers.is_empty() {
                    warn!(%target, "no handler registered for invocation");
                    return Ok(());
                }
                for entry in handlers {
                    let outcome = (entry.callback)(
                        arguments.clone(),
                        entry.state.clone(),
                    )
                    .await;
                    if let Err(handler_error) = outcome {
                        warn!(%target, error = %handler_error, "invocation handler failed");
                    }
                }
                Ok(())
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let Some(request) = self.pending.remove(&invocation_id) else {
                    debug!(%invocation_id, "dropping completion for unknown invocation");
                    return Ok(());
                };
                if request.is_canceled() {
                    debug!(%invocation_id, "dropping completion for canceled invocation");
                    request.dispose();
                    return Ok(());
                }
                request.complete(result, error);
                Ok(())
            }
            HubMessage::StreamItem {
                invocation_id,
                item,
            } => {
                let Some(request) = self.pending.get(&invocation_id) else {
                    debug!(%invocation_id, "dropping stream item for unknown invocation");
                    return Ok(());
                };
                if request.is_canceled() {
                    debug!(%invocation_id, "dropping stream item for canceled invocation");
                    return Ok(());
                }
                let hint = request.result_hint();
                if !hint.matches(&item) {
                    warn!(%invocation_id, %hint, "dropping stream item that does not bind");
                    return Ok(());
                }
                if !request.stream_item(item).await {
                    debug!(%invocation_id, "stream queue closed; item dropped");
                }
                Ok(())
            }
            HubMessage::Ping => Ok(()),
            other @ (HubMessage::StreamInvocation { .. }
            | HubMessage::CancelInvocation { .. }) => {
                Err(HubError::ProtocolViolation(format!(
                    "client cannot receive a {} message",
                    other.kind()
                )))
            }
        }
    }

    /// Tears the session down at most once: settles the pending table under
    /// its lock, then fires the closed callbacks outside it.
    fn shutdown(&self, link: &Link, error: Option<HubError>) {
        if link.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        link.watchdog.dispose();
        self.pending.shutdown(&link.active, error.clone());

        let callbacks: Vec<ClosedCallback> = self
            .closed_callbacks
            .lock()
            .expect("closed callbacks lock poisoned")
            .clone();
        for callback in callbacks {
            let result =
                catch_unwind(AssertUnwindSafe(|| callback(error.as_ref())));
            if result.is_err() {
                error!("closed callback panicked");
            }
        }
        match &error {
            Some(error) => warn!(%error, "hub connection closed"),
            None => info!("hub connection closed"),
        }
    }

    async fn stream_cancel_watcher(
        core: Weak<Core>,
        link: Weak<Link>,
        invocation_id: String,
        token: CancellationToken,
        done: CancellationToken,
    ) {
        tokio::select! {
            () = done.cancelled() => {}
            () = token.cancelled() => {
                let Some(core) = core.upgrade() else { return };
                core.cancel_stream(&invocation_id, link).await;
            }
        }
    }

    /// Caller-side stream cancellation: resolve locally, then best-effort
    /// tell the server while the session is still active.
    async fn cancel_stream(&self, invocation_id: &str, link: Weak<Link>) {
        let Some(request) = self.pending.remove(invocation_id) else {
            return;
        };
        request.complete(None, None);

        let Some(link) = link.upgrade() else { return };
        if link.active.is_cancelled() {
            return;
        }
        let message = HubMessage::CancelInvocation {
            invocation_id: invocation_id.to_owned(),
        };
        let state = self.state.lock().await;
        let current = matches!(&state.link, Some(current) if Arc::ptr_eq(current, &link));
        if !current {
            return;
        }
        if let Err(send_error) = self.transmit(&link, &message).await {
            debug!(%invocation_id, error = %send_error, "cancel frame was not sent");
        }
    }

    async fn keep_alive_loop(
        core: Weak<Core>,
        link: Weak<Link>,
        interval: Duration,
    ) {
        let active = match link.upgrade() {
            Some(link) => link.active.clone(),
            None => return,
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = active.cancelled() => return,
                _ = ticker.tick() => {
                    let Some(core) = core.upgrade() else { return };
                    let Some(link) = link.upgrade() else { return };
                    let state = core.state.lock().await;
                    let current = matches!(&state.link, Some(current) if Arc::ptr_eq(current, &link));
                    if !current {
                        return;
                    }
                    if let Err(send_error) =
                        core.transmit(&link, &HubMessage::Ping).await
                    {
                        debug!(error = %send_error, "keep-alive ping failed");
                        return;
                    }
                }
            }
        }
    }
}

/// Item channel of a streaming invocation.
///
/// Yields `Ok(item)` per stream item, one final `Err` if the server
/// completed the stream with an error or the session died, and ends.
pub struct HubStream {
    items: mpsc::Receiver<HubResult<Value>>,
}

impl HubStream {
    pub async fn next(&mut self) -> Option<HubResult<Value>> {
        self.items.recv().await
    }
}

impl Stream for HubStream {
    type Item = HubResult<Value>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.items.poll_recv(cx)
    }
}

//! One end of an RPC conversation over a single duplex transport.
//!
//! A [`Session`] owns the message handler, the outstanding-request table, and
//! the lifecycle state machine `Created → Listening → Disconnecting →
//! Disconnected`.  Inbound requests are routed to the local [`Router`];
//! inbound responses are correlated to pending outbound calls; everything is
//! multiplexed concurrently over the one transport.
//!
//! Constructed through [`Session::builder`]; nothing moves until
//! [`Session::start_listening`] spawns the read loop.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};
use crate::framing::MessageHandler;
use crate::handler::Handler;
use crate::outstanding::OutstandingRequests;
use crate::router::{MethodOptions, NameTransform, Router};
use crate::types::{ErrorCode, Id, Request};

mod engine;
mod handle;

pub use handle::RequestHandle;

/// Reserved method name a peer uses to request cancellation of an in-flight
/// inbound request.  Handled by the engine; local targets never see it.
pub const CANCEL_REQUEST_METHOD: &str = "$/cancelRequest";

/// Why a session disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// This side disposed the session.
    LocallyDisposed,
    /// The remote peer closed the transport cleanly.
    RemoteEndClosed,
    /// The framing desynchronized and no further frame boundary can be
    /// trusted.
    ParseError,
    /// Transport I/O failed.
    StreamError,
    /// An unexpected engine failure.
    FatalException,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DisconnectReason::LocallyDisposed => "locally disposed",
            DisconnectReason::RemoteEndClosed => "remote end closed",
            DisconnectReason::ParseError => "parse error",
            DisconnectReason::StreamError => "stream error",
            DisconnectReason::FatalException => "fatal exception",
        };
        f.write_str(text)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Listening,
    Disconnecting,
    Disconnected,
}

/// Payload of the `Disconnected` event, delivered exactly once per session.
#[derive(Debug, Clone)]
pub struct DisconnectedEvent {
    pub description: String,
    pub reason: DisconnectReason,
    /// The error that triggered the disconnection, when there was one.
    pub error: Option<Arc<RpcError>>,
}

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bound on concurrently executing inbound dispatches.  `None` (the
    /// default) is unbounded.  When the bound is reached the read loop stops
    /// consuming frames until a dispatch finishes.
    pub max_concurrent_inbound: Option<usize>,
    /// The error code treated as "request cancelled" on both sides of the
    /// wire.  Peers that map cancellation differently can override it.
    pub cancellation_code: ErrorCode,
    /// How long disconnection waits for in-flight inbound dispatches before
    /// aborting them.  `None` waits indefinitely.
    pub graceful_shutdown_timeout: Option<Duration>,
    /// Log dropped notifications for unregistered methods at warn instead of
    /// debug.
    pub strict_notifications: bool,
    /// Runtime whose scheduler runs target futures.  Defaults to the runtime
    /// the session was started on; either way the engine crosses a spawn
    /// boundary before any target body runs.
    pub dispatch_runtime: Option<tokio::runtime::Handle>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_concurrent_inbound: None,
            cancellation_code: ErrorCode::RequestCancelled,
            graceful_shutdown_timeout: Some(Duration::from_secs(2)),
            strict_notifications: false,
            dispatch_runtime: None,
        }
    }
}

enum Lifecycle {
    Created,
    Listening,
    Disconnecting(DisconnectReason),
    Disconnected(DisconnectReason),
}

#[derive(Default)]
struct DisconnectSlot {
    fired: Option<DisconnectedEvent>,
    callbacks: Vec<Box<dyn FnOnce(&DisconnectedEvent) + Send>>,
}

/// State shared between the public session handle, the read loop, and
/// pending-request handles.
pub(crate) struct SessionCore {
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) outstanding: OutstandingRequests,
    /// In-flight inbound requests by id, for `$/cancelRequest` lookups and
    /// duplicate-id detection.
    pub(crate) inbound_cancels: Mutex<HashMap<Id, CancellationToken>>,
    lifecycle: Mutex<Lifecycle>,
    next_id: AtomicU64,
    /// Session lifetime token; parent of every inbound request token.
    pub(crate) token: CancellationToken,
    /// Fired once the session reaches `Disconnected`.
    done: CancellationToken,
    pub(crate) options: SessionOptions,
    disconnect: Mutex<DisconnectSlot>,
}

impl SessionCore {
    fn new(handler: Arc<dyn MessageHandler>, options: SessionOptions) -> Self {
        Self {
            handler,
            outstanding: OutstandingRequests::new(),
            inbound_cancels: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle::Created),
            next_id: AtomicU64::new(1),
            token: CancellationToken::new(),
            done: CancellationToken::new(),
            options,
            disconnect: Mutex::new(DisconnectSlot::default()),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        match *self.lifecycle.lock().unwrap() {
            Lifecycle::Created => SessionState::Created,
            Lifecycle::Listening => SessionState::Listening,
            Lifecycle::Disconnecting(_) => SessionState::Disconnecting,
            Lifecycle::Disconnected(_) => SessionState::Disconnected,
        }
    }

    /// Fail unless the session is in the `Listening` state.
    pub(crate) fn ensure_listening(&self) -> Result<()> {
        match *self.lifecycle.lock().unwrap() {
            Lifecycle::Created => Err(RpcError::NotYetListening),
            Lifecycle::Listening => Ok(()),
            Lifecycle::Disconnecting(reason) | Lifecycle::Disconnected(reason) => {
                Err(RpcError::ConnectionLost { reason })
            }
        }
    }

    fn mark_listening(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        match *lifecycle {
            Lifecycle::Created => {
                *lifecycle = Lifecycle::Listening;
                Ok(())
            }
            Lifecycle::Listening => Err(RpcError::AlreadyListening),
            Lifecycle::Disconnecting(reason) | Lifecycle::Disconnected(reason) => {
                Err(RpcError::ConnectionLost { reason })
            }
        }
    }

    /// Allocate the next outbound request id from the monotonic counter.
    pub(crate) fn allocate_id(&self) -> Id {
        Id::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Transition to `Disconnecting` and cancel the session token.
    ///
    /// The first caller's reason sticks; later callers get it back.  The read
    /// loop observes the cancelled token and performs the actual teardown.
    pub(crate) fn begin_disconnect(&self, reason: DisconnectReason) -> DisconnectReason {
        let effective = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            match *lifecycle {
                Lifecycle::Created | Lifecycle::Listening => {
                    *lifecycle = Lifecycle::Disconnecting(reason);
                    reason
                }
                Lifecycle::Disconnecting(existing) | Lifecycle::Disconnected(existing) => existing,
            }
        };
        self.token.cancel();
        effective
    }

    /// The reason recorded when disconnection started, if it has.
    pub(crate) fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match *self.lifecycle.lock().unwrap() {
            Lifecycle::Disconnecting(reason) | Lifecycle::Disconnected(reason) => Some(reason),
            _ => None,
        }
    }

    /// Final transition: fault nothing further, fire `Disconnected` exactly
    /// once, and wake everyone waiting on [`SessionCore::done`].
    pub(crate) fn finish_disconnect(&self, reason: DisconnectReason, error: Option<RpcError>) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if matches!(*lifecycle, Lifecycle::Disconnected(_)) {
                return;
            }
            *lifecycle = Lifecycle::Disconnected(reason);
        }

        let event = DisconnectedEvent {
            description: match &error {
                Some(e) => format!("connection closed ({reason}): {e}"),
                None => format!("connection closed ({reason})"),
            },
            reason,
            error: error.map(Arc::new),
        };
        tracing::info!(%reason, description = %event.description, "session disconnected");

        let callbacks = {
            let mut slot = self.disconnect.lock().unwrap();
            slot.fired = Some(event.clone());
            std::mem::take(&mut slot.callbacks)
        };
        for callback in callbacks {
            callback(&event);
        }
        self.done.cancel();
    }

    pub(crate) fn on_disconnected(&self, callback: impl FnOnce(&DisconnectedEvent) + Send + 'static) {
        let fired = {
            let mut slot = self.disconnect.lock().unwrap();
            match &slot.fired {
                Some(event) => Some(event.clone()),
                None => {
                    slot.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        if let Some(event) = fired {
            callback(&event);
        }
    }

    /// Send `$/cancelRequest` for an outstanding outbound call, at most once
    /// per id no matter how many times cancellation is requested.
    pub(crate) async fn request_outbound_cancel(&self, id: &Id) {
        if !self.outstanding.mark_cancel_sent(id) {
            return;
        }
        let notification = Request::notification(CANCEL_REQUEST_METHOD, Some(json!({ "id": id })));
        tracing::debug!(request_id = %id, "sending cancellation request to the peer");
        if let Err(e) = self.handler.write(&notification.into()).await {
            // The response (or disconnection) will settle the caller either way.
            tracing::debug!(request_id = %id, err = %e,
                "failed to send cancellation request");
        }
    }
}

/// Convert user arguments into wire params.
///
/// Arrays and objects pass through; a lone scalar is wrapped into a
/// single-element positional array; unit/null means no arguments.
fn params_value<Req: Serialize>(params: Req) -> Result<Option<JsonValue>> {
    let value = serde_json::to_value(params).map_err(|e| RpcError::SerRequest {
        source: e,
        type_name: std::any::type_name::<Req>(),
    })?;
    Ok(match value {
        JsonValue::Null => None,
        value @ (JsonValue::Array(_) | JsonValue::Object(_)) => Some(value),
        scalar => Some(JsonValue::Array(vec![scalar])),
    })
}

/// One end of a JSON-RPC conversation.
///
/// Cheap operations take `&self`; wrap the session in an [`Arc`] to share it
/// across tasks.  Dropping the session tears the connection down.
pub struct Session<S: Clone + Send + Sync + 'static = ()> {
    core: Arc<SessionCore>,
    router: Router<S>,
}

impl Session {
    pub fn builder() -> SessionBuilder<Stage1> {
        SessionBuilder { stage: Stage1 }
    }

    /// A session over `handler` with no local targets and default options.
    pub fn new(handler: impl MessageHandler) -> Session<()> {
        Session::builder().without_state().build(handler)
    }
}

impl<S: Clone + Send + Sync + 'static> Session<S> {
    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// The shared state handed to local targets.
    pub fn target_state(&self) -> &S {
        self.router.state()
    }

    /// `Created → Listening`: spawn the read loop.  Until this is called, no
    /// frames are consumed and outbound calls fail with `NotYetListening`.
    pub fn start_listening(&self) -> Result<()> {
        self.core.mark_listening()?;
        let read_loop = engine::ReadLoop::new(self.core.clone(), self.router.clone());
        tokio::spawn(read_loop.run());
        Ok(())
    }

    /// Invoke a remote method without arguments and await its typed result.
    pub async fn invoke<Resp>(&self, method: impl Into<String>) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        self.start_call_raw(method.into(), None).await?.await
    }

    /// Invoke a remote method with arguments and await its typed result.
    pub async fn invoke_with_params<Req, Resp>(
        &self,
        method: impl Into<String>,
        params: Req,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.start_call_raw(method.into(), params_value(params)?)
            .await?
            .await
    }

    /// Invoke a remote method under a caller-supplied cancellation token.
    ///
    /// If `cancel` fires first, exactly one `$/cancelRequest` notification
    /// goes out and the call keeps waiting for the remote response: a
    /// cancellation error from the peer resolves to [`RpcError::Cancelled`],
    /// while a normal result that wins the race is returned as such.
    pub async fn invoke_with_token<Req, Resp>(
        &self,
        method: impl Into<String>,
        params: Req,
        cancel: CancellationToken,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut call = self
            .start_call_raw(method.into(), params_value(params)?)
            .await?;
        tokio::select! {
            result = &mut call => return result,
            _ = cancel.cancelled() => {}
        }
        call.cancel().await;
        call.await
    }

    /// Start a method call and return a handle that can await or cancel it.
    pub async fn start_call<Req, Resp>(
        &self,
        method: impl Into<String>,
        params: Req,
    ) -> Result<RequestHandle<Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.start_call_raw(method.into(), params_value(params)?).await
    }

    async fn start_call_raw<Resp>(
        &self,
        method: String,
        params: Option<JsonValue>,
    ) -> Result<RequestHandle<Resp>>
    where
        Resp: DeserializeOwned,
    {
        self.core.ensure_listening()?;

        // Id allocation, table insert, and the wire write form one logical
        // critical section: the entry is registered before any byte leaves,
        // so a response can never race past an unknown id, and the write
        // mutex inside the handler orders the wire.
        let id = self.core.allocate_id();
        let receiver = self.core.outstanding.register(id.clone(), &method);
        let request = Request::call(id.clone(), method.clone(), params);

        if let Err(e) = self.core.handler.write(&request.into()).await {
            self.core.outstanding.remove(&id);
            tracing::warn!(request_id = %id, method = %method, err = %e,
                "request write failed; disconnecting");
            let reason = self.core.begin_disconnect(DisconnectReason::StreamError);
            return Err(RpcError::ConnectionLost { reason });
        }

        Ok(RequestHandle::new(self.core.clone(), id, method, receiver))
    }

    /// Send a notification: write-only, no id, no pending entry.  Completes
    /// once the bytes are flushed to the transport.
    pub async fn notify<Req>(&self, method: impl Into<String>, params: Req) -> Result<()>
    where
        Req: Serialize,
    {
        let method = method.into();
        self.core.ensure_listening()?;
        let notification = Request::notification(method.clone(), params_value(params)?);

        if let Err(e) = self.core.handler.write(&notification.into()).await {
            tracing::warn!(method = %method, err = %e,
                "notification write failed; disconnecting");
            let reason = self.core.begin_disconnect(DisconnectReason::StreamError);
            return Err(RpcError::ConnectionLost { reason });
        }
        Ok(())
    }

    /// Register a callback for the `Disconnected` event.
    ///
    /// Fires exactly once per session; callbacks registered after the fact
    /// run immediately with the recorded event.
    pub fn on_disconnected(&self, callback: impl FnOnce(&DisconnectedEvent) + Send + 'static) {
        self.core.on_disconnected(callback);
    }

    /// Wait until the session reaches `Disconnected`.
    pub async fn closed(&self) {
        self.core.done.clone().cancelled_owned().await
    }

    /// Dispose the session: reject new calls, cancel in-flight inbound
    /// dispatches via the session token, drain writes, fault pending
    /// outbound calls with `ConnectionLost`, and fire `Disconnected`.
    pub async fn shutdown(&self) {
        let was_created = self.state() == SessionState::Created;
        self.core.begin_disconnect(DisconnectReason::LocallyDisposed);
        if was_created {
            // No read loop exists to run the teardown.
            let _ = self.core.handler.close().await;
            self.core
                .finish_disconnect(DisconnectReason::LocallyDisposed, None);
        }
        self.closed().await;
    }
}

impl<S: Clone + Send + Sync + 'static> Drop for Session<S> {
    fn drop(&mut self) {
        // Fire-and-forget release: the read loop (if any) finishes teardown.
        self.core.begin_disconnect(DisconnectReason::LocallyDisposed);
    }
}

#[doc(hidden)]
pub struct Stage1;

#[doc(hidden)]
pub struct Stage2<S: Clone + Send + Sync + 'static> {
    router: Router<S>,
    options: SessionOptions,
}

/// Staged builder for [`Session`]: pick the state first, then register
/// targets, then bind the message handler.
pub struct SessionBuilder<Stage> {
    stage: Stage,
}

impl SessionBuilder<Stage1> {
    pub fn with_state<S: Clone + Send + Sync + 'static>(self, state: S) -> SessionBuilder<Stage2<S>> {
        SessionBuilder {
            stage: Stage2 {
                router: Router::new_with_state(state),
                options: SessionOptions::default(),
            },
        }
    }

    pub fn without_state(self) -> SessionBuilder<Stage2<()>> {
        self.with_state(())
    }

    pub fn with_router<S: Clone + Send + Sync + 'static>(
        self,
        router: Router<S>,
    ) -> SessionBuilder<Stage2<S>> {
        SessionBuilder {
            stage: Stage2 {
                router,
                options: SessionOptions::default(),
            },
        }
    }
}

impl<S: Clone + Send + Sync + 'static> SessionBuilder<Stage2<S>> {
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.stage.options = options;
        self
    }

    /// Transform applied to method names registered after this point.
    pub fn name_transform(mut self, transform: NameTransform) -> Self {
        self.stage.router = self.stage.router.with_name_transform(transform);
        self
    }

    pub fn with_handler<H, HackT>(mut self, method: impl Into<String>, handler: H) -> Self
    where
        H: Handler<HackT, S>,
        HackT: Send + Sync + 'static,
    {
        self.stage.router.register_handler(method, handler);
        self
    }

    pub fn with_overload<H, HackT>(
        mut self,
        method: impl Into<String>,
        arity: usize,
        handler: H,
    ) -> Self
    where
        H: Handler<HackT, S>,
        HackT: Send + Sync + 'static,
    {
        self.stage.router.register_overload(method, arity, handler);
        self
    }

    pub fn with_handler_opts<H, HackT>(
        mut self,
        method: impl Into<String>,
        options: MethodOptions,
        handler: H,
    ) -> Self
    where
        H: Handler<HackT, S>,
        HackT: Send + Sync + 'static,
    {
        self.stage.router.register_handler_with(method, options, handler);
        self
    }

    pub fn with_fallback_handler<H, HackT>(mut self, handler: H) -> Self
    where
        H: Handler<HackT, S>,
        HackT: Send + Sync + 'static,
    {
        self.stage.router.register_fallback_handler(handler);
        self
    }

    /// Bind the message handler and produce the session, still in `Created`.
    pub fn build(self, handler: impl MessageHandler) -> Session<S> {
        Session {
            core: Arc::new(SessionCore::new(Arc::new(handler), self.stage.options)),
            router: self.stage.router,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn params_value_shapes() {
        assert_eq!(params_value(()).unwrap(), None);
        assert_eq!(params_value(json!(null)).unwrap(), None);
        assert_eq!(params_value(vec![1, 2]).unwrap(), Some(json!([1, 2])));
        assert_eq!(
            params_value(json!({"a": 1})).unwrap(),
            Some(json!({"a": 1}))
        );
        // A lone scalar becomes a one-element positional array.
        assert_eq!(params_value("hi").unwrap(), Some(json!(["hi"])));
        assert_eq!(params_value(7).unwrap(), Some(json!([7])));
    }

    #[tokio::test]
    async fn lifecycle_gates_invocation() {
        let (local, _remote) = tokio::io::duplex(1024);
        let session = Session::new(crate::framing::LengthPrefixedHandler::from_stream(
            local,
            crate::formatter::JsonFormatter::new(),
        ));

        assert_eq!(session.state(), SessionState::Created);
        let err = session.invoke::<JsonValue>("anything").await.unwrap_err();
        assert_matches!(err, RpcError::NotYetListening);

        session.start_listening().unwrap();
        assert_eq!(session.state(), SessionState::Listening);
        assert_matches!(
            session.start_listening().unwrap_err(),
            RpcError::AlreadyListening
        );

        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        let err = session.invoke::<JsonValue>("anything").await.unwrap_err();
        assert_matches!(
            err,
            RpcError::ConnectionLost {
                reason: DisconnectReason::LocallyDisposed
            }
        );
    }

    #[tokio::test]
    async fn shutdown_from_created_fires_the_event() {
        let (local, _remote) = tokio::io::duplex(1024);
        let session = Session::new(crate::framing::LengthPrefixedHandler::from_stream(
            local,
            crate::formatter::JsonFormatter::new(),
        ));

        let (tx, rx) = tokio::sync::oneshot::channel();
        session.on_disconnected(move |event| {
            let _ = tx.send(event.reason);
        });

        session.shutdown().await;
        assert_eq!(rx.await.unwrap(), DisconnectReason::LocallyDisposed);

        // Late registration observes the recorded event immediately.
        let (tx, rx) = tokio::sync::oneshot::channel();
        session.on_disconnected(move |event| {
            let _ = tx.send(event.reason);
        });
        assert_eq!(rx.await.unwrap(), DisconnectReason::LocallyDisposed);
    }

    #[test]
    fn monotonic_id_allocation() {
        let (local, _remote) = tokio::io::duplex(64);
        let core = SessionCore::new(
            Arc::new(crate::framing::LengthPrefixedHandler::from_stream(
                local,
                crate::formatter::JsonFormatter::new(),
            )),
            SessionOptions::default(),
        );
        assert_eq!(core.allocate_id(), Id::Number(1));
        assert_eq!(core.allocate_id(), Id::Number(2));
        assert_eq!(core.allocate_id(), Id::Number(3));
    }
}

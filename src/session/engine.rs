//! The read loop: consumes frames, correlates responses, dispatches requests
//! and notifications, and runs the disconnection protocol when the loop
//! exits.
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

use super::{CANCEL_REQUEST_METHOD, DisconnectReason, SessionCore};
use crate::error::{RpcError, panic_err_to_string};
use crate::handler::{BoxFuture, InboundRequest};
use crate::router::{NotificationDispatch, Router};
use crate::types::{ErrorCode, ErrorDetails, Id, Message, Request, Response, ResponsePayload};

pub(super) struct ReadLoop<S: Clone + Send + Sync + 'static> {
    core: Arc<SessionCore>,
    router: Router<S>,
    /// In-flight inbound dispatches.  Joined (with a graceful timeout) during
    /// disconnection.
    dispatches: JoinSet<()>,
    /// Concurrency gate; acquiring a permit suspends the loop before the next
    /// frame is consumed, which is the backpressure mechanism.
    gate: Option<Arc<Semaphore>>,
}

impl<S: Clone + Send + Sync + 'static> ReadLoop<S> {
    pub(super) fn new(core: Arc<SessionCore>, router: Router<S>) -> Self {
        let gate = core
            .options
            .max_concurrent_inbound
            .map(|bound| Arc::new(Semaphore::new(bound)));
        Self {
            core,
            router,
            dispatches: JoinSet::new(),
            gate,
        }
    }

    pub(super) async fn run(mut self) {
        tracing::debug!("session read loop starting");

        let (reason, error) = loop {
            // Hoisted out of the match so the read borrow ends before the
            // arms take `&mut self`.
            let next = self.core.handler.read(&self.core.token).await;
            match next {
                Ok(Some(Message::Request(request))) if request.is_notification() => {
                    self.handle_notification(request).await;
                }
                Ok(Some(Message::Request(request))) => {
                    self.handle_request(request).await;
                }
                Ok(Some(Message::Response(response))) => {
                    self.handle_response(response);
                }
                Ok(None) => {
                    tracing::debug!("peer closed the transport");
                    break (DisconnectReason::RemoteEndClosed, None);
                }
                Err(RpcError::Cancelled) => {
                    // The session token fired: disposal or a write failure
                    // already recorded the reason.
                    let reason = self
                        .core
                        .disconnect_reason()
                        .unwrap_or(DisconnectReason::LocallyDisposed);
                    break (reason, None);
                }
                Err(e) if e.is_recoverable_decode() => {
                    tracing::warn!(err = %e, "rejecting undecodable inbound message");
                    let response = e.to_decode_response();
                    if let Err(write_err) = self.core.handler.write(&response.into()).await {
                        break (DisconnectReason::StreamError, Some(write_err));
                    }
                }
                Err(e) => {
                    let reason = e.disconnect_reason();
                    tracing::error!(err = %e, %reason, "fatal transport failure in read loop");
                    break (reason, Some(e));
                }
            }
        };

        self.disconnect(reason, error).await;
    }

    /// Correlate an inbound response to its pending outbound call.
    fn handle_response(&self, response: Response) {
        let id = response.id.clone();
        if !self.core.outstanding.complete(&response.id, response.payload) {
            // Possibly a response to a call we stopped waiting for.
            tracing::warn!(request_id = %id,
                "dropping response with no matching outstanding request");
        }
    }

    async fn handle_request(&mut self, request: Request) {
        // The caller routes notifications elsewhere.
        let Some(id) = request.id.clone() else {
            return;
        };

        // A peer reusing an id that is still in flight would corrupt the
        // cancellation table; refuse it without touching the original.
        if self.core.inbound_cancels.lock().unwrap().contains_key(&id) {
            tracing::error!(request_id = %id, method = %request.method,
                "peer sent a duplicate request id");
            let response = Response::error(
                Id::Null,
                ErrorDetails::invalid_request(
                    "duplicate request id",
                    Some(json!({ "id": id, "method": request.method })),
                ),
            );
            let _ = self.core.handler.write(&response.into()).await;
            return;
        }

        let permit = self.acquire_permit().await;
        let token = self.core.token.child_token();
        self.core
            .inbound_cancels
            .lock()
            .unwrap()
            .insert(id.clone(), token.clone());

        let span = tracing::debug_span!("inbound_request",
            request_id = %id, method = %request.method);

        let inbound = InboundRequest {
            id: Some(id.clone()),
            method: request.method,
            params: request.params,
            token,
        };

        // Argument coercion happens here, synchronously; the target body runs
        // only on the other side of the spawn below, so the read loop never
        // executes user code.
        let target = self.router.dispatch_method(inbound);

        let core = self.core.clone();
        self.dispatches.spawn(
            async move {
                let payload = run_target(&core, target).await;
                core.inbound_cancels.lock().unwrap().remove(&id);

                let payload = apply_cancellation_code(payload, core.options.cancellation_code);
                let response = Response { id, payload };
                if let Err(e) = core.handler.write(&response.into()).await {
                    // The read loop notices the broken transport on its own.
                    tracing::warn!(err = %e, "failed to write response");
                }
                drop(permit);
            }
            .instrument(span),
        );
    }

    async fn handle_notification(&mut self, request: Request) {
        if request.method == CANCEL_REQUEST_METHOD {
            self.handle_cancel_request(request.params);
            return;
        }

        let permit = self.acquire_permit().await;
        let span =
            tracing::debug_span!("inbound_notification", method = %request.method);
        let inbound = InboundRequest {
            id: None,
            method: request.method.clone(),
            params: request.params,
            token: self.core.token.child_token(),
        };

        match self.router.dispatch_notification(inbound) {
            NotificationDispatch::Run(target) => {
                let core = self.core.clone();
                self.dispatches.spawn(
                    async move {
                        let _ = run_target_for_notification(&core, target).await;
                        drop(permit);
                    }
                    .instrument(span),
                );
            }
            NotificationDispatch::Unknown => {
                if self.core.options.strict_notifications {
                    tracing::warn!(method = %request.method,
                        "dropping notification for unregistered method");
                } else {
                    tracing::debug!(method = %request.method,
                        "dropping notification for unregistered method");
                }
            }
            NotificationDispatch::Rejected => {
                tracing::debug!(method = %request.method,
                    "dropping notification refused by its target");
            }
        }
    }

    /// The engine-internal `$/cancelRequest` handler; targets never see it.
    fn handle_cancel_request(&self, params: Option<JsonValue>) {
        #[derive(Deserialize)]
        struct CancelParams {
            id: Id,
        }

        let parsed = params
            .clone()
            .and_then(|value| serde_json::from_value::<CancelParams>(value).ok());
        let Some(CancelParams { id }) = parsed else {
            tracing::warn!(?params, "ignoring malformed cancellation request");
            return;
        };

        let token = self.core.inbound_cancels.lock().unwrap().get(&id).cloned();
        match token {
            Some(token) => {
                tracing::debug!(request_id = %id, "peer requested cancellation");
                token.cancel();
            }
            None => {
                tracing::debug!(request_id = %id,
                    "cancellation requested for a request that is not in flight");
            }
        }
    }

    async fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        match &self.gate {
            // The semaphore is owned here and never closed.
            Some(gate) => gate.clone().acquire_owned().await.ok(),
            None => None,
        }
    }

    /// The disconnection protocol: drain in-flight dispatches (bounded by the
    /// graceful timeout), fault every pending outbound call, close the
    /// handler, and fire `Disconnected` exactly once.
    async fn disconnect(mut self, reason: DisconnectReason, error: Option<RpcError>) {
        let reason = self.core.begin_disconnect(reason);

        tracing::debug!(
            in_flight = self.dispatches.len(),
            graceful_timeout = ?self.core.options.graceful_shutdown_timeout,
            "draining in-flight inbound dispatches"
        );

        let deadline = self
            .core
            .options
            .graceful_shutdown_timeout
            .and_then(|timeout| tokio::time::Instant::now().checked_add(timeout));

        loop {
            let joined = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.dispatches.join_next()).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            tracing::warn!(
                                in_flight = self.dispatches.len(),
                                "graceful drain timed out; aborting remaining dispatches"
                            );
                            self.dispatches.abort_all();
                            while let Some(result) = self.dispatches.join_next().await {
                                log_join_result(result);
                            }
                            break;
                        }
                    }
                }
                None => self.dispatches.join_next().await,
            };
            match joined {
                Some(result) => log_join_result(result),
                None => break,
            }
        }

        self.core.inbound_cancels.lock().unwrap().clear();
        self.core.outstanding.abort_all(reason);
        if let Err(e) = self.core.handler.close().await {
            tracing::debug!(err = %e, "error closing message handler");
        }
        self.core.finish_disconnect(reason, error);
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(join_err) = result {
        if join_err.is_panic() {
            tracing::error!(err = %join_err, "inbound dispatch task panicked");
        } else {
            tracing::debug!(err = %join_err, "inbound dispatch task aborted");
        }
    }
}

/// Run a target future on the configured scheduler, converting panics and
/// join failures into an internal-error payload.
async fn run_target(core: &SessionCore, target: BoxFuture<ResponsePayload>) -> ResponsePayload {
    match core.options.dispatch_runtime.clone() {
        Some(runtime) => match runtime.spawn(target).await {
            Ok(payload) => payload,
            Err(join_err) => internal_failure(join_err.try_into_panic().ok()),
        },
        None => match AssertUnwindSafe(target).catch_unwind().await {
            Ok(payload) => payload,
            Err(panic) => internal_failure(Some(panic)),
        },
    }
}

async fn run_target_for_notification(core: &SessionCore, target: BoxFuture<()>) {
    match core.options.dispatch_runtime.clone() {
        Some(runtime) => {
            if let Err(join_err) = runtime.spawn(target).await {
                tracing::error!(err = %join_err, "notification target failed");
            }
        }
        None => {
            if let Err(panic) = AssertUnwindSafe(target).catch_unwind().await {
                tracing::error!(panic = %panic_err_to_string(panic),
                    "notification target panicked");
            }
        }
    }
}

fn internal_failure(panic: Option<Box<dyn std::any::Any + Send>>) -> ResponsePayload {
    let detail = panic.map(panic_err_to_string);
    tracing::error!(detail = detail.as_deref().unwrap_or("task failed"),
        "inbound dispatch failed");
    ResponsePayload::Error(ErrorDetails::internal_error(
        "the target failed while processing the request",
        detail.map(JsonValue::String),
    ))
}

/// Rewrite the cancellation code when the session is configured to speak a
/// nonstandard one.
fn apply_cancellation_code(payload: ResponsePayload, code: ErrorCode) -> ResponsePayload {
    match payload {
        ResponsePayload::Error(mut details)
            if details.code == ErrorCode::RequestCancelled && code != ErrorCode::RequestCancelled =>
        {
            details.code = code;
            ResponsePayload::Error(details)
        }
        other => other,
    }
}

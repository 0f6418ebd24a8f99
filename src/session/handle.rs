//! The pollable handle to one pending outbound method call.
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project::pin_project;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use super::{DisconnectReason, SessionCore};
use crate::error::{Result, RpcError};
use crate::types::{Id, ResponsePayload};

/// Handle to an outbound method call that has been written to the wire.
///
/// Await it to get the typed response.  [`RequestHandle::cancel`] drives the
/// cancellation protocol: one `$/cancelRequest` notification goes out (first
/// cancel wins, later ones are no-ops) and the handle keeps waiting for the
/// remote response — a cancellation error resolves to
/// [`RpcError::Cancelled`], while a normal result that wins the race is
/// delivered as usual.
#[pin_project]
pub struct RequestHandle<T> {
    #[pin]
    receiver: oneshot::Receiver<Result<ResponsePayload>>,
    request_id: Id,
    method: String,
    core: Arc<SessionCore>,
    cancel_requested: bool,
    _type: PhantomData<fn() -> T>,
}

impl<T> RequestHandle<T> {
    pub(super) fn new(
        core: Arc<SessionCore>,
        request_id: Id,
        method: String,
        receiver: oneshot::Receiver<Result<ResponsePayload>>,
    ) -> Self {
        Self {
            receiver,
            request_id,
            method,
            core,
            cancel_requested: false,
            _type: PhantomData,
        }
    }

    /// The id this call carries on the wire, matching what the peer echoes
    /// back in its response.
    pub fn request_id(&self) -> Id {
        self.request_id.clone()
    }

    /// Ask the remote peer to cancel this call.
    ///
    /// Sends `$/cancelRequest` at most once per call, then returns; keep
    /// awaiting the handle to consume the remote response.
    pub async fn cancel(&mut self) {
        if self.cancel_requested {
            return;
        }
        self.cancel_requested = true;
        self.core.request_outbound_cancel(&self.request_id).await;
    }
}

impl<T> Future for RequestHandle<T>
where
    T: DeserializeOwned,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match futures::ready!(this.receiver.poll(cx)) {
            Ok(Ok(ResponsePayload::Success(value))) => {
                Poll::Ready(serde_json::from_value(value.clone()).map_err(|e| {
                    RpcError::DeserResponse {
                        source: e,
                        type_name: std::any::type_name::<T>(),
                        response: value,
                    }
                }))
            }
            Ok(Ok(ResponsePayload::Error(error))) => {
                // The configured cancellation code resolves to `Cancelled`
                // once cancellation was actually requested for this call.
                if *this.cancel_requested && error.code == this.core.options.cancellation_code {
                    Poll::Ready(Err(RpcError::Cancelled))
                } else {
                    Poll::Ready(Err(RpcError::MethodError {
                        method: this.method.clone(),
                        error,
                    }))
                }
            }
            Ok(Err(e)) => Poll::Ready(Err(e)),
            Err(_) => {
                // The table entry was dropped without completion; the session
                // is coming down around us.
                let reason = this
                    .core
                    .disconnect_reason()
                    .unwrap_or(DisconnectReason::FatalException);
                Poll::Ready(Err(RpcError::ConnectionLost { reason }))
            }
        }
    }
}

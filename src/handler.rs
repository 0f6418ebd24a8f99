//! Local targets for inbound method calls and notifications.
//!
//! Any code the dispatcher can invoke implements [`Handler`].  Most users
//! never implement it directly: blanket implementations cover plain `async`
//! functions whose arguments implement [`FromRequest`] and whose return type
//! implements [`IntoResponse`], in the manner of axum's handler machinery.
//!
//! Extraction and execution are deliberately split: argument coercion runs
//! synchronously before any future is created, so the router can try the next
//! overload (or answer `InvalidParams`) without running user code.
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::types::{ErrorDetails, Id, ResponsePayload};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Convenient return type for handlers that produce a value or a wire error.
pub type MethodResponse<T> = Result<T, ErrorDetails>;

/// One inbound method call or notification, as handed to extractors.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Request id; `None` when invoked as a notification.
    pub id: Option<Id>,
    pub method: String,
    pub params: Option<JsonValue>,
    /// Cancellation token scoped to this one dispatch; a child of the session
    /// lifetime token, triggered by an inbound `$/cancelRequest` or session
    /// shutdown.
    pub token: CancellationToken,
}

/// Extract a handler argument from the request.
pub trait FromRequest<S>: Sized {
    type Rejection: IntoResponse;

    fn from_request(request: &InboundRequest, state: &S) -> Result<Self, Self::Rejection>;
}

/// Deserialize the request arguments into `T`.
///
/// Coercion tries the raw `params` value first (absent params deserialize
/// from null, so `Option<T>` and `()` always work).  If that fails and the
/// arguments are a single-element positional array, the lone element is tried
/// as well, so `Params<String>` accepts `["hi"]`.
#[derive(Debug)]
pub struct Params<T>(pub T);

impl<T: DeserializeOwned, S> FromRequest<S> for Params<T> {
    type Rejection = ErrorDetails;

    fn from_request(request: &InboundRequest, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = request.params.clone().unwrap_or(JsonValue::Null);
        match serde_json::from_value(raw.clone()) {
            Ok(value) => Ok(Params(value)),
            Err(first_err) => {
                if let JsonValue::Array(items) = &raw {
                    if items.len() == 1 {
                        if let Ok(value) = serde_json::from_value(items[0].clone()) {
                            return Ok(Params(value));
                        }
                    }
                }
                Err(ErrorDetails::invalid_params(
                    format!(
                        "cannot coerce arguments into {}: {first_err}",
                        std::any::type_name::<T>()
                    ),
                    None,
                ))
            }
        }
    }
}

/// Hand the shared state to the handler.
pub struct State<S: Clone>(pub S);

impl<S: Clone> FromRequest<S> for State<S> {
    type Rejection = Infallible;

    fn from_request(_request: &InboundRequest, state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(state.clone()))
    }
}

/// The method name the request arrived under, useful in fallback handlers.
pub struct MethodName(pub String);

impl<S> FromRequest<S> for MethodName {
    type Rejection = Infallible;

    fn from_request(request: &InboundRequest, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(request.method.clone()))
    }
}

/// Handlers that want the request id but still accept notification dispatch.
impl<S> FromRequest<S> for Option<Id> {
    type Rejection = Infallible;

    fn from_request(request: &InboundRequest, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(request.id.clone())
    }
}

/// Handlers that require the request id and so cannot run as notifications.
impl<S> FromRequest<S> for Id {
    type Rejection = ErrorDetails;

    fn from_request(request: &InboundRequest, _state: &S) -> Result<Self, Self::Rejection> {
        request.id.clone().ok_or_else(|| {
            ErrorDetails::invalid_params("this method cannot be invoked as a notification", None)
        })
    }
}

/// The per-request cancellation token.
///
/// Long-running targets that want to honor `$/cancelRequest` take this
/// extractor and watch it; targets that ignore it simply run to completion.
pub struct RequestToken(pub CancellationToken);

impl<S> FromRequest<S> for RequestToken {
    type Rejection = Infallible;

    fn from_request(request: &InboundRequest, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(request.token.clone()))
    }
}

/// Anything a handler may return.
pub trait IntoResponse {
    fn into_response(self) -> ResponsePayload;
}

impl<T, E> IntoResponse for Result<T, E>
where
    T: Serialize,
    E: Into<ErrorDetails>,
{
    fn into_response(self) -> ResponsePayload {
        match self {
            Ok(value) => ResponsePayload::serialize_to_success(value),
            Err(e) => ResponsePayload::Error(e.into()),
        }
    }
}

impl IntoResponse for JsonValue {
    fn into_response(self) -> ResponsePayload {
        ResponsePayload::Success(self)
    }
}

impl IntoResponse for ErrorDetails {
    fn into_response(self) -> ResponsePayload {
        ResponsePayload::Error(self)
    }
}

impl IntoResponse for () {
    fn into_response(self) -> ResponsePayload {
        ResponsePayload::Success(JsonValue::Null)
    }
}

impl IntoResponse for Infallible {
    fn into_response(self) -> ResponsePayload {
        unreachable!("Infallible can never be constructed")
    }
}

/// A local target for JSON-RPC method calls and notifications.
///
/// `HackT` exists to satisfy the coherence rules for the blanket function
/// impls, exactly as in axum; it is erased by [`erase_handler`] before the
/// router ever sees the handler.
pub trait Handler<HackT, S>: Clone + Send + Sync + Sized + 'static {
    /// Coerce the arguments and, on success, return the future that runs the
    /// target.  A rejection means no user code ran.
    fn try_handle_method(
        self,
        state: S,
        request: InboundRequest,
    ) -> Result<BoxFuture<ResponsePayload>, ResponsePayload>;

    /// As [`Handler::try_handle_method`] but for notification dispatch: the
    /// outcome is discarded.
    fn try_handle_notification(
        self,
        state: S,
        request: InboundRequest,
    ) -> Result<BoxFuture<()>, ResponsePayload>;
}

macro_rules! impl_handler {
    ( $($ty:ident),* ) => {
        #[allow(non_snake_case, unused_variables)]
        impl<F, Fut, S, Res, $($ty,)*> Handler<($($ty,)*), S> for F
        where
            F: FnOnce($($ty,)*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            S: Send + Sync + 'static,
            Res: IntoResponse + 'static,
            $( $ty: FromRequest<S> + Send + 'static, )*
        {
            fn try_handle_method(
                self,
                state: S,
                request: InboundRequest,
            ) -> Result<BoxFuture<ResponsePayload>, ResponsePayload> {
                $(
                    let $ty = match $ty::from_request(&request, &state) {
                        Ok(value) => value,
                        Err(rejection) => return Err(rejection.into_response()),
                    };
                )*
                Ok(async move { self($($ty,)*).await.into_response() }.boxed())
            }

            fn try_handle_notification(
                self,
                state: S,
                request: InboundRequest,
            ) -> Result<BoxFuture<()>, ResponsePayload> {
                $(
                    let $ty = match $ty::from_request(&request, &state) {
                        Ok(value) => value,
                        Err(rejection) => return Err(rejection.into_response()),
                    };
                )*
                Ok(async move {
                    let _ = self($($ty,)*).await;
                }.boxed())
            }
        }
    };
}

impl_handler!();
impl_handler!(T1);
impl_handler!(T1, T2);
impl_handler!(T1, T2, T3);

/// Dyn-compatible wrapper around [`Handler`] so the router can store targets
/// of different shapes in one map.
pub(crate) trait ErasedHandler<S>: Send + Sync {
    fn try_handle_method(
        &self,
        state: S,
        request: InboundRequest,
    ) -> Result<BoxFuture<ResponsePayload>, ResponsePayload>;

    fn try_handle_notification(
        &self,
        state: S,
        request: InboundRequest,
    ) -> Result<BoxFuture<()>, ResponsePayload>;
}

struct Erased<H, HackT> {
    handler: H,
    _marker: PhantomData<fn(HackT) -> HackT>,
}

impl<H, HackT, S> ErasedHandler<S> for Erased<H, HackT>
where
    H: Handler<HackT, S>,
    HackT: 'static,
    S: 'static,
{
    fn try_handle_method(
        &self,
        state: S,
        request: InboundRequest,
    ) -> Result<BoxFuture<ResponsePayload>, ResponsePayload> {
        self.handler.clone().try_handle_method(state, request)
    }

    fn try_handle_notification(
        &self,
        state: S,
        request: InboundRequest,
    ) -> Result<BoxFuture<()>, ResponsePayload> {
        self.handler.clone().try_handle_notification(state, request)
    }
}

pub(crate) fn erase_handler<H, HackT, S>(handler: H) -> Arc<dyn ErasedHandler<S>>
where
    H: Handler<HackT, S>,
    HackT: 'static,
    S: 'static,
{
    Arc::new(Erased {
        handler,
        _marker: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde::Deserialize;
    use serde_json::json;

    fn request(params: Option<JsonValue>) -> InboundRequest {
        InboundRequest {
            id: Some(Id::Number(1)),
            method: "test".to_string(),
            params,
            token: CancellationToken::new(),
        }
    }

    #[test]
    fn params_extractor_deserializes_named_arguments() {
        #[derive(Deserialize)]
        struct Args {
            a: i64,
            b: i64,
        }

        let req = request(Some(json!({"a": 1, "b": 2})));
        let Params(args) = Params::<Args>::from_request(&req, &()).unwrap();
        assert_eq!(args.a + args.b, 3);
    }

    #[test]
    fn params_extractor_coerces_single_element_arrays() {
        let req = request(Some(json!(["hi"])));
        let Params(s) = Params::<String>::from_request(&req, &()).unwrap();
        assert_eq!(s, "hi");

        // Tuples take the positional array whole.
        let req = request(Some(json!([1, 2])));
        let Params((a, b)) = Params::<(i64, i64)>::from_request(&req, &()).unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn absent_params_extract_as_no_arguments() {
        let req = request(None);
        let Params(v) = Params::<Option<i64>>::from_request(&req, &()).unwrap();
        assert_eq!(v, None);
        assert!(Params::<()>::from_request(&req, &()).is_ok());
    }

    #[test]
    fn params_rejection_is_invalid_params() {
        let req = request(Some(json!(["not a number"])));
        let rejection = Params::<i64>::from_request(&req, &()).unwrap_err();
        assert_eq!(rejection.code, crate::types::ErrorCode::InvalidParams);
    }

    #[test]
    fn id_extractor_rejects_notifications() {
        let mut req = request(None);
        req.id = None;
        assert!(<Id as FromRequest<()>>::from_request(&req, &()).is_err());
        assert_eq!(
            <Option<Id> as FromRequest<()>>::from_request(&req, &()).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn extraction_failure_runs_no_user_code() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static RAN: AtomicBool = AtomicBool::new(false);

        async fn target(Params(_n): Params<i64>) -> JsonValue {
            RAN.store(true, Ordering::SeqCst);
            json!(null)
        }

        let result = target.try_handle_method((), request(Some(json!(["nope"]))));
        match result {
            Err(ResponsePayload::Error(e)) => {
                assert_eq!(e.code, crate::types::ErrorCode::InvalidParams);
            }
            _ => panic!("expected extraction to fail"),
        }
        assert!(!RAN.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn handler_futures_produce_response_payloads() {
        async fn add(Params((a, b)): Params<(i64, i64)>) -> MethodResponse<i64> {
            Ok(a + b)
        }

        let fut = add
            .try_handle_method((), request(Some(json!([2, 3]))))
            .unwrap();
        assert_matches!(fut.await, ResponsePayload::Success(v) if v == json!(5));
    }

    #[tokio::test]
    async fn zero_argument_handlers_are_supported() {
        async fn ping() -> JsonValue {
            json!("pong")
        }

        let fut = ping.try_handle_method((), request(None)).unwrap();
        assert_matches!(fut.await, ResponsePayload::Success(v) if v == json!("pong"));
    }

    #[tokio::test]
    async fn unit_return_is_a_null_success() {
        async fn fire_and_forget(Params(_msg): Params<String>) {}

        let fut = fire_and_forget
            .try_handle_method((), request(Some(json!(["x"]))))
            .unwrap();
        assert_matches!(fut.await, ResponsePayload::Success(JsonValue::Null));
    }
}

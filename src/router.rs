//! Routing of decoded inbound requests and notifications to local targets.
//!
//! The router owns the method map.  Method names are transformed once at
//! registration by the configured [`NameTransform`]; a name may carry several
//! overloads as long as they differ in declared positional arity, with
//! resolution by arity first and then by argument coercibility.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use serde_json::Value as JsonValue;

use crate::handler::{
    BoxFuture, ErasedHandler, Handler, InboundRequest, MethodName, erase_handler,
};
use crate::types::{ErrorDetails, ResponsePayload};

/// Transform applied to method names once at registration time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NameTransform {
    /// Register names exactly as given.
    #[default]
    Identity,
    /// `snake_case` and `PascalCase` become `camelCase`.
    CamelCase,
    /// Prepend a fixed prefix, e.g. `"math/"`.
    Prefix(String),
}

impl NameTransform {
    pub fn apply(&self, name: &str) -> String {
        match self {
            NameTransform::Identity => name.to_string(),
            NameTransform::CamelCase => camel_case(name),
            NameTransform::Prefix(prefix) => format!("{prefix}{name}"),
        }
    }
}

fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' {
            upper_next = true;
            continue;
        }
        if out.is_empty() {
            out.extend(ch.to_lowercase());
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Declared positional arity of one registered overload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParamsArity {
    /// Accept any argument shape; coercion alone decides.
    #[default]
    Any,
    /// Exactly `n` positional arguments.  Absent params count as zero; named
    /// arguments never match an exact arity.
    Exact(usize),
}

impl ParamsArity {
    fn matches(&self, params: &Option<JsonValue>) -> bool {
        match self {
            ParamsArity::Any => true,
            ParamsArity::Exact(n) => match params {
                None => *n == 0,
                Some(JsonValue::Array(items)) => items.len() == *n,
                Some(_) => false,
            },
        }
    }
}

/// Per-registration options.
#[derive(Debug, Clone, Copy)]
pub struct MethodOptions {
    pub arity: ParamsArity,
    /// When false the target only answers method calls; notification dispatch
    /// to it is dropped.
    pub allow_notifications: bool,
}

impl Default for MethodOptions {
    fn default() -> Self {
        Self {
            arity: ParamsArity::Any,
            allow_notifications: true,
        }
    }
}

struct MethodEntry<S> {
    handler: Arc<dyn ErasedHandler<S>>,
    options: MethodOptions,
}

impl<S> Clone for MethodEntry<S> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            options: self.options,
        }
    }
}

type HandlersMap<S> = Arc<RwLock<HashMap<String, Vec<MethodEntry<S>>>>>;

/// How a notification dispatch resolved; the session engine owns the logging
/// policy for the non-running outcomes.
pub(crate) enum NotificationDispatch {
    Run(BoxFuture<()>),
    /// No target registered under this name.
    Unknown,
    /// A target exists but refused the dispatch (coercion failed or the
    /// target is call-only).
    Rejected,
}

impl std::fmt::Debug for NotificationDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationDispatch::Run(_) => f.write_str("Run(..)"),
            NotificationDispatch::Unknown => f.write_str("Unknown"),
            NotificationDispatch::Rejected => f.write_str("Rejected"),
        }
    }
}

/// The local method map of one session.
pub struct Router<S: Clone + Send + Sync + 'static = ()> {
    state: S,
    transform: NameTransform,
    fallback: Arc<dyn ErasedHandler<S>>,
    handlers: HandlersMap<S>,
}

impl<S: Clone + Send + Sync + 'static> Clone for Router<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            transform: self.transform.clone(),
            fallback: self.fallback.clone(),
            handlers: self.handlers.clone(),
        }
    }
}

impl Router {
    /// A router whose handlers need no shared state.
    pub fn new_stateless() -> Router<()> {
        Router::new_with_state(())
    }
}

impl<S: Clone + Send + Sync + 'static> Router<S> {
    /// A router whose handlers can access the given shared state.
    pub fn new_with_state(state: S) -> Self {
        Router {
            state,
            transform: NameTransform::Identity,
            fallback: erase_handler(fallback_handler),
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Set the transform applied to method names registered from here on.
    pub fn with_name_transform(mut self, transform: NameTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Replace the handler that answers unresolvable method calls.
    pub fn register_fallback_handler<H, HackT>(&mut self, handler: H)
    where
        H: Handler<HackT, S>,
        HackT: Send + Sync + 'static,
    {
        self.fallback = erase_handler(handler);
    }

    /// Register a target under `method` (after the name transform) accepting
    /// any argument shape.
    pub fn register_handler<H, HackT>(&mut self, method: impl Into<String>, handler: H)
    where
        H: Handler<HackT, S>,
        HackT: Send + Sync + 'static,
    {
        self.register_handler_with(method, MethodOptions::default(), handler);
    }

    /// Register an overload that matches exactly `arity` positional
    /// arguments.  Overloads under one name are tried in registration order.
    pub fn register_overload<H, HackT>(&mut self, method: impl Into<String>, arity: usize, handler: H)
    where
        H: Handler<HackT, S>,
        HackT: Send + Sync + 'static,
    {
        self.register_handler_with(
            method,
            MethodOptions {
                arity: ParamsArity::Exact(arity),
                ..MethodOptions::default()
            },
            handler,
        );
    }

    pub fn register_handler_with<H, HackT>(
        &mut self,
        method: impl Into<String>,
        options: MethodOptions,
        handler: H,
    ) where
        H: Handler<HackT, S>,
        HackT: Send + Sync + 'static,
    {
        let name = self.transform.apply(&method.into());
        let mut handlers = self.handlers.write().unwrap();
        handlers.entry(name).or_default().push(MethodEntry {
            handler: erase_handler(handler),
            options,
        });
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.read().unwrap().contains_key(method)
    }

    /// Resolve and start a method call, returning the future that produces
    /// its response payload.
    ///
    /// Unresolved names go to the fallback handler; a name whose overloads
    /// all reject the arguments answers with the last coercion rejection, or
    /// `InvalidParams` when no overload even matched the arity.
    pub(crate) fn dispatch_method(&self, request: InboundRequest) -> BoxFuture<ResponsePayload> {
        let entries = {
            let handlers = self.handlers.read().unwrap();
            handlers.get(&request.method).cloned()
        };

        let Some(entries) = entries else {
            return match self.fallback.try_handle_method(self.state.clone(), request) {
                Ok(fut) => fut,
                Err(payload) => futures::future::ready(payload).boxed(),
            };
        };

        let mut rejection = None;
        for entry in entries
            .iter()
            .filter(|entry| entry.options.arity.matches(&request.params))
        {
            match entry
                .handler
                .try_handle_method(self.state.clone(), request.clone())
            {
                Ok(fut) => return fut,
                Err(payload) => rejection = Some(payload),
            }
        }

        let payload = rejection.unwrap_or_else(|| {
            ResponsePayload::Error(ErrorDetails::invalid_params(
                format!(
                    "no overload of '{}' accepts {}",
                    request.method,
                    describe_params(&request.params)
                ),
                None,
            ))
        });
        futures::future::ready(payload).boxed()
    }

    /// Resolve a notification.  The fallback never runs for notifications;
    /// unresolved ones are reported so the engine can apply its drop policy.
    pub(crate) fn dispatch_notification(&self, request: InboundRequest) -> NotificationDispatch {
        let entries = {
            let handlers = self.handlers.read().unwrap();
            handlers.get(&request.method).cloned()
        };

        let Some(entries) = entries else {
            return NotificationDispatch::Unknown;
        };

        for entry in entries
            .iter()
            .filter(|entry| entry.options.arity.matches(&request.params))
        {
            if !entry.options.allow_notifications {
                continue;
            }
            if let Ok(fut) = entry
                .handler
                .try_handle_notification(self.state.clone(), request.clone())
            {
                return NotificationDispatch::Run(fut);
            }
        }

        NotificationDispatch::Rejected
    }
}

async fn fallback_handler(MethodName(name): MethodName) -> ErrorDetails {
    ErrorDetails::method_not_found(format!("unknown method '{name}'"), None)
}

fn describe_params(params: &Option<JsonValue>) -> String {
    match params {
        None => "no arguments".to_string(),
        Some(JsonValue::Array(items)) => format!("{} positional argument(s)", items.len()),
        Some(JsonValue::Object(fields)) => format!("{} named argument(s)", fields.len()),
        Some(_) => "a non-structured argument".to_string(),
    }
}

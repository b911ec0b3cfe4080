//! Handler capability, type erasure, and the tagged handler outcome.
//!
//! # How handlers are stored
//!
//! A mount table holds handlers of *different* kinds (inline async
//! functions, the CGI delegate, your own types) side by side, so every
//! handler is erased into one trait object:
//!
//! ```text
//! async fn hello(req: Request) -> Response { … }   ← procedure handler
//!        ↓ server.mount("/", hello)
//! hello.into_boxed_handler()                       ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(hello))                       ← heap-allocated wrapper
//!        ↓  stored as BoxedHandler = Arc<dyn Service>
//! handler.call(req)  at request time               ← one vtable dispatch
//!        ↓
//! Box::pin(async { hello(req).await.into_outcome() })
//! ```
//!
//! Types that need more than a function (state, configuration, a child
//! process) implement [`Service`] directly and get [`Handler`] with one line.
//!
//! # Outcomes
//!
//! A handler answers with an [`Outcome`]: a normal response, a [`Signal`]
//! (intentional short-circuit such as "404 now" or a redirect), or a
//! [`Fault`]. The dispatcher turns all three into exactly one response.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::StatusCode;

use crate::error::Fault;
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// A heap-allocated, type-erased future that resolves to an [`Outcome`].
pub type BoxFuture = Pin<Box<dyn Future<Output = Outcome> + Send + 'static>>;

/// The single operation every handler kind provides.
pub trait Service: Send + Sync + 'static {
    fn call(&self, req: Request) -> BoxFuture;
}

/// A type-erased handler shared across concurrent requests.
pub type BoxedHandler = Arc<dyn Service>;

/// Anything that can be mounted.
///
/// Satisfied automatically for every `async fn` (or closure) with the shape
///
/// ```text
/// async fn name(req: Request) -> impl IntoOutcome
/// ```
///
/// and implemented by hand for [`Service`] types such as
/// [`CgiHandler`](crate::cgi::CgiHandler).
pub trait Handler: Send + Sync + 'static {
    fn into_boxed_handler(self) -> BoxedHandler;
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Newtype wrapper that holds a procedure handler `F` and implements
/// [`Service`], bridging the typed world to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R> Service for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_outcome() })
    }
}

// ── Outcome ───────────────────────────────────────────────────────────────────

/// What a handler hands back to the dispatcher.
#[derive(Debug)]
pub enum Outcome {
    /// A normal response, written as-is.
    Respond(Response),
    /// Intentional short-circuit with a status; control flow, not a failure.
    Signal(Signal),
    /// Unexpected failure. Logged in full, answered with a generic 500.
    Fault(Fault),
}

/// An explicit status a handler wants sent instead of a normal response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    status: StatusCode,
    message: Option<String>,
    location: Option<String>,
}

impl Signal {
    pub fn new(status: StatusCode) -> Self {
        Self { status, message: None, location: None }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND).with_message(message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST).with_message(message)
    }

    /// A redirect to `location` with the given 3xx status.
    pub fn redirect(status: StatusCode, location: impl Into<String>) -> Self {
        Self { status, message: None, location: Some(location.into()) }
    }

    /// Text shown in the synthesized error page.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn status(&self) -> StatusCode { self.status }
    pub fn message(&self) -> Option<&str> { self.message.as_deref() }
    pub fn location(&self) -> Option<&str> { self.location.as_deref() }
}

/// Conversion into an [`Outcome`]; the return type bound of procedure
/// handlers.
pub trait IntoOutcome {
    fn into_outcome(self) -> Outcome;
}

impl IntoOutcome for Outcome {
    fn into_outcome(self) -> Outcome { self }
}

impl IntoOutcome for Signal {
    fn into_outcome(self) -> Outcome { Outcome::Signal(self) }
}

impl IntoOutcome for Fault {
    fn into_outcome(self) -> Outcome { Outcome::Fault(self) }
}

impl IntoOutcome for Response {
    fn into_outcome(self) -> Outcome { Outcome::Respond(self) }
}

impl IntoOutcome for &'static str {
    fn into_outcome(self) -> Outcome { Outcome::Respond(self.into_response()) }
}

impl IntoOutcome for String {
    fn into_outcome(self) -> Outcome { Outcome::Respond(self.into_response()) }
}

impl IntoOutcome for StatusCode {
    fn into_outcome(self) -> Outcome { Outcome::Respond(self.into_response()) }
}

/// `Err(Signal::not_found(..))?` style early returns.
impl<T: IntoResponse> IntoOutcome for Result<T, Signal> {
    fn into_outcome(self) -> Outcome {
        match self {
            Ok(res) => Outcome::Respond(res.into_response()),
            Err(signal) => Outcome::Signal(signal),
        }
    }
}

impl<T: IntoResponse> IntoOutcome for Result<T, Fault> {
    fn into_outcome(self) -> Outcome {
        match self {
            Ok(res) => Outcome::Respond(res.into_response()),
            Err(fault) => Outcome::Fault(fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::parse_for_test;

    async fn answer(handler: BoxedHandler) -> Outcome {
        let req = parse_for_test(b"GET /x HTTP/1.1\r\n\r\n").await.unwrap();
        handler.call(req).await
    }

    #[tokio::test]
    async fn procedure_handlers_see_the_request() {
        let handler = (|req: Request| async move { format!("path={}", req.path()) }).into_boxed_handler();
        match answer(handler).await {
            Outcome::Respond(res) => assert_eq!(res.body().as_ref(), b"path=/x"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn results_split_into_signals_and_faults() {
        let signalling = (|_req: Request| async { Err::<Response, _>(Signal::not_found("gone")) }).into_boxed_handler();
        match answer(signalling).await {
            Outcome::Signal(signal) => {
                assert_eq!(signal.status(), StatusCode::NOT_FOUND);
                assert_eq!(signal.message(), Some("gone"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let faulting = (|_req: Request| async { Err::<&'static str, _>(Fault::new("boom")) }).into_boxed_handler();
        assert!(matches!(answer(faulting).await, Outcome::Fault(_)));
    }

    struct Fixed;

    impl Service for Fixed {
        fn call(&self, _req: Request) -> BoxFuture {
            Box::pin(async { Outcome::Respond(Response::status(StatusCode::ACCEPTED)) })
        }
    }

    impl Handler for Fixed {
        fn into_boxed_handler(self) -> BoxedHandler { Arc::new(self) }
    }

    #[tokio::test]
    async fn service_types_mount_alongside_functions() {
        match answer(Fixed.into_boxed_handler()).await {
            Outcome::Respond(res) => assert_eq!(res.status_code(), StatusCode::ACCEPTED),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}

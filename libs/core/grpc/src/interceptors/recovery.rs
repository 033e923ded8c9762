use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use http::{HeaderMap, Request, Response};
use http_body::{Body as HttpBody, Frame, SizeHint};
use tonic::Status;
use tonic::body::Body;
use tower::{Layer, Service};

use super::tagging::CallTags;
use crate::telemetry::CallLogger;

#[cfg(panic = "abort")]
compile_error!("panic recovery needs `panic = \"unwind\"`; an aborting profile would take the server down on the first handler panic");

/// Innermost stage of the call chain: a panicking handler becomes an
/// `Internal` status instead of taking the connection down with it.
#[derive(Clone, Debug)]
pub struct RecoveryLayer {
    logger: CallLogger,
}

impl RecoveryLayer {
    pub fn new(logger: CallLogger) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService {
            inner,
            logger: self.logger.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecoveryService<S> {
    inner: S,
    logger: CallLogger,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RecoveryService<S>
where
    S: Service<Request<ReqBody>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let tags = request.extensions().get::<CallTags>().cloned();
        let logger = self.logger.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        // Some services do real work in `call` before handing back a future.
        let future = match catch_unwind(AssertUnwindSafe(|| inner.call(request))) {
            Ok(future) => future,
            Err(panic) => {
                let response = recovered(&logger, panic, tags.as_ref());
                return Box::pin(async move { Ok(response) });
            }
        };

        Box::pin(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(response)) => Ok(response
                    .map(|body| Body::new(RecoverBody::new(body, logger, tags)))),
                Ok(Err(err)) => Err(err),
                Err(panic) => Ok(recovered(&logger, panic, tags.as_ref())),
            }
        })
    }
}

fn recovered(
    logger: &CallLogger,
    panic: Box<dyn Any + Send>,
    tags: Option<&CallTags>,
) -> Response<Body> {
    let message = panic_message(panic.as_ref());
    report(logger, &message, tags);
    panic_status(&message).into_http::<Body>()
}

fn panic_status(message: &str) -> Status {
    Status::internal(format!("panic: {message}"))
}

fn panic_trailers(message: &str) -> HeaderMap {
    to_header_map(&panic_status(message))
        .or_else(|_| to_header_map(&Status::internal("panic")))
        .unwrap_or_default()
}

// `Status::to_header_map` is crate-private in tonic; same thing via `add_header`.
fn to_header_map(status: &Status) -> Result<HeaderMap, Status> {
    let mut header_map = HeaderMap::new();
    status.add_header(&mut header_map)?;
    Ok(header_map)
}

fn report(logger: &CallLogger, message: &str, tags: Option<&CallTags>) {
    logger.in_scope(|| match tags {
        Some(tags) => tracing::error!(
            grpc.service = %tags.service,
            grpc.method = %tags.method,
            request_id = %tags.request_id,
            panic = %message,
            "recovered from panic in gRPC handler"
        ),
        None => tracing::error!(panic = %message, "recovered from panic in gRPC handler"),
    });
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Response body guard for streaming handlers: a panic while producing the
/// next message ends the stream with `Internal` trailers.
pub struct RecoverBody<B> {
    inner: B,
    logger: CallLogger,
    tags: Option<CallTags>,
    done: bool,
}

impl<B> RecoverBody<B> {
    fn new(inner: B, logger: CallLogger, tags: Option<CallTags>) -> Self {
        Self {
            inner,
            logger,
            tags,
            done: false,
        }
    }
}

impl<B> HttpBody for RecoverBody<B>
where
    B: HttpBody<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let inner = &mut this.inner;
        match catch_unwind(AssertUnwindSafe(|| Pin::new(inner).poll_frame(cx))) {
            Ok(poll) => poll,
            Err(panic) => {
                this.done = true;
                let message = panic_message(panic.as_ref());
                report(&this.logger, &message, this.tags.as_ref());
                Poll::Ready(Some(Ok(Frame::trailers(panic_trailers(&message)))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        if self.done {
            SizeHint::with_exact(0)
        } else {
            self.inner.size_hint()
        }
    }
}

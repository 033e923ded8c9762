use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Request, Response};
use http_body::{Body as HttpBody, Frame, SizeHint};
use tonic::{Code, Status};
use tonic::body::Body;
use tower::{Layer, Service};
use tracing::Level;

use super::tagging::CallTags;
use crate::telemetry::CallLogger;

/// The `grpc-status` carried by a header or trailer block, if any.
pub(crate) fn status_code(headers: &http::HeaderMap) -> Option<Code> {
    Status::from_header_map(headers).map(|status| status.code())
}

/// Severity used for the end-of-call entry.
pub fn code_to_level(code: Code) -> Level {
    match code {
        Code::Ok
        | Code::Cancelled
        | Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::Unauthenticated => Level::INFO,
        Code::DeadlineExceeded
        | Code::PermissionDenied
        | Code::ResourceExhausted
        | Code::FailedPrecondition
        | Code::Aborted
        | Code::OutOfRange
        | Code::Unavailable => Level::WARN,
        Code::Unknown | Code::Unimplemented | Code::Internal | Code::DataLoss => Level::ERROR,
    }
}

/// Second stage of the call chain: one entry when a call starts and one when
/// its status is known.
#[derive(Clone, Debug)]
pub struct LogLayer {
    logger: CallLogger,
}

impl LogLayer {
    pub fn new(logger: CallLogger) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for LogLayer {
    type Service = LogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LogService {
            inner,
            logger: self.logger.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogService<S> {
    inner: S,
    logger: CallLogger,
}

impl<S, ReqBody> Service<Request<ReqBody>> for LogService<S>
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
        let tags = request
            .extensions()
            .get::<CallTags>()
            .cloned()
            .unwrap_or_else(|| CallTags::from_request(&request));
        let record = CallRecord::start(self.logger.clone(), tags);

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            match inner.call(request).await {
                Ok(response) => {
                    // Trailers-only responses carry the status in the headers.
                    if let Some(code) = status_code(response.headers()) {
                        record.finish(code);
                        return Ok(response);
                    }
                    Ok(response.map(|body| Body::new(LoggedBody::new(body, record))))
                }
                Err(err) => {
                    record.finish(Code::Unknown);
                    Err(err)
                }
            }
        })
    }
}

/// A call in flight. Logs exactly once, on `finish` or when dropped.
struct CallRecord {
    logger: CallLogger,
    tags: CallTags,
    started: Instant,
    finished: bool,
}

impl CallRecord {
    fn start(logger: CallLogger, tags: CallTags) -> Self {
        logger.in_scope(|| {
            tracing::debug!(
                grpc.service = %tags.service,
                grpc.method = %tags.method,
                grpc.start_time = %tags.start_time,
                grpc.request.deadline = tags.deadline.as_deref(),
                peer.address = tags.peer.map(|p| p.to_string()),
                request_id = %tags.request_id,
                user_agent = tags.user_agent.as_deref(),
                span.kind = "server",
                system = "grpc",
                "started call"
            )
        });
        Self {
            logger,
            tags,
            started: Instant::now(),
            finished: false,
        }
    }

    fn finish(mut self, code: Code) {
        self.emit(code);
    }

    fn emit(&mut self, code: Code) {
        if self.finished {
            return;
        }
        self.finished = true;

        let tags = &self.tags;
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let level = code_to_level(code);
        let code_name = format!("{code:?}");
        let peer = tags.peer.map(|p| p.to_string());

        macro_rules! finished {
            ($event:ident) => {
                tracing::$event!(
                    grpc.service = %tags.service,
                    grpc.method = %tags.method,
                    grpc.start_time = %tags.start_time,
                    grpc.code = %code_name,
                    grpc.time_ms = elapsed_ms,
                    peer.address = peer.as_deref(),
                    request_id = %tags.request_id,
                    span.kind = "server",
                    system = "grpc",
                    "finished call with code {}", code_name
                )
            };
        }

        self.logger.in_scope(|| {
            if level == Level::ERROR {
                finished!(error)
            } else if level == Level::WARN {
                finished!(warn)
            } else {
                finished!(info)
            }
        });
    }
}

impl Drop for CallRecord {
    fn drop(&mut self) {
        // Dropped before a status was seen: the client went away.
        self.emit(Code::Cancelled);
    }
}

/// Watches the response body for the trailers that carry the final status.
struct LoggedBody<B> {
    inner: B,
    record: Option<CallRecord>,
}

impl<B> LoggedBody<B> {
    fn new(inner: B, record: CallRecord) -> Self {
        Self {
            inner,
            record: Some(record),
        }
    }

    fn finish(&mut self, code: Code) {
        if let Some(record) = self.record.take() {
            record.finish(code);
        }
    }
}

impl<B> HttpBody for LoggedBody<B>
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
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        match &poll {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(trailers) = frame.trailers_ref() {
                    this.finish(status_code(trailers).unwrap_or(Code::Unknown));
                }
            }
            Poll::Ready(Some(Err(_))) => this.finish(Code::Internal),
            Poll::Ready(None) => this.finish(Code::Unknown),
            Poll::Pending => {}
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::test_support::CapturedLogs;
    use http_body_util::BodyExt;
    use std::convert::Infallible;
    use tower::ServiceExt;

    fn request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[test]
    fn test_code_to_level() {
        assert_eq!(code_to_level(Code::Ok), Level::INFO);
        assert_eq!(code_to_level(Code::NotFound), Level::INFO);
        assert_eq!(code_to_level(Code::Unavailable), Level::WARN);
        assert_eq!(code_to_level(Code::DeadlineExceeded), Level::WARN);
        assert_eq!(code_to_level(Code::Internal), Level::ERROR);
        assert_eq!(code_to_level(Code::Unknown), Level::ERROR);
    }

    #[tokio::test]
    async fn test_trailers_only_logged_immediately() {
        let logs = CapturedLogs::new();
        let inner = tower::service_fn(|_req: Request<()>| async move {
            Ok::<_, Infallible>(Status::not_found("missing").into_http::<Body>())
        });

        let svc = LogLayer::new(logs.logger()).layer(inner);
        let _res = svc.oneshot(request("/pkg.Things/Get")).await.unwrap();

        let out = logs.contents();
        assert!(out.contains("started call"));
        assert!(out.contains("finished call with code NotFound"));
        assert!(out.contains("pkg.Things"));
        assert!(out.contains("\"grpc.method\":\"Get\""));
    }

    #[tokio::test]
    async fn test_streamed_status_logged_from_trailers() {
        let logs = CapturedLogs::new();
        let inner = tower::service_fn(|_req: Request<()>| async move {
            let frames = futures::stream::iter(vec![
                Ok::<_, tonic::Status>(Frame::data(Bytes::from_static(b"one"))),
                Ok(Frame::data(Bytes::from_static(b"two"))),
                Ok(Frame::trailers({
                    let mut trailers = http::HeaderMap::new();
                    Status::ok("").add_header(&mut trailers).unwrap();
                    trailers
                })),
            ]);
            let body = Body::new(http_body_util::StreamBody::new(frames));
            Ok::<_, Infallible>(Response::new(body))
        });

        let svc = LogLayer::new(logs.logger()).layer(inner);
        let res = svc.oneshot(request("/pkg.Feed/Watch")).await.unwrap();
        assert!(!logs.contents().contains("finished call"));

        let _ = res.into_body().collect().await.unwrap();
        assert!(logs.contents().contains("finished call with code Ok"));
    }

    #[tokio::test]
    async fn test_dropped_body_logged_as_cancelled() {
        let logs = CapturedLogs::new();
        let inner = tower::service_fn(|_req: Request<()>| async move {
            let frames = futures::stream::pending::<Result<Frame<Bytes>, tonic::Status>>();
            let body = Body::new(http_body_util::StreamBody::new(frames));
            Ok::<_, Infallible>(Response::new(body))
        });

        let svc = LogLayer::new(logs.logger()).layer(inner);
        let res = svc.oneshot(request("/pkg.Feed/Watch")).await.unwrap();
        drop(res);

        let out = logs.contents();
        assert_eq!(out.matches("finished call").count(), 1);
        assert!(out.contains("finished call with code Cancelled"));
    }
}

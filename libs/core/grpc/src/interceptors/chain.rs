use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{Request, Response};
use tonic::body::Body;
use tower::{Layer, Service};

use super::logging::{LogLayer, LogService};
use super::recovery::{RecoveryLayer, RecoveryService};
use super::tagging::{TagLayer, TagService};
use crate::telemetry::CallLogger;

/// The standard server-side call chain.
///
/// Runs outer to inner as tagging, logging, recovery, handler, and unwinds in
/// reverse. Recovery sits closest to the handler so a panic is already a
/// status by the time logging sees the result.
///
/// # Example
/// ```ignore
/// use grpc_server::interceptors::CallChain;
/// use tower::Layer;
///
/// let chain = CallChain::new(CallLogger::current());
/// let svc = chain.layer(HealthServer::new(health));
/// ```
#[derive(Clone, Debug)]
pub struct CallChain {
    tag: TagLayer,
    log: LogLayer,
    recovery: RecoveryLayer,
}

impl CallChain {
    pub fn new(logger: CallLogger) -> Self {
        Self {
            tag: TagLayer,
            log: LogLayer::new(logger.clone()),
            recovery: RecoveryLayer::new(logger),
        }
    }
}

impl<S> Layer<S> for CallChain {
    type Service = TagService<LogService<RecoveryService<S>>>;

    fn layer(&self, inner: S) -> Self::Service {
        self.tag.layer(self.log.layer(self.recovery.layer(inner)))
    }
}

/// Layer installed on every server. Applies the [`CallChain`] when one was
/// configured and passes calls straight through otherwise.
#[derive(Clone, Debug, Default)]
pub struct ServerLayer {
    chain: Option<CallChain>,
}

impl ServerLayer {
    pub fn new(chain: Option<CallChain>) -> Self {
        Self { chain }
    }

    pub fn is_intercepting(&self) -> bool {
        self.chain.is_some()
    }
}

impl<S> Layer<S> for ServerLayer {
    type Service = ServerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        match &self.chain {
            Some(chain) => ServerService::Chained(chain.layer(inner)),
            None => ServerService::Plain(inner),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ServerService<S> {
    Chained(TagService<LogService<RecoveryService<S>>>),
    Plain(S),
}

impl<S, ReqBody> Service<Request<ReqBody>> for ServerService<S>
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
        match self {
            ServerService::Chained(svc) => svc.poll_ready(cx),
            ServerService::Plain(svc) => svc.poll_ready(cx),
        }
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        match self {
            ServerService::Chained(svc) => svc.call(request),
            ServerService::Plain(svc) => Box::pin(svc.call(request)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::logging::status_code;
    use crate::interceptors::tagging::{CallTags, REQUEST_ID_HEADER};
    use crate::telemetry::test_support::CapturedLogs;
    use std::convert::Infallible;
    use tonic::Code;
    use tower::ServiceExt;

    fn request() -> Request<()> {
        Request::builder()
            .uri("/demo.Greeter/SayHello")
            .header(REQUEST_ID_HEADER, "chain-test")
            .body(())
            .unwrap()
    }

    #[tokio::test]
    async fn test_chain_recovers_and_logs_panics() {
        let logs = CapturedLogs::new();
        let inner = tower::service_fn(|req: Request<()>| async move {
            // Tags were attached by the outermost stage.
            assert!(req.extensions().get::<CallTags>().is_some());
            if true {
                panic!("greeter blew up");
            }
            Ok::<_, Infallible>(Response::new(Body::empty()))
        });

        let svc = CallChain::new(logs.logger()).layer(inner);
        let res = svc.oneshot(request()).await.unwrap();

        assert_eq!(status_code(res.headers()), Some(Code::Internal));
        assert_eq!(res.headers()[REQUEST_ID_HEADER], "chain-test");

        let out = logs.contents();
        assert!(out.contains("finished call with code Internal"));
        assert!(out.contains("\"request_id\":\"chain-test\""));
        assert!(out.contains("\"level\":\"ERROR\""));
        assert!(out.contains("recovered from panic in gRPC handler"));
        assert!(out.contains("\"panic\":\"greeter blew up\""));
    }

    #[tokio::test]
    async fn test_plain_server_layer_passes_through() {
        let inner = tower::service_fn(|req: Request<()>| async move {
            assert!(req.extensions().get::<CallTags>().is_none());
            Ok::<_, Infallible>(Response::new(Body::empty()))
        });

        let layer = ServerLayer::default();
        assert!(!layer.is_intercepting());
        let res = layer.layer(inner).oneshot(request()).await.unwrap();
        assert!(res.headers().get(REQUEST_ID_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_chained_server_layer_tags_calls() {
        let logs = CapturedLogs::new();
        let inner = tower::service_fn(|_req: Request<()>| async move {
            Ok::<_, Infallible>(tonic::Status::ok("").into_http::<Body>())
        });

        let layer = ServerLayer::new(Some(CallChain::new(logs.logger())));
        assert!(layer.is_intercepting());
        let res = layer.layer(inner).oneshot(request()).await.unwrap();

        assert_eq!(res.headers()[REQUEST_ID_HEADER], "chain-test");
        assert!(logs.contents().contains("finished call with code Ok"));
    }
}

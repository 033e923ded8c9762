use std::net::SocketAddr;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{HeaderValue, Request, Response};
use tonic::body::Body;
use tonic::transport::server::{TcpConnectInfo, TlsConnectInfo};
use tower::{Layer, Service};

/// Header used to correlate a call across services.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Fields identifying a call, collected before anything else runs.
///
/// Stored in the request extensions so later stages (and handlers) can read
/// them without re-parsing the request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallTags {
    pub service: String,
    pub method: String,
    pub peer: Option<SocketAddr>,
    pub request_id: String,
    pub user_agent: Option<String>,
    pub deadline: Option<String>,
    pub start_time: String,
}

impl CallTags {
    /// Collect tags from an incoming request.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let (service, method) = split_path(request.uri().path());
        let headers = request.headers();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Self {
            service,
            method,
            peer: peer_addr(request),
            request_id: header(REQUEST_ID_HEADER)
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            user_agent: header("user-agent"),
            deadline: header("grpc-timeout"),
            start_time: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Full method name in `/package.Service/Method` form.
    pub fn full_method(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// Split `/package.Service/Method` into its service and method parts.
fn split_path(path: &str) -> (String, String) {
    match path.trim_start_matches('/').split_once('/') {
        Some((service, method)) if !service.is_empty() && !method.is_empty() => {
            (service.to_string(), method.to_string())
        }
        _ => ("unknown".to_string(), "unknown".to_string()),
    }
}

fn peer_addr<B>(request: &Request<B>) -> Option<SocketAddr> {
    let extensions = request.extensions();
    extensions
        .get::<TcpConnectInfo>()
        .and_then(TcpConnectInfo::remote_addr)
        .or_else(|| {
            extensions
                .get::<TlsConnectInfo<TcpConnectInfo>>()
                .and_then(|info| info.get_ref().remote_addr())
        })
}

/// First stage of the call chain: attaches [`CallTags`] to every call.
#[derive(Clone, Copy, Debug, Default)]
pub struct TagLayer;

impl<S> Layer<S> for TagLayer {
    type Service = TagService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TagService { inner }
    }
}

#[derive(Clone, Debug)]
pub struct TagService<S> {
    inner: S,
}

impl<S, ReqBody> Service<Request<ReqBody>> for TagService<S>
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

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let tags = CallTags::from_request(&request);
        let request_id = HeaderValue::from_str(&tags.request_id).ok();

        // Handlers see the same id the logs carry.
        if let Some(id) = request_id.clone() {
            request.headers_mut().insert(REQUEST_ID_HEADER, id);
        }
        request.extensions_mut().insert(tags);

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let mut response = inner.call(request).await?;
            if let Some(id) = request_id {
                response.headers_mut().insert(REQUEST_ID_HEADER, id);
            }
            Ok(response)
        })
    }
}

//! Request forwarding to the gateway-protected backend.
//!
//! # Request Lifecycle
//! ```text
//! Received
//!     → Rewritten      scheme + authority replaced, path and query kept
//!     → Authenticated  Authorization: Bearer <token> attached
//!     → (sanitized)    hop-by-hop headers stripped, X-Forwarded-For folded
//!     → Dispatched     one attempt, no retry
//!     → Relayed        hop-by-hop headers stripped, status + headers copied,
//!                      body streamed
//!
//! Dispatched ──error──→ Failed (502 / 504, fixed body)
//! ```
//!
//! # Design Decisions
//! - `ForwardConfig` is built once and shared read-only; no locking
//! - A failed dispatch only fails its own request
//! - Request bodies are never buffered; response bodies only up to
//!   `BUFFERED_BODY_LIMIT`
//! - The upstream body is dropped (closed) on every exit path because it is
//!   owned by the relayed response or by nothing at all

use axum::{
    body::{Body, Bytes, HttpBody},
    extract::{ConnectInfo, State},
    http::{
        header::{AUTHORIZATION, HOST},
        request,
        uri::{Authority, PathAndQuery, Scheme},
        HeaderValue, Request, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
    BoxError,
};
use http_body_util::BodyExt;
use hyper::body::{Frame, SizeHint};
use hyper_tls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::BearerToken;
use crate::config::{AuthorizationMode, ProxyConfig};
use crate::observability::metrics;
use crate::security::headers::{client_ip, copy_all, fold_forwarded_for, strip_hop_headers};

/// Outbound HTTP(S) client. No cookie jar, no redirect following: a 3xx from
/// the backend goes back to the caller untouched.
pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Build the outbound client.
pub fn build_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build(HttpsConnector::new())
}

/// Errors building the forwarding configuration.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid backend URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported backend scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("backend URL has no host")]
    MissingHost,

    #[error("invalid backend authority: {0}")]
    Authority(#[from] axum::http::uri::InvalidUri),

    #[error("token cannot be sent in an Authorization header")]
    InvalidToken,
}

/// The single upstream: scheme and authority only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    scheme: Scheme,
    authority: Authority,
}

impl Backend {
    /// Parse a backend URL such as `https://app.example.com`. Any path is ignored.
    pub fn parse(raw: &str) -> Result<Self, SetupError> {
        let url = url::Url::parse(raw)?;
        let scheme = match url.scheme() {
            "http" => Scheme::HTTP,
            "https" => Scheme::HTTPS,
            other => return Err(SetupError::UnsupportedScheme(other.to_string())),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or(SetupError::MissingHost)?;
        let authority = match url.port() {
            Some(port) => Authority::from_str(&format!("{}:{}", host, port))?,
            None => Authority::from_str(host)?,
        };
        Ok(Self { scheme, authority })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Point `uri` at this backend, keeping its path and query.
    pub fn rewrite(&self, uri: &Uri) -> Result<Uri, axum::http::Error> {
        let path_and_query = uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// Immutable per-process forwarding configuration.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    backend: Backend,
    authorization: HeaderValue,
    mode: AuthorizationMode,
    upstream_timeout: Option<Duration>,
}

impl ForwardConfig {
    /// Forward to `backend` with `token`, appending the credential.
    pub fn new(backend: Backend, token: &BearerToken) -> Result<Self, SetupError> {
        Ok(Self {
            backend,
            authorization: token.header_value().ok_or(SetupError::InvalidToken)?,
            mode: AuthorizationMode::Append,
            upstream_timeout: None,
        })
    }

    /// Build from the validated process configuration.
    pub fn from_config(config: &ProxyConfig, token: &BearerToken) -> Result<Self, SetupError> {
        Ok(Self::new(Backend::parse(&config.backend.url)?, token)?
            .with_authorization_mode(config.credentials.authorization)
            .with_upstream_timeout(config.timeouts.upstream_secs.map(Duration::from_secs)))
    }

    pub fn with_authorization_mode(mut self, mode: AuthorizationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

/// Per-request failures. None of them outlive the request.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to rewrite request target: {0}")]
    Rewrite(#[from] axum::http::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("upstream body failed: {0}")]
    Body(BoxError),
}

impl ForwardError {
    fn status(&self) -> StatusCode {
        match self {
            ForwardError::Rewrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ForwardError::Upstream(_) | ForwardError::Body(_) => StatusCode::BAD_GATEWAY,
            ForwardError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ForwardError::Rewrite(_) => "rewrite",
            ForwardError::Upstream(_) => "upstream",
            ForwardError::Timeout(_) => "timeout",
            ForwardError::Body(_) => "body",
        }
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        // Detail stays in the logs.
        let status = self.status();
        let reason = status.canonical_reason().unwrap_or("Server Error");
        (status, reason).into_response()
    }
}

/// Application state injected into the handler.
#[derive(Clone)]
pub struct AppState {
    pub forward: Arc<ForwardConfig>,
    pub client: HttpClient,
}

impl AppState {
    pub fn new(forward: ForwardConfig) -> Self {
        Self {
            forward: Arc::new(forward),
            client: build_client(),
        }
    }
}

/// Turn an inbound request into the outbound one.
///
/// Only method, rewritten URI, sanitized headers and the untouched body make
/// it across; version and extensions of the inbound request are dropped.
pub fn prepare_outbound(
    config: &ForwardConfig,
    parts: request::Parts,
    body: Body,
    remote_addr: &str,
) -> Result<Request<Body>, ForwardError> {
    let uri = config.backend.rewrite(&parts.uri)?;
    let mut headers = parts.headers;
    headers.remove(HOST);

    if config.mode == AuthorizationMode::Replace {
        headers.remove(AUTHORIZATION);
    }
    headers.append(AUTHORIZATION, config.authorization.clone());

    strip_hop_headers(&mut headers);

    match client_ip(remote_addr) {
        Some(ip) => fold_forwarded_for(&mut headers, &ip),
        None => tracing::debug!(remote_addr = %remote_addr, "Cannot split remote address; X-Forwarded-For untouched"),
    }

    let mut outbound = Request::builder().method(parts.method).uri(uri).body(body)?;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}

/// Issue the single upstream attempt.
pub async fn dispatch(
    state: &AppState,
    outbound: Request<Body>,
) -> Result<Response<hyper::body::Incoming>, ForwardError> {
    let call = state.client.request(outbound);
    match state.forward.upstream_timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ForwardError::Timeout(limit)),
        },
        None => Ok(call.await?),
    }
}

/// Upstream bodies that end within this many bytes are relayed whole, with
/// an exact length; longer ones are streamed.
pub const BUFFERED_BODY_LIMIT: usize = 2048;

/// Build the caller's response from the backend's.
///
/// The upstream framing never reaches the caller: hop-by-hop headers are
/// dropped and a short body is collected so the server can send it with a
/// `Content-Length` instead of re-chunking it. Trailers of a collected body
/// are discarded.
pub async fn relay<B>(upstream: Response<B>) -> Result<Response, ForwardError>
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let (mut parts, body) = upstream.into_parts();
    strip_hop_headers(&mut parts.headers);

    let mut rest = Box::pin(body);
    let mut head = Vec::new();
    let body = loop {
        if rest.is_end_stream() {
            break Body::from(head);
        }
        match rest.frame().await {
            None => break Body::from(head),
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    head.extend_from_slice(data);
                }
            }
            Some(Err(e)) => return Err(ForwardError::Body(e.into())),
        }
        if head.len() > BUFFERED_BODY_LIMIT {
            break Body::new(Resumed {
                head: Some(Bytes::from(head)),
                rest,
            });
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = parts.status;
    copy_all(response.headers_mut(), &parts.headers);
    Ok(response)
}

/// An upstream body with its first bytes already read.
struct Resumed<B> {
    head: Option<Bytes>,
    rest: Pin<Box<B>>,
}

impl<B> HttpBody for Resumed<B>
where
    B: HttpBody<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        if let Some(head) = self.head.take() {
            return Poll::Ready(Some(Ok(Frame::data(head))));
        }
        self.rest.as_mut().poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.head.is_none() && self.rest.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let rest = self.rest.size_hint();
        let held = self.head.as_ref().map_or(0, |h| h.len() as u64);
        let mut hint = SizeHint::new();
        hint.set_lower(rest.lower() + held);
        if let Some(upper) = rest.upper() {
            hint.set_upper(upper + held);
        }
        hint
    }
}

/// Main proxy handler. Every request, whatever its method or path, ends here.
pub async fn forward(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4();
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();

    tracing::info!(
        request_id = %request_id,
        remote_addr = %remote_addr,
        method = %parts.method,
        uri = %parts.uri,
        "Forwarding request"
    );

    let result = match prepare_outbound(&state.forward, parts, body, &remote_addr.to_string()) {
        Ok(outbound) => dispatch(&state, outbound).await,
        Err(e) => Err(e),
    };

    let result = match result {
        Ok(upstream) => {
            tracing::info!(
                request_id = %request_id,
                remote_addr = %remote_addr,
                status = %upstream.status(),
                "Upstream responded"
            );
            relay(upstream).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(response) => {
            metrics::record_request(method.as_str(), response.status().as_u16(), start);
            response
        }
        Err(e) => {
            tracing::error!(
                request_id = %request_id,
                remote_addr = %remote_addr,
                backend = %state.forward.backend,
                error = %e,
                "Forwarding failed"
            );
            metrics::record_upstream_error(e.kind());
            metrics::record_request(method.as_str(), e.status().as_u16(), start);
            e.into_response()
        }
    }
}

//! Request forwarding with bounded retry
//!
//! A request is buffered once and sent to the next backend from the pool. On a
//! network-class failure the same buffered request is replayed against the next
//! backend, up to [`MAX_ATTEMPTS`] sends in total. Any HTTP response, 5xx
//! included, is returned to the client as-is.
//!
//! Upgrade requests (WebSocket) are sent once without a body. When the backend
//! switches protocols, both upgraded connections are spliced together.

use crate::balancer::BackendPool;
use crate::config::ProxyConfig;
use crate::error::{json_error_response, ProxyErrorCode};
use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Total sends per request, first attempt included
pub const MAX_ATTEMPTS: usize = 3;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Longest client-supplied request ID passed on to backends
const MAX_REQUEST_ID_LEN: usize = 128;

/// Headers that only apply to a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Failure of a single upstream send
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before response: {0}")]
    Closed(String),

    #[error("upstream protocol error: {0}")]
    Protocol(String),

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    /// Network-class failures that another backend may not have
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::Connect(_) | UpstreamError::Timeout(_) | UpstreamError::Closed(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Timeout(_))
    }

    /// Classify a client error by walking its source chain
    pub fn from_client_error(err: hyper_util::client::legacy::Error) -> Self {
        if err.is_connect() {
            return UpstreamError::Connect(error_chain(&err));
        }

        let mut source = err.source();
        while let Some(cause) = source {
            if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
                if hyper_err.is_incomplete_message()
                    || hyper_err.is_canceled()
                    || hyper_err.is_closed()
                    || hyper_err.is_timeout()
                {
                    return UpstreamError::Closed(error_chain(&err));
                }
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                use std::io::ErrorKind::*;
                if matches!(
                    io_err.kind(),
                    ConnectionRefused | ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof
                ) {
                    return UpstreamError::Closed(error_chain(&err));
                }
            }
            source = cause.source();
        }

        UpstreamError::Protocol(error_chain(&err))
    }
}

fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no backends available")]
    NoBackendsAvailable,

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("all {attempts} attempts failed, last error: {last}")]
    Exhausted { attempts: usize, last: UpstreamError },

    #[error("{0}")]
    Upstream(UpstreamError),
}

impl ForwardError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ForwardError::NoBackendsAvailable => ProxyErrorCode::NoBackendsAvailable,
            ForwardError::PayloadTooLarge { .. } => ProxyErrorCode::PayloadTooLarge,
            ForwardError::Body(_) => ProxyErrorCode::BadRequest,
            ForwardError::Exhausted { last, .. } if last.is_timeout() => ProxyErrorCode::RequestTimeout,
            ForwardError::Exhausted { .. } => ProxyErrorCode::ConnectionFailed,
            ForwardError::Upstream(_) => ProxyErrorCode::ConnectionFailed,
        }
    }

    /// JSON error response; upstream details stay in the logs
    pub fn into_response(self) -> Response<ProxyBody> {
        let message = match &self {
            ForwardError::NoBackendsAvailable => "No backends available".to_string(),
            ForwardError::PayloadTooLarge { limit } => {
                format!("Request body exceeds {} bytes", limit)
            }
            ForwardError::Body(_) => "Failed to read request body".to_string(),
            ForwardError::Exhausted { last, .. } if last.is_timeout() => {
                "Backend did not respond in time".to_string()
            }
            ForwardError::Exhausted { .. } | ForwardError::Upstream(_) => {
                "Failed to connect to backend".to_string()
            }
        };
        json_error_response(self.code(), message)
    }
}

/// Transport used to send one attempt to a backend
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, UpstreamError>;
}

/// Pooled HTTP/1.1 client with connect and per-attempt timeouts
pub struct HttpUpstream {
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
}

impl HttpUpstream {
    pub fn new(config: &ProxyConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout()));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout())
            .build(connector);

        debug!(
            max_idle = config.pool_max_idle_per_host,
            idle_timeout_secs = config.pool_idle_timeout_secs,
            request_timeout_secs = config.request_timeout_secs,
            "Upstream client initialized"
        );

        Self {
            client,
            request_timeout: config.request_timeout(),
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, UpstreamError> {
        match tokio::time::timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => {
                let (parts, body) = response.into_parts();
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Ok(Err(e)) => Err(UpstreamError::from_client_error(e)),
            Err(_) => Err(UpstreamError::Timeout(self.request_timeout)),
        }
    }
}

/// Where a request came from
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    pub is_tls: bool,
}

/// Forwards requests to the backend pool
pub struct Forwarder {
    pool: Arc<BackendPool>,
    upstream: Arc<dyn Upstream>,
    user_header: Option<HeaderName>,
    max_body_bytes: usize,
}

impl Forwarder {
    pub fn new(pool: Arc<BackendPool>, upstream: Arc<dyn Upstream>, config: &ProxyConfig) -> Self {
        let user_header = match HeaderName::from_bytes(config.user_header.as_bytes()) {
            Ok(name) => Some(name),
            Err(_) => {
                warn!(header = %config.user_header, "Invalid user header name, not stripping it");
                None
            }
        };

        Self {
            pool,
            upstream,
            user_header,
            max_body_bytes: config.max_body_bytes,
        }
    }

    pub async fn forward<B>(&self, req: Request<B>, client: &ClientInfo) -> Result<Response<ProxyBody>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        if self.pool.is_empty() {
            return Err(ForwardError::NoBackendsAvailable);
        }

        if is_upgrade_request(req.headers()) {
            return self.forward_upgrade(req, client).await;
        }

        let (parts, body) = req.into_parts();

        let declared_len = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared_len.is_some_and(|len| len > self.max_body_bytes) {
            return Err(ForwardError::PayloadTooLarge { limit: self.max_body_bytes });
        }

        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return Err(ForwardError::PayloadTooLarge { limit: self.max_body_bytes });
            }
            Err(e) => return Err(ForwardError::Body(e.to_string())),
        };

        let request_id = request_id_for(&parts.headers);
        let headers = self.upstream_headers(&parts, client, &request_id);
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let backend = self.pool.next().ok_or(ForwardError::NoBackendsAvailable)?;
            let uri = backend.target_uri(path_and_query);

            let mut builder = Request::builder()
                .method(parts.method.clone())
                .uri(&uri)
                .version(Version::HTTP_11);
            if let Some(h) = builder.headers_mut() {
                *h = headers.clone();
            }
            let upstream_req = builder
                .body(Full::new(body.clone()))
                .map_err(|e| ForwardError::Upstream(UpstreamError::InvalidRequest(e.to_string())))?;

            debug!(
                attempt,
                backend = %backend,
                method = %parts.method,
                path = %path_and_query,
                request_id = %request_id,
                "Forwarding request"
            );

            match self.upstream.send(upstream_req).await {
                Ok(mut response) => {
                    strip_hop_by_hop(response.headers_mut());
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        backend = %backend,
                        request_id = %request_id,
                        error = %e,
                        "Backend attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    error!(backend = %backend, request_id = %request_id, error = %e, "Backend request failed");
                    return Err(ForwardError::Upstream(e));
                }
            }
        }

        let last = last_error.unwrap_or_else(|| UpstreamError::Connect("no attempt made".to_string()));
        error!(
            attempts = MAX_ATTEMPTS,
            request_id = %request_id,
            error = %last,
            "All backend attempts failed"
        );
        Err(ForwardError::Exhausted {
            attempts: MAX_ATTEMPTS,
            last,
        })
    }

    /// Send an upgrade request once and splice the connections on 101
    async fn forward_upgrade<B>(
        &self,
        mut req: Request<B>,
        client: &ClientInfo,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let client_upgrade = hyper::upgrade::on(&mut req);
        let (parts, _) = req.into_parts();

        let request_id = request_id_for(&parts.headers);
        let mut headers = self.upstream_headers(&parts, client, &request_id);
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        if let Some(protocol) = parts.headers.get(UPGRADE) {
            headers.insert(UPGRADE, protocol.clone());
        }

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let backend = self.pool.next().ok_or(ForwardError::NoBackendsAvailable)?;

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(backend.target_uri(path_and_query))
            .version(Version::HTTP_11);
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        let upstream_req = builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| ForwardError::Upstream(UpstreamError::InvalidRequest(e.to_string())))?;

        debug!(
            backend = %backend,
            path = %path_and_query,
            request_id = %request_id,
            "Forwarding upgrade request"
        );

        let mut response = match self.upstream.send(upstream_req).await {
            Ok(response) => response,
            Err(e) => {
                error!(backend = %backend, request_id = %request_id, error = %e, "Upgrade request failed");
                return Err(ForwardError::Upstream(e));
            }
        };

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            strip_hop_by_hop(response.headers_mut());
            return Ok(response);
        }

        let backend_upgrade = hyper::upgrade::on(&mut response);
        let protocol = response.headers().get(UPGRADE).cloned();
        strip_hop_by_hop(response.headers_mut());
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("upgrade"));
        if let Some(protocol) = protocol {
            response.headers_mut().insert(UPGRADE, protocol);
        }

        tokio::spawn(tunnel(client_upgrade, backend_upgrade, backend.to_string(), request_id));
        Ok(response)
    }

    /// Client headers rewritten for the backend.
    ///
    /// X-Forwarded-* are overwritten rather than appended; the gateway is the
    /// first trusted hop.
    fn upstream_headers(&self, parts: &hyper::http::request::Parts, client: &ClientInfo, request_id: &str) -> HeaderMap {
        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);

        if let Some(name) = &self.user_header {
            headers.remove(name);
        }

        // HTTP/2 clients send :authority instead of Host
        if !headers.contains_key(HOST) {
            if let Some(value) = parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            {
                headers.insert(HOST, value);
            }
        }

        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client.addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = headers.get(HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
        let proto = if client.is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

        headers
    }
}

/// Copy bytes both ways between the upgraded client and backend connections
async fn tunnel(client: OnUpgrade, backend: OnUpgrade, target: String, request_id: String) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(upgraded) => upgraded,
        Err(e) => {
            debug!(backend = %target, request_id = %request_id, error = %e, "Upgrade not completed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((from_client, from_backend)) => {
            debug!(
                backend = %target,
                request_id = %request_id,
                from_client,
                from_backend,
                "Upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(backend = %target, request_id = %request_id, error = %e, "Upgraded connection error");
        }
    }
}

/// `Connection: upgrade` together with an `Upgrade` protocol
fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    wants_upgrade && headers.contains_key(UPGRADE)
}

/// Reuse a well-formed client request ID, otherwise generate one
fn request_id_for(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|id| is_valid_request_id(id))
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn is_valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

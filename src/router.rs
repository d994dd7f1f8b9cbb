//! Request routing for the gateway, status and redirect listeners

use crate::acme::Http01Challenges;
use crate::assets;
use crate::balancer::BackendPool;
use crate::directory::{DirectoryAuthenticator, LOGIN_FAILED_MESSAGE};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::forward::{ClientInfo, Forwarder, ProxyBody};
use crate::listener::Handler;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE, HOST, LOCATION};
use hyper::{Method, Request, Response, StatusCode};
use secrecy::SecretString;
use serde::Deserialize;
use std::error::Error as StdError;
use std::sync::Arc;
use tracing::{debug, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Header carrying the gateway version on its own responses
pub const VERSION_HEADER: &str = "x-ldap-proxy-version";

/// Largest login form accepted
const MAX_FORM_BYTES: usize = 64 * 1024;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(full(body))
        .expect("valid response with StatusCode enum and static header")
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<ProxyBody> {
    response(status, "application/json", body.to_string())
}

/// Headers added to every response the gateway produces itself
fn decorate(mut resp: Response<ProxyBody>) -> Response<ProxyBody> {
    let headers = resp.headers_mut();
    headers.insert(VERSION_HEADER, HeaderValue::from_static(VERSION));
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, max-age=0, must-revalidate"),
    );
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
    resp
}

fn method_not_allowed(method: &Method, path: &str) -> Response<ProxyBody> {
    json_error_response(
        ProxyErrorCode::MethodNotAllowed,
        format!("Method {} not allowed on {}", method, path),
    )
}

#[derive(Debug, Default, Deserialize)]
struct LoginForm {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// Login routes under the root prefix, everything else to the backends
pub struct Gateway {
    root: String,
    title: String,
    authenticator: Arc<DirectoryAuthenticator>,
    forwarder: Arc<Forwarder>,
}

impl Gateway {
    pub fn new(
        root: &str,
        title: impl Into<String>,
        authenticator: Arc<DirectoryAuthenticator>,
        forwarder: Arc<Forwarder>,
    ) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
            title: title.into(),
            authenticator,
            forwarder,
        }
    }

    /// Path below the root prefix if the request targets the gateway itself
    fn local_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.root.as_str())?;
        rest.starts_with('/').then_some(rest)
    }

    pub async fn route<B>(&self, req: Request<B>, client: &ClientInfo) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let local = match self.local_path(&path) {
            Some(local) => local,
            None => return self.proxy(req, client).await,
        };

        if let Some(name) = local.strip_prefix("/assets/") {
            return decorate(match method {
                Method::GET | Method::HEAD => match assets::asset(name) {
                    Some(asset) => response(StatusCode::OK, asset.content_type, asset.body),
                    None => json_error_response(
                        ProxyErrorCode::NotFound,
                        format!("Asset {} not found", name),
                    ),
                },
                _ => method_not_allowed(&method, &path),
            });
        }

        match local {
            "/login" => decorate(match method {
                Method::GET | Method::HEAD => self.login_page(StatusCode::OK, "", None),
                Method::POST => self.login(req).await,
                _ => method_not_allowed(&method, &path),
            }),
            "/ping" => decorate(match method {
                Method::GET | Method::HEAD => {
                    json_response(StatusCode::OK, serde_json::json!({ "message": "pong" }))
                }
                _ => method_not_allowed(&method, &path),
            }),
            _ => self.proxy(req, client).await,
        }
    }

    async fn proxy<B>(&self, req: Request<B>, client: &ClientInfo) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let method = req.method().clone();
        let uri = req.uri().clone();

        match self.forwarder.forward(req, client).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(%method, %uri, client = %client.addr, error = %e, "Forwarding failed");
                e.into_response()
            }
        }
    }

    fn login_page(&self, status: StatusCode, username: &str, error: Option<&str>) -> Response<ProxyBody> {
        let page = assets::login_page(&self.title, &self.root, username, error);
        response(status, "text/html; charset=utf-8", page)
    }

    async fn login<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let body = match Limited::new(req.into_body(), MAX_FORM_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, "Failed to read login form");
                return json_error_response(ProxyErrorCode::BadRequest, "Invalid login form");
            }
        };

        let form: LoginForm = match serde_urlencoded::from_bytes(&body) {
            Ok(form) => form,
            Err(e) => {
                debug!(error = %e, "Failed to decode login form");
                return json_error_response(ProxyErrorCode::BadRequest, "Invalid login form");
            }
        };

        let username = form.username.trim().to_string();
        let password = SecretString::from(form.password);

        if username.is_empty() {
            return self.login_page(StatusCode::UNAUTHORIZED, "", Some(LOGIN_FAILED_MESSAGE));
        }

        match self.authenticator.authenticate(&username, &password).await {
            Ok(_) => Response::builder()
                .status(StatusCode::SEE_OTHER)
                .header(LOCATION, "/")
                .body(full(Bytes::new()))
                .expect("valid response with StatusCode enum and static header"),
            Err(e) => self.login_page(StatusCode::UNAUTHORIZED, &username, Some(e.user_message())),
        }
    }
}

#[async_trait]
impl Handler for Gateway {
    async fn handle(&self, req: Request<Incoming>, client: ClientInfo) -> Response<ProxyBody> {
        self.route(req, &client).await
    }
}

/// Liveness, readiness and version endpoints
pub struct StatusRouter {
    pool: Arc<BackendPool>,
}

impl StatusRouter {
    pub fn new(pool: Arc<BackendPool>) -> Self {
        Self { pool }
    }

    pub fn route<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        let resp = match (req.method(), req.uri().path()) {
            (&Method::GET, "/healthz") => response(StatusCode::OK, "text/plain", "ok"),
            (&Method::GET, "/readyz") => {
                if self.pool.is_empty() {
                    json_error_response(ProxyErrorCode::NoBackendsAvailable, "No backends configured")
                } else {
                    json_response(
                        StatusCode::OK,
                        serde_json::json!({ "status": "ready", "backends": self.pool.len() }),
                    )
                }
            }
            (&Method::GET, "/version") => json_response(
                StatusCode::OK,
                serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
            ),
            (_, path) => json_error_response(ProxyErrorCode::NotFound, format!("{} not found", path)),
        };
        decorate(resp)
    }
}

#[async_trait]
impl Handler for StatusRouter {
    async fn handle(&self, req: Request<Incoming>, _client: ClientInfo) -> Response<ProxyBody> {
        self.route(&req)
    }
}

/// Plain HTTP listener while TLS is enabled: ACME challenges, otherwise redirect
pub struct RedirectRouter {
    https_port: u16,
    fallback_host: String,
    challenges: Option<Http01Challenges>,
}

impl RedirectRouter {
    pub fn new(https_port: u16, fallback_host: impl Into<String>) -> Self {
        Self {
            https_port,
            fallback_host: fallback_host.into(),
            challenges: None,
        }
    }

    pub fn with_challenges(mut self, challenges: Http01Challenges) -> Self {
        self.challenges = Some(challenges);
        self
    }

    pub fn route<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        let path = req.uri().path();

        if let (Some(challenges), Some(token)) = (&self.challenges, path.strip_prefix(ACME_CHALLENGE_PREFIX)) {
            return match challenges.get(token) {
                Some(key_authorization) => {
                    debug!(token, "Serving ACME challenge");
                    response(StatusCode::OK, "text/plain", key_authorization)
                }
                None => {
                    warn!(token, "Unknown ACME challenge token");
                    json_error_response(ProxyErrorCode::NotFound, "Unknown challenge token")
                }
            };
        }

        let location = self.location(req);
        debug!(%location, "Redirecting to HTTPS");
        Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(LOCATION, location)
            .body(full(Bytes::new()))
            .unwrap_or_else(|_| json_error_response(ProxyErrorCode::BadRequest, "Invalid redirect target"))
    }

    fn location<B>(&self, req: &Request<B>) -> String {
        let host = req
            .uri()
            .host()
            .map(str::to_string)
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(strip_port)
            })
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.fallback_host.clone());

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        if self.https_port == 443 {
            format!("https://{}{}", host, path_and_query)
        } else {
            format!("https://{}:{}{}", host, self.https_port, path_and_query)
        }
    }
}

#[async_trait]
impl Handler for RedirectRouter {
    async fn handle(&self, req: Request<Incoming>, _client: ClientInfo) -> Response<ProxyBody> {
        self.route(&req)
    }
}

/// Host header without its port, keeping IPv6 brackets
fn strip_port(host: &str) -> String {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => host[..=end].to_string(),
            None => host.to_string(),
        };
    }
    host.split(':').next().unwrap_or(host).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::directory::tests::{test_config, FakeDirectory};
    use crate::forward::{Upstream, UpstreamError};
    use parking_lot::Mutex;

    /// Upstream that answers 200 and records request paths
    #[derive(Default)]
    struct RecordingUpstream {
        paths: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Upstream for RecordingUpstream {
        async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, UpstreamError> {
            self.paths.lock().push(req.uri().path().to_string());
            Ok(Response::new(full("backend")))
        }
    }

    fn gateway(dir: &FakeDirectory, upstream: Arc<RecordingUpstream>) -> Gateway {
        let pool = Arc::new(BackendPool::from_endpoints(&["http://10.0.0.1:8080"]));
        let forwarder = Arc::new(Forwarder::new(pool, upstream, &ProxyConfig::default()));
        let authenticator = Arc::new(DirectoryAuthenticator::new(Arc::new(dir.clone()), &test_config()));
        Gateway::new("/ldap-proxy", "Intranet", authenticator, forwarder)
    }

    fn client() -> ClientInfo {
        ClientInfo {
            addr: "127.0.0.1:40000".parse().unwrap(),
            is_tls: false,
        }
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .header("host", "gate.example.com")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn login_post(form: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri("/ldap-proxy/login")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(form.to_string())))
            .unwrap()
    }

    async fn body_string(resp: Response<ProxyBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let gw = gateway(&FakeDirectory::new(), Arc::default());
        let resp = gw.route(get("/ldap-proxy/ping"), &client()).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(VERSION_HEADER).unwrap(), VERSION);
        assert_eq!(body_string(resp).await, r#"{"message":"pong"}"#);
    }

    #[tokio::test]
    async fn test_login_page() {
        let gw = gateway(&FakeDirectory::new(), Arc::default());
        let resp = gw.route(get("/ldap-proxy/login"), &client()).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[CONTENT_TYPE].to_str().unwrap().starts_with("text/html"));
        assert_eq!(resp.headers()["x-frame-options"], "DENY");
        let body = body_string(resp).await;
        assert!(body.contains("<title>Intranet</title>"));
        assert!(body.contains(r#"action="/ldap-proxy/login""#));
    }

    #[tokio::test]
    async fn test_assets() {
        let gw = gateway(&FakeDirectory::new(), Arc::default());

        let resp = gw.route(get("/ldap-proxy/assets/styles.css"), &client()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[CONTENT_TYPE].to_str().unwrap().starts_with("text/css"));

        let resp = gw.route(get("/ldap-proxy/assets/missing.js"), &client()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()["x-proxy-error"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_successful_login_redirects_to_root() {
        let dir = FakeDirectory::new().with_user("alice", "wonderland");
        let gw = gateway(&dir, Arc::default());

        let resp = gw.route(login_post("username=alice&password=wonderland"), &client()).await;

        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers()[LOCATION], "/");
    }

    #[tokio::test]
    async fn test_failed_login_shows_generic_error() {
        let dir = FakeDirectory::new().with_user("alice", "wonderland");
        let gw = gateway(&dir, Arc::default());

        let wrong_password = gw.route(login_post("username=alice&password=nope"), &client()).await;
        assert_eq!(wrong_password.status(), StatusCode::UNAUTHORIZED);
        let wrong_password = body_string(wrong_password).await;

        let unknown_user = gw.route(login_post("username=bob&password=nope"), &client()).await;
        assert_eq!(unknown_user.status(), StatusCode::UNAUTHORIZED);
        let unknown_user = body_string(unknown_user).await;

        assert!(wrong_password.contains(LOGIN_FAILED_MESSAGE));
        assert!(unknown_user.contains(LOGIN_FAILED_MESSAGE));
        assert!(!wrong_password.contains("nope"));
    }

    #[tokio::test]
    async fn test_empty_username_never_reaches_directory() {
        let dir = FakeDirectory::new();
        let gw = gateway(&dir, Arc::default());

        let resp = gw.route(login_post("username=++&password=x"), &client()).await;

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(dir.events().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_method_on_gateway_route() {
        let gw = gateway(&FakeDirectory::new(), Arc::default());
        let req = Request::builder()
            .method("DELETE")
            .uri("/ldap-proxy/ping")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let resp = gw.route(req, &client()).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_other_paths_are_forwarded() {
        let upstream = Arc::new(RecordingUpstream::default());
        let gw = gateway(&FakeDirectory::new(), Arc::clone(&upstream));

        for uri in ["/", "/app/login", "/ldap-proxyfoo", "/ldap-proxy/unknown"] {
            let resp = gw.route(get(uri), &client()).await;
            assert_eq!(resp.status(), StatusCode::OK, "{}", uri);
        }

        assert_eq!(
            upstream.paths.lock().as_slice(),
            ["/", "/app/login", "/ldap-proxyfoo", "/ldap-proxy/unknown"]
        );
    }

    #[tokio::test]
    async fn test_gateway_at_site_root() {
        let upstream = Arc::new(RecordingUpstream::default());
        let pool = Arc::new(BackendPool::from_endpoints(&["http://10.0.0.1:8080"]));
        let forwarder = Arc::new(Forwarder::new(pool, Arc::clone(&upstream) as Arc<dyn Upstream>, &ProxyConfig::default()));
        let authenticator = Arc::new(DirectoryAuthenticator::new(Arc::new(FakeDirectory::new()), &test_config()));
        let gw = Gateway::new("/", "LDAP Proxy", authenticator, forwarder);

        let resp = gw.route(get("/ping"), &client()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(upstream.paths.lock().is_empty());
    }

    #[test]
    fn test_status_endpoints() {
        let ready = StatusRouter::new(Arc::new(BackendPool::from_endpoints(&["http://10.0.0.1"])));
        let empty = StatusRouter::new(Arc::new(BackendPool::from_endpoints::<&str>(&[])));

        assert_eq!(ready.route(&get("/healthz")).status(), StatusCode::OK);
        assert_eq!(empty.route(&get("/healthz")).status(), StatusCode::OK);
        assert_eq!(ready.route(&get("/readyz")).status(), StatusCode::OK);
        assert_eq!(empty.route(&get("/readyz")).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ready.route(&get("/version")).status(), StatusCode::OK);
        assert_eq!(ready.route(&get("/metrics")).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_redirect_to_https() {
        let router = RedirectRouter::new(443, "gate.example.com");
        let resp = router.route(&get("/app?x=1"));
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(resp.headers()[LOCATION], "https://gate.example.com/app?x=1");

        let router = RedirectRouter::new(8443, "fallback.example.com");
        let req = Request::builder()
            .uri("/")
            .header("host", "gate.example.com:8080")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(router.route(&req).headers()[LOCATION], "https://gate.example.com:8443/");
    }

    #[tokio::test]
    async fn test_acme_challenges_are_answered() {
        let challenges = Http01Challenges::new();
        challenges.set("tok3n".to_string(), "tok3n.thumbprint".to_string());
        let router = RedirectRouter::new(443, "gate.example.com").with_challenges(challenges);

        let resp = router.route(&get("/.well-known/acme-challenge/tok3n"));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "tok3n.thumbprint");

        let resp = router.route(&get("/.well-known/acme-challenge/other"));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("gate.example.com:8080"), "gate.example.com");
        assert_eq!(strip_port("gate.example.com"), "gate.example.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
    }
}

//! HTTP/1.1 and HTTP/2 listener with bounded graceful shutdown

use crate::error::{json_error_response, ProxyErrorCode};
use crate::forward::{ClientInfo, ProxyBody};
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Serves requests accepted by a listener
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Incoming>, client: ClientInfo) -> Response<ProxyBody>;
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Time allowed for the client to send request headers
    pub read: Duration,
    /// Deadline for producing a response
    pub write: Duration,
    /// How long in-flight connections may drain on shutdown
    pub grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(5),
            write: Duration::from_secs(10),
            grace: Duration::from_secs(1),
        }
    }
}

pub struct HttpListener {
    name: String,
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    handler: Arc<dyn Handler>,
    timeouts: Timeouts,
    shutdown_rx: watch::Receiver<bool>,
}

impl HttpListener {
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        handler: Arc<dyn Handler>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name: name.into(),
            addr,
            tls: None,
            handler,
            timeouts: Timeouts::default(),
            shutdown_rx,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Bind and serve until shutdown is signalled
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| anyhow::anyhow!("{} listener failed to bind {}: {}", self.name, self.addr, e))?;
        self.serve(listener).await
    }

    /// Serve on an already bound socket until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls.is_some() { "HTTPS" } else { "HTTP" };
        info!(listener = %self.name, addr = %local_addr, protocol, "Listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut connections = JoinSet::new();

        if !*shutdown_rx.borrow_and_update() {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let conn = Connection {
                                    addr,
                                    tls: self.tls.clone(),
                                    handler: Arc::clone(&self.handler),
                                    timeouts: self.timeouts,
                                    shutdown_rx: self.shutdown_rx.clone(),
                                };
                                connections.spawn(conn.run(stream));
                            }
                            Err(e) => {
                                error!(listener = %self.name, error = %e, "Failed to accept connection");
                            }
                        }
                    }
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }

        drop(listener);
        info!(
            listener = %self.name,
            in_flight = connections.len(),
            "Listener shutting down"
        );

        let drained = tokio::time::timeout(self.timeouts.grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                listener = %self.name,
                remaining = connections.len(),
                grace_ms = self.timeouts.grace.as_millis() as u64,
                "Grace period expired, closing remaining connections"
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        info!(listener = %self.name, "Listener stopped");
        Ok(())
    }
}

struct Connection {
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    handler: Arc<dyn Handler>,
    timeouts: Timeouts,
    shutdown_rx: watch::Receiver<bool>,
}

impl Connection {
    async fn run(self, stream: tokio::net::TcpStream) {
        let addr = self.addr;
        match self.tls.clone() {
            Some(acceptor) => {
                match tokio::time::timeout(self.timeouts.read, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => self.serve(tls_stream, true).await,
                    Ok(Err(e)) => debug!(addr = %addr, error = %e, "TLS handshake failed"),
                    Err(_) => debug!(addr = %addr, "TLS handshake timed out"),
                }
            }
            None => self.serve(stream, false).await,
        }
    }

    async fn serve<S>(self, stream: S, is_tls: bool)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let client = ClientInfo {
            addr: self.addr,
            is_tls,
        };
        let handler = self.handler;
        let write_timeout = self.timeouts.write;

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = Arc::clone(&handler);
            async move { Ok::<_, hyper::Error>(respond(handler, req, client, write_timeout).await) }
        });

        let mut builder = AutoBuilder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.timeouts.read);
        builder
            .http2()
            .timer(TokioTimer::new())
            .max_concurrent_streams(250);

        let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
        tokio::pin!(conn);

        let mut shutdown_rx = self.shutdown_rx;
        let mut draining = *shutdown_rx.borrow_and_update();
        if draining {
            conn.as_mut().graceful_shutdown();
        }

        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!(addr = %client.addr, error = %e, "Connection error");
                    }
                    break;
                }
                changed = shutdown_rx.changed(), if !draining => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        draining = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
        }
    }
}

/// Run the handler under the write deadline
async fn respond(
    handler: Arc<dyn Handler>,
    req: Request<Incoming>,
    client: ClientInfo,
    write_timeout: Duration,
) -> Response<ProxyBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match tokio::time::timeout(write_timeout, handler.handle(req, client)).await {
        Ok(response) => {
            debug!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                client = %client.addr,
                "Request served"
            );
            response
        }
        Err(_) => {
            warn!(
                method = %method,
                path = %path,
                timeout_secs = write_timeout.as_secs(),
                "Request exceeded write deadline"
            );
            json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", write_timeout.as_secs()),
            )
        }
    }
}

//! Round robin pool of backend endpoints
//!
//! The pool is built once at startup and never changes afterwards; only the
//! shared cursor moves.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};
use url::Url;

/// A backend base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    url: Url,
}

impl Backend {
    /// Parse a backend URL. Only absolute `http://` URLs with a host are accepted.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let url = Url::parse(raw.trim()).map_err(|e| e.to_string())?;

        if url.scheme() != "http" {
            return Err(format!("unsupported scheme '{}'", url.scheme()));
        }
        if url.host_str().is_none() {
            return Err("missing host".to_string());
        }

        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `host:port` of the backend
    pub fn authority(&self) -> String {
        match (self.url.host_str(), self.url.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        }
    }

    /// Build the upstream URI for a request path and query
    pub fn target_uri(&self, path_and_query: &str) -> String {
        let base = self.url.path().trim_end_matches('/');
        let path_and_query = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{}", path_and_query)
        };

        format!("http://{}{}{}", self.authority(), base, path_and_query)
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Backends selected in insertion order through a shared cursor
#[derive(Debug, Default)]
pub struct BackendPool {
    backends: Vec<Backend>,
    cursor: AtomicUsize,
}

impl BackendPool {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            backends,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Build a pool from configured endpoint strings, dropping malformed entries
    pub fn from_endpoints<S: AsRef<str>>(endpoints: &[S]) -> Self {
        let mut backends = Vec::with_capacity(endpoints.len());

        for raw in endpoints {
            let raw = raw.as_ref();
            if raw.trim().is_empty() {
                continue;
            }
            match Backend::parse(raw) {
                Ok(backend) => backends.push(backend),
                Err(reason) => {
                    warn!(endpoint = %raw, reason = %reason, "Ignoring malformed backend endpoint");
                }
            }
        }

        info!(backends = backends.len(), "Backend pool ready");
        Self::new(backends)
    }

    /// Next backend in round robin order, `None` when the pool is empty
    pub fn next(&self) -> Option<&Backend> {
        if self.backends.is_empty() {
            return None;
        }

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        let backend = &self.backends[idx];
        debug!(backend = %backend, "Selected backend");
        Some(backend)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }
}

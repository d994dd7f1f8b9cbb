//! Wires configuration into the supervised listeners

use crate::acme::AcmeManager;
use crate::balancer::BackendPool;
use crate::config::Config;
use crate::directory::{DirectoryAuthenticator, DirectoryConnector, LdapConnector};
use crate::forward::{Forwarder, HttpUpstream, Upstream};
use crate::listener::{Handler, HttpListener, Timeouts};
use crate::router::{Gateway, RedirectRouter, StatusRouter};
use crate::supervisor::{signal_watcher, Supervisor};
use crate::tls::{server_config, static_acceptor, CertConfig, CertSource, TlsPolicy};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Resolve a listener address; `:port` listens on every IPv4 interface
async fn resolve_addr(name: &str, addr: &str) -> anyhow::Result<SocketAddr> {
    let target = match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_string(),
    };

    let resolved = tokio::net::lookup_host(target.as_str())
        .await
        .with_context(|| format!("invalid {} '{}'", name, addr))?
        .next()
        .with_context(|| format!("{} '{}' resolved to no address", name, addr))?;

    if resolved.to_string() != target {
        debug!(setting = name, addr = %addr, resolved = %resolved, "Listener address resolved");
    }
    Ok(resolved)
}

/// Register a listener whose interrupt flips its shutdown channel
fn add_listener(
    supervisor: &mut Supervisor,
    name: &str,
    addr: SocketAddr,
    handler: Arc<dyn Handler>,
    tls: Option<TlsAcceptor>,
    timeouts: Timeouts,
) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listener = HttpListener::new(name, addr, handler, shutdown_rx).with_timeouts(timeouts);
    if let Some(acceptor) = tls {
        listener = listener.with_tls(acceptor);
    }

    supervisor.add(name, listener.run(), move || {
        let _ = shutdown_tx.send(true);
    });
}

/// Register the certificate manager as an actor
fn add_acme(supervisor: &mut Supervisor, manager: Arc<AcmeManager>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut stop = shutdown_rx.clone();

    supervisor.add(
        "acme",
        async move {
            // Issuance in progress must not hold up shutdown
            tokio::select! {
                result = manager.run(shutdown_rx) => result,
                _ = stop.changed() => anyhow::Ok(()),
            }
        },
        move || {
            let _ = shutdown_tx.send(true);
        },
    );
}

/// Build every component and run until the first actor exits
pub async fn run(config: Config) -> anyhow::Result<()> {
    let server = &config.server;
    let timeouts = Timeouts {
        read: server.read_timeout(),
        write: server.write_timeout(),
        grace: server.shutdown_grace(),
    };

    let pool = Arc::new(BackendPool::from_endpoints(&config.proxy.endpoints));
    if pool.is_empty() {
        warn!("No backends configured, proxied requests will fail with 503");
    }

    let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(&config.proxy));
    let forwarder = Arc::new(Forwarder::new(Arc::clone(&pool), upstream, &config.proxy));

    let connector: Arc<dyn DirectoryConnector> = Arc::new(LdapConnector::new(&config.ldap));
    let authenticator = Arc::new(DirectoryAuthenticator::new(connector, &config.ldap));
    info!(
        addr = %config.ldap.url(),
        base = %config.ldap.base_dn,
        user_attr = %config.ldap.user_attr,
        "Directory configured"
    );

    let gateway: Arc<dyn Handler> = Arc::new(Gateway::new(
        server.root_prefix(),
        config.proxy.title.clone(),
        authenticator,
        forwarder,
    ));

    let mut supervisor = Supervisor::new();

    add_listener(
        &mut supervisor,
        "status",
        resolve_addr("health_addr", &server.health_addr).await?,
        Arc::new(StatusRouter::new(Arc::clone(&pool))),
        None,
        timeouts,
    );

    let public_addr = resolve_addr("public_addr", &server.public_addr).await?;

    match server.cert_config()? {
        None => {
            add_listener(&mut supervisor, "public", public_addr, gateway, None, timeouts);
        }
        Some(cert) => {
            let secure_addr = resolve_addr("secure_addr", &server.secure_addr).await?;
            let policy = TlsPolicy::new(server.cipher_policy(), server.curve_policy());
            let fallback_host = server
                .public_hostname()
                .unwrap_or_else(|| "localhost".to_string());
            let mut redirect = RedirectRouter::new(secure_addr.port(), fallback_host);

            let acceptor = match cert {
                CertConfig::Static { cert_path, key_path } => {
                    static_acceptor(&cert_path, &key_path, &policy)?
                }
                CertConfig::Automatic { hostname, cache_dir } => {
                    std::fs::create_dir_all(&cache_dir).with_context(|| {
                        format!("failed to create certificate cache '{}'", cache_dir.display())
                    })?;

                    let manager = Arc::new(AcmeManager::new(&hostname, &cache_dir, config.acme.clone())?);
                    info!(
                        hostname = %hostname,
                        cache_dir = %cache_dir.display(),
                        email = ?config.acme.email,
                        "Automatic certificates enabled"
                    );

                    let tls_config = server_config(&policy, CertSource::Resolver(manager.resolver()))?;
                    redirect = redirect.with_challenges(manager.http01_challenges());
                    add_acme(&mut supervisor, manager);
                    TlsAcceptor::from(Arc::new(tls_config))
                }
            };

            add_listener(&mut supervisor, "public", public_addr, Arc::new(redirect), None, timeouts);
            add_listener(&mut supervisor, "secure", secure_addr, gateway, Some(acceptor), timeouts);
        }
    }

    let (signal_run, signal_interrupt) = signal_watcher();
    supervisor.add("signal", signal_run, signal_interrupt);

    info!(actors = supervisor.len(), "Starting");
    supervisor.run().await?;
    Ok(())
}

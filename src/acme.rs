//! Automatic certificates via ACME (Let's Encrypt)
//!
//! The manager obtains a certificate for the public hostname using the HTTP-01
//! challenge, which the plain listener answers at `/.well-known/acme-challenge/`.
//! Certificates and the account credentials are cached on disk:
//!
//! - `{cache_dir}/account.json`
//! - `{cache_dir}/{hostname}/cert.pem`
//! - `{cache_dir}/{hostname}/key.pem` (mode 0600 on Unix)
//!
//! The TLS listener serves the cached certificate through [`CertResolver`], which
//! wakes the manager when no certificate is loaded or the current one is close to
//! expiry.

use crate::config::AcmeConfig;
use crate::tls::parse_private_key;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, warn};

/// Renew certificates with less than this many days left
pub const RENEW_BEFORE_DAYS: i64 = 30;

/// Interval between periodic expiry checks
pub const RECHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

const RETRY_BACKOFF_MIN: Duration = Duration::from_secs(60);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(60 * 60);
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 30;

/// Pending ACME challenges for HTTP-01 validation, keyed by token
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: String, key_authorization: String) {
        self.inner.write().insert(token, key_authorization);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.inner.read().get(token).cloned()
    }

    pub fn remove(&self, token: &str) {
        self.inner.write().remove(token);
    }
}

/// Certificate currently served, with its expiry as a Unix timestamp
#[derive(Clone)]
struct LoadedCert {
    key: Arc<CertifiedKey>,
    not_after: i64,
}

impl LoadedCert {
    fn new(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> anyhow::Result<Self> {
        let leaf = certs
            .first()
            .ok_or_else(|| anyhow::anyhow!("Certificate chain is empty"))?;
        let not_after = cert_not_after(leaf)?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;

        Ok(Self {
            key: Arc::new(CertifiedKey::new(certs, signing_key)),
            not_after,
        })
    }

    fn needs_renewal(&self) -> bool {
        remaining_days(self.not_after) < RENEW_BEFORE_DAYS
    }
}

type SharedCert = Arc<RwLock<Option<LoadedCert>>>;

/// Serves the automatic certificate on every TLS handshake
pub struct CertResolver {
    hostname: String,
    current: SharedCert,
    wake: Arc<Notify>,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("hostname", &self.hostname)
            .field("loaded", &self.current.read().is_some())
            .finish()
    }
}

impl CertResolver {
    /// Certificate for the requested server name, if it is ours and loaded
    fn select(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        match server_name {
            Some(name) if name.eq_ignore_ascii_case(&self.hostname) => {}
            Some(name) => {
                debug!(server_name = %name, "Rejecting handshake for unknown host");
                return None;
            }
            None => {
                debug!("Rejecting handshake without server name");
                return None;
            }
        }

        let current = self.current.read();
        match current.as_ref() {
            Some(cert) => {
                if cert.needs_renewal() {
                    self.wake.notify_one();
                }
                Some(Arc::clone(&cert.key))
            }
            None => {
                self.wake.notify_one();
                None
            }
        }
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.select(client_hello.server_name())
    }
}

/// On-disk cache for the account credentials and the issued certificate
#[derive(Debug, Clone)]
pub struct CertCache {
    root: PathBuf,
    hostname: String,
}

impl CertCache {
    pub fn new(root: PathBuf, hostname: &str) -> Self {
        Self {
            root,
            hostname: hostname.to_string(),
        }
    }

    pub fn account_path(&self) -> PathBuf {
        self.root.join("account.json")
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.root.join(&self.hostname)
    }

    fn load_account(&self) -> anyhow::Result<Option<AccountCredentials>> {
        let path = self.account_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn save_account(&self, credentials: &AccountCredentials) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let data = serde_json::to_string_pretty(credentials)?;
        write_private(&self.account_path(), data.as_bytes())?;
        info!(path = %self.account_path().display(), "ACME account credentials saved");
        Ok(())
    }

    /// Cached certificate chain and key, if both files are present and parse
    pub fn load(&self) -> anyhow::Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
        let cert_path = self.cert_dir().join("cert.pem");
        let key_path = self.cert_dir().join("key.pem");

        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let cert_data = std::fs::read(&cert_path)?;
        let key_data = std::fs::read(&key_path)?;

        let certs = rustls_pemfile::certs(&mut BufReader::new(&cert_data[..]))
            .collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            warn!(path = %cert_path.display(), "Cached certificate file holds no certificates");
            return Ok(None);
        }

        match parse_private_key(&key_data)? {
            Some(key) => Ok(Some((certs, key))),
            None => {
                warn!(path = %key_path.display(), "Cached key file holds no private key");
                Ok(None)
            }
        }
    }

    pub fn save(&self, cert_chain_pem: &str, private_key_pem: &str) -> anyhow::Result<()> {
        let dir = self.cert_dir();
        std::fs::create_dir_all(&dir)?;

        let cert_path = dir.join("cert.pem");
        std::fs::write(&cert_path, cert_chain_pem)?;
        write_private(&dir.join("key.pem"), private_key_pem.as_bytes())?;

        info!(path = %cert_path.display(), "Certificate saved to cache");
        Ok(())
    }
}

/// Obtains and renews the certificate for one hostname
pub struct AcmeManager {
    hostname: String,
    config: AcmeConfig,
    cache: CertCache,
    challenges: Http01Challenges,
    current: SharedCert,
    wake: Arc<Notify>,
    issue_lock: Mutex<()>,
}

impl AcmeManager {
    pub fn new(hostname: &str, cache_dir: &Path, config: AcmeConfig) -> anyhow::Result<Self> {
        let cache_dir = validate_cache_dir(cache_dir)?;
        Ok(Self {
            hostname: hostname.to_lowercase(),
            config,
            cache: CertCache::new(cache_dir, &hostname.to_lowercase()),
            challenges: Http01Challenges::new(),
            current: Arc::new(RwLock::new(None)),
            wake: Arc::new(Notify::new()),
            issue_lock: Mutex::new(()),
        })
    }

    pub fn http01_challenges(&self) -> Http01Challenges {
        self.challenges.clone()
    }

    pub fn resolver(&self) -> Arc<CertResolver> {
        Arc::new(CertResolver {
            hostname: self.hostname.clone(),
            current: Arc::clone(&self.current),
            wake: Arc::clone(&self.wake),
        })
    }

    pub fn has_certificate(&self) -> bool {
        self.current.read().is_some()
    }

    fn install(&self, certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> anyhow::Result<bool> {
        let loaded = LoadedCert::new(certs, key)?;
        let fresh = !loaded.needs_renewal();
        *self.current.write() = Some(loaded);
        Ok(fresh)
    }

    fn current_is_fresh(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .map(|c| !c.needs_renewal())
            .unwrap_or(false)
    }

    /// Load the on-disk certificate into memory. Returns whether it is fresh.
    pub fn load_cached(&self) -> anyhow::Result<bool> {
        match self.cache.load()? {
            Some((certs, key)) => {
                let fresh = self.install(certs, key)?;
                info!(
                    hostname = %self.hostname,
                    fresh,
                    "Loaded cached certificate"
                );
                Ok(fresh)
            }
            None => Ok(false),
        }
    }

    /// Make sure a fresh certificate is loaded, issuing one if needed.
    ///
    /// Calls are serialized, and each one re-checks memory and disk before
    /// contacting the CA.
    pub async fn ensure_certificate(&self) -> anyhow::Result<()> {
        let _guard = self.issue_lock.lock().await;

        if self.current_is_fresh() {
            return Ok(());
        }

        if self.load_cached()? {
            return Ok(());
        }

        info!(hostname = %self.hostname, "Certificate missing or expiring, requesting a new one");
        let account = self.account().await?;
        let (certs, key, cert_pem, key_pem) = self.obtain_certificate(&account).await?;
        self.cache.save(&cert_pem, &key_pem)?;
        self.install(certs, key)?;
        Ok(())
    }

    /// Load or create the ACME account
    async fn account(&self) -> anyhow::Result<Account> {
        if let Some(credentials) = self.cache.load_account()? {
            debug!(path = %self.cache.account_path().display(), "Loading existing ACME account");
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!("Creating new ACME account");
        let directory_url = self
            .config
            .directory_url
            .as_deref()
            .unwrap_or(LetsEncrypt::Production.url());

        let contact = self.config.email.as_ref().map(|e| format!("mailto:{}", e));
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await?;

        self.cache.save_account(&credentials)?;
        Ok(account)
    }

    /// Run an HTTP-01 order for the hostname
    async fn obtain_certificate(
        &self,
        account: &Account,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>, String, String)> {
        let identifiers = [Identifier::Dns(self.hostname.clone())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let Identifier::Dns(domain) = &authz.identifier;
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("HTTP-01 challenge not offered for {}", domain))?;

            let key_auth = order.key_authorization(challenge);
            debug!(domain = %domain, token = %challenge.token, "Serving HTTP-01 challenge");
            self.challenges
                .set(challenge.token.clone(), key_auth.as_str().to_string());

            let result = self.validate_authorization(&mut order, &challenge.url, domain).await;
            self.challenges.remove(&challenge.token);
            result?;
        }

        let mut polls = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("Order invalid"),
                OrderStatus::Pending | OrderStatus::Processing => {
                    polls += 1;
                    if polls > MAX_POLLS {
                        anyhow::bail!("Order timeout");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        let mut params = CertificateParams::new(vec![self.hostname.clone()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, self.hostname.clone());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let mut polls = 0;
        let cert_chain_pem = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => match order.certificate().await? {
                    Some(cert) => break cert,
                    None => anyhow::bail!("Order valid but no certificate returned"),
                },
                OrderStatus::Processing => {
                    polls += 1;
                    if polls > MAX_POLLS {
                        anyhow::bail!("Certificate timeout");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                status => anyhow::bail!("Unexpected order status: {:?}", status),
            }
        };

        let private_key_pem = private_key.serialize_pem();
        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_chain_pem.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let key = PrivateKeyDer::try_from(private_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

        info!(hostname = %self.hostname, "Certificate obtained successfully");
        Ok((certs, key, cert_chain_pem, private_key_pem))
    }

    async fn validate_authorization(
        &self,
        order: &mut instant_acme::Order,
        challenge_url: &str,
        domain: &str,
    ) -> anyhow::Result<()> {
        order.set_challenge_ready(challenge_url).await?;

        let mut polls = 0;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            order.refresh().await?;

            let auths = order.authorizations().await?;
            let status = auths
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == domain))
                .map(|a| a.status.clone());

            match status {
                Some(AuthorizationStatus::Valid) => {
                    info!(domain = %domain, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Pending) => {
                    polls += 1;
                    if polls > MAX_POLLS {
                        anyhow::bail!("Authorization timeout for {}", domain);
                    }
                    debug!(domain = %domain, attempt = polls, "Waiting for authorization");
                }
                Some(AuthorizationStatus::Invalid) => anyhow::bail!("Authorization failed for {}", domain),
                Some(status) => anyhow::bail!("Authorization for {} ended as {:?}", domain, status),
                None => anyhow::bail!("Authorization not found for {}", domain),
            }
        }
    }

    /// Keep the certificate fresh until shutdown.
    ///
    /// Wakes on the periodic timer or when the resolver reports a missing or
    /// expiring certificate. Issuance failures are logged and retried with backoff.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        if let Err(e) = self.load_cached() {
            warn!(error = %e, "Ignoring unreadable certificate cache");
        }

        let mut backoff = RETRY_BACKOFF_MIN;

        loop {
            let wait = match self.ensure_certificate().await {
                Ok(()) => {
                    backoff = RETRY_BACKOFF_MIN;
                    None
                }
                Err(e) => {
                    error!(hostname = %self.hostname, error = %e, retry_in = ?backoff, "Failed to obtain certificate");
                    let wait = backoff;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                    Some(wait)
                }
            };

            match wait {
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(RECHECK_INTERVAL) => {}
                        _ = self.wake.notified() => {
                            debug!("Certificate check requested by resolver");
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
        }

        info!("ACME manager shutting down");
        Ok(())
    }
}

fn write_private(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        std::io::Write::write_all(&mut file, data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)?;
    }
    Ok(())
}

fn cert_not_after(cert: &CertificateDer<'_>) -> anyhow::Result<i64> {
    use x509_parser::prelude::*;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| anyhow::anyhow!("Failed to parse X.509 certificate: {}", e))?;
    Ok(parsed.validity().not_after.timestamp())
}

fn remaining_days(not_after: i64) -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    (not_after - now).div_euclid(24 * 60 * 60)
}

fn validate_cache_dir(path: &Path) -> anyhow::Result<PathBuf> {
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        anyhow::bail!("Certificate cache path must not contain '..'");
    }

    if path.exists() && !path.is_dir() {
        anyhow::bail!("Certificate cache path '{}' exists but is not a directory", path.display());
    }

    Ok(path.to_path_buf())
}

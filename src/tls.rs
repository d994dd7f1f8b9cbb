//! TLS configuration for the secure listener
//!
//! Builds the rustls server configuration from a certificate source and the
//! configured cipher/curve policy. The minimum protocol version is always TLS 1.2.

use rustls::crypto::ring::cipher_suite;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCert;
use rustls::{NamedGroup, ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// ECDHE AES-GCM suites allowed in strict mode
pub const STRICT_CIPHER_SUITES: [SupportedCipherSuite; 4] = [
    cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
];

/// Curves allowed in strict mode, in preference order
pub const STRICT_CURVES: [NamedGroup; 3] = [
    NamedGroup::secp521r1,
    NamedGroup::secp384r1,
    NamedGroup::secp256r1,
];

const ALL_VERSIONS: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
const TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];

/// Where the secure listener gets its certificate from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertConfig {
    /// PEM certificate chain and private key loaded once at startup
    Static { cert_path: PathBuf, key_path: PathBuf },
    /// Certificate issued and renewed via ACME, cached on disk
    Automatic { hostname: String, cache_dir: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherPolicy {
    Strict,
    #[default]
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CurvePolicy {
    Strict,
    #[default]
    Default,
}

/// Cipher and curve restrictions applied to the secure listener
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsPolicy {
    pub ciphers: CipherPolicy,
    pub curves: CurvePolicy,
}

impl TlsPolicy {
    pub fn new(ciphers: CipherPolicy, curves: CurvePolicy) -> Self {
        Self { ciphers, curves }
    }

    /// Crypto provider with the policy applied to the ring defaults
    pub fn crypto_provider(&self) -> CryptoProvider {
        let mut provider = rustls::crypto::ring::default_provider();

        if self.ciphers == CipherPolicy::Strict {
            provider.cipher_suites = STRICT_CIPHER_SUITES.to_vec();
        }

        if self.curves == CurvePolicy::Strict {
            let available = provider.kx_groups.clone();
            provider.kx_groups = STRICT_CURVES
                .iter()
                .filter_map(|wanted| {
                    let group = available.iter().find(|g| g.name() == *wanted).copied();
                    if group.is_none() {
                        warn!(curve = ?wanted, "Curve not supported by the crypto provider, skipping");
                    }
                    group
                })
                .collect();
        }

        provider
    }

    /// Protocol versions compatible with the cipher policy.
    ///
    /// The strict suites are all TLS 1.2 suites, so strict mode disables TLS 1.3.
    pub fn protocol_versions(&self) -> &'static [&'static SupportedProtocolVersion] {
        match self.ciphers {
            CipherPolicy::Strict => TLS12_ONLY,
            CipherPolicy::Default => ALL_VERSIONS,
        }
    }
}

/// Certificate material handed to the rustls configuration
pub enum CertSource {
    Single {
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    },
    Resolver(Arc<dyn ResolvesServerCert>),
}

/// Build the rustls server configuration for the secure listener
pub fn server_config(policy: &TlsPolicy, source: CertSource) -> anyhow::Result<ServerConfig> {
    let builder = ServerConfig::builder_with_provider(Arc::new(policy.crypto_provider()))
        .with_protocol_versions(policy.protocol_versions())
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?
        .with_no_client_auth();

    let mut config = match source {
        CertSource::Single { certs, key } => builder
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?,
        CertSource::Resolver(resolver) => builder.with_cert_resolver(resolver),
    };

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Load a static certificate/key pair and build an acceptor for it
pub fn static_acceptor(cert_path: &Path, key_path: &Path, policy: &TlsPolicy) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let config = server_config(policy, CertSource::Single { certs, key })?;

    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        ciphers = ?policy.ciphers,
        curves = ?policy.curves,
        "TLS enabled with provided certificates"
    );

    Ok(TlsAcceptor::from(Arc::new(config)))
}

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path.display(), e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }

    Ok(certs)
}

pub fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path.display(), e))?;

    parse_private_key(&data)
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path.display(), e))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path.display()))
}

/// First PKCS#1, PKCS#8 or SEC1 key in a PEM buffer
pub fn parse_private_key(data: &[u8]) -> std::io::Result<Option<PrivateKeyDer<'static>>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(Some(key.into())),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(Some(key.into())),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(Some(key.into())),
            None => return Ok(None),
            _ => continue,
        }
    }
}

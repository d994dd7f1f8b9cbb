use crate::forward::MAX_ATTEMPTS;
use crate::tls::{CertConfig, CipherPolicy, CurvePolicy};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder substituted with the caller's login in the search filter
pub const LOGIN_PLACEHOLDER: &str = "{login}";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and TLS configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend pool and forwarding configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Directory service configuration
    #[serde(default)]
    pub ldap: LdapConfig,

    /// ACME account settings used when `server.auto_cert` is enabled
    #[serde(default)]
    pub acme: AcmeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address of the status listener (health, readiness, version)
    #[serde(default = "default_health_addr")]
    pub health_addr: String,

    /// Address of the plain HTTP listener
    #[serde(default = "default_public_addr")]
    pub public_addr: String,

    /// Address of the TLS listener (only used when TLS is configured)
    #[serde(default = "default_secure_addr")]
    pub secure_addr: String,

    /// Path prefix for the gateway's own routes
    #[serde(default = "default_root")]
    pub root: String,

    /// External URL of the gateway, e.g. `https://gate.example.com`
    #[serde(default = "default_host")]
    pub host: String,

    /// Path to TLS certificate file (PEM format)
    pub cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub key: Option<String>,

    /// Obtain certificates automatically via ACME for the hostname of `host`
    #[serde(default)]
    pub auto_cert: bool,

    /// Restrict key exchange to the NIST P curves
    #[serde(default)]
    pub strict_curves: bool,

    /// Restrict cipher suites to the ECDHE AES-GCM allow-list
    #[serde(default)]
    pub strict_ciphers: bool,

    /// Folder for the certificate cache
    #[serde(default = "default_storage")]
    pub storage: String,

    /// Time allowed for a client to send request headers
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Time allowed to produce a response once the request is read
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Grace window for in-flight connections during shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            health_addr: default_health_addr(),
            public_addr: default_public_addr(),
            secure_addr: default_secure_addr(),
            root: default_root(),
            host: default_host(),
            cert: None,
            key: None,
            auto_cert: false,
            strict_curves: false,
            strict_ciphers: false,
            storage: default_storage(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.auto_cert || self.has_tls_files()
    }

    pub fn has_tls_files(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Hostname part of the external URL
    pub fn public_hostname(&self) -> Option<String> {
        url::Url::parse(&self.host)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
    }

    /// Root prefix without a trailing slash ("" when mounted at "/")
    pub fn root_prefix(&self) -> &str {
        self.root.trim_end_matches('/')
    }

    /// Which certificate source the TLS listener uses, if any
    pub fn cert_config(&self) -> anyhow::Result<Option<CertConfig>> {
        if self.auto_cert {
            let hostname = self.public_hostname().ok_or_else(|| {
                anyhow::anyhow!("auto_cert requires a host URL with a hostname, got '{}'", self.host)
            })?;
            return Ok(Some(CertConfig::Automatic {
                hostname,
                cache_dir: Path::new(&self.storage).join("certs"),
            }));
        }

        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => Ok(Some(CertConfig::Static {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            })),
            (None, None) => Ok(None),
            _ => anyhow::bail!("both cert and key must be set to enable TLS"),
        }
    }

    pub fn cipher_policy(&self) -> CipherPolicy {
        if self.strict_ciphers {
            CipherPolicy::Strict
        } else {
            CipherPolicy::Default
        }
    }

    pub fn curve_policy(&self) -> CurvePolicy {
        if self.strict_curves {
            CurvePolicy::Strict
        } else {
            CurvePolicy::Default
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Title displayed on the login page
    #[serde(default = "default_title")]
    pub title: String,

    /// Backend base URLs, selected round robin
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Identity header that clients must never be able to inject
    #[serde(default = "default_user_header")]
    pub user_header: String,

    /// Per-attempt upstream timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Upstream connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Largest request body buffered for replay on retry
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum idle connections per backend host
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            title: default_title(),
            endpoints: Vec::new(),
            user_header: default_user_header(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_body_bytes: default_max_body_bytes(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LdapConfig {
    /// Directory address, `host:port` or an `ldap://` / `ldaps://` URL
    #[serde(default = "default_ldap_addr")]
    pub addr: String,

    /// DN of the service account used for the search
    #[serde(default)]
    pub bind_username: String,

    /// Password of the service account
    #[serde(default = "default_bind_password")]
    pub bind_password: SecretString,

    /// Base DN searched for users
    #[serde(default)]
    pub base_dn: String,

    /// Search filter, `{login}` is replaced with the submitted username
    #[serde(default = "default_ldap_filter")]
    pub filter: String,

    /// Attribute holding the username
    #[serde(default = "default_user_attr")]
    pub user_attr: String,

    /// Connect timeout in seconds
    #[serde(default = "default_ldap_timeout")]
    pub timeout_secs: u64,
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            addr: default_ldap_addr(),
            bind_username: String::new(),
            bind_password: default_bind_password(),
            base_dn: String::new(),
            filter: default_ldap_filter(),
            user_attr: default_user_attr(),
            timeout_secs: default_ldap_timeout(),
        }
    }
}

impl LdapConfig {
    /// Directory URL as understood by the LDAP client
    pub fn url(&self) -> String {
        if self.addr.contains("://") {
            self.addr.clone()
        } else {
            format!("ldap://{}", self.addr)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// ACME account settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AcmeConfig {
    /// Contact email registered with the CA
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub directory_url: Option<String>,
}

fn default_health_addr() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_public_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_secure_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_root() -> String {
    "/ldap-proxy".to_string()
}

fn default_host() -> String {
    "http://localhost".to_string()
}

fn default_storage() -> String {
    "storage/".to_string()
}

fn default_read_timeout() -> u64 {
    5
}

fn default_write_timeout() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    1000
}

fn default_title() -> String {
    "LDAP Proxy".to_string()
}

fn default_user_header() -> String {
    "X-PROXY-USER".to_string()
}

fn default_request_timeout() -> u64 {
    3
}

fn default_connect_timeout() -> u64 {
    2
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_ldap_addr() -> String {
    "ldap:389".to_string()
}

fn default_bind_password() -> SecretString {
    SecretString::from(String::new())
}

fn default_ldap_filter() -> String {
    "(&(objectClass=person)(sAMAccountName={login}))".to_string()
}

fn default_user_attr() -> String {
    "sAMAccountName".to_string()
}

fn default_ldap_timeout() -> u64 {
    5
}

/// `ip:port`, `host:port`, `[v6]:port` or `:port`; names are resolved at startup
fn has_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let bare_v6 = host.contains(':') && !(host.starts_with('[') && host.ends_with(']'));
            port.parse::<u16>().is_ok() && !bare_v6 && !host.contains(char::is_whitespace)
        }
        None => false,
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, addr) in [
            ("health_addr", &self.server.health_addr),
            ("public_addr", &self.server.public_addr),
            ("secure_addr", &self.server.secure_addr),
        ] {
            if !has_port(addr) {
                errors.push(format!("server.{} '{}' must be host:port or :port", name, addr));
            }
        }

        if !self.server.root.starts_with('/') {
            errors.push(format!("server.root '{}' must start with '/'", self.server.root));
        }

        if let Err(e) = self.server.cert_config() {
            errors.push(e.to_string());
        }

        if self.server.read_timeout_secs == 0 || self.server.write_timeout_secs == 0 {
            errors.push("server read/write timeouts must be greater than zero".to_string());
        }

        // Every attempt has to fit inside the per-request write deadline
        let attempts_budget = self.proxy.request_timeout_secs.saturating_mul(MAX_ATTEMPTS as u64);
        if self.proxy.request_timeout_secs == 0 {
            errors.push("proxy.request_timeout_secs must be greater than zero".to_string());
        } else if attempts_budget > self.server.write_timeout_secs {
            errors.push(format!(
                "proxy.request_timeout_secs ({}) x {} attempts exceeds server.write_timeout_secs ({})",
                self.proxy.request_timeout_secs, MAX_ATTEMPTS, self.server.write_timeout_secs
            ));
        }

        if !self.ldap.filter.contains(LOGIN_PLACEHOLDER) {
            errors.push(format!(
                "ldap.filter '{}' must contain the {} placeholder",
                self.ldap.filter, LOGIN_PLACEHOLDER
            ));
        }

        if self.ldap.user_attr.is_empty() {
            errors.push("ldap.user_attr must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
health_addr = "127.0.0.1:9100"
public_addr = "0.0.0.0:8080"
root = "/auth"
host = "https://gate.example.com"

[proxy]
title = "Intranet"
endpoints = ["http://10.0.0.1:8080", "http://10.0.0.2:8080"]

[ldap]
addr = "ldaps://dc.example.com:636"
bind_username = "cn=svc,dc=example,dc=com"
bind_password = "hunter2"
base_dn = "dc=example,dc=com"
filter = "(uid={login})"
user_attr = "uid"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.health_addr, "127.0.0.1:9100");
        assert_eq!(config.server.root_prefix(), "/auth");
        assert_eq!(config.proxy.title, "Intranet");
        assert_eq!(config.proxy.endpoints.len(), 2);
        assert_eq!(config.ldap.url(), "ldaps://dc.example.com:636");
        assert_eq!(config.ldap.bind_password.expose_secret(), "hunter2");
        assert_eq!(config.ldap.user_attr, "uid");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.health_addr, "127.0.0.1:9000");
        assert_eq!(config.server.public_addr, "0.0.0.0:80");
        assert_eq!(config.server.secure_addr, "0.0.0.0:443");
        assert_eq!(config.server.root, "/ldap-proxy");
        assert_eq!(config.server.read_timeout(), Duration::from_secs(5));
        assert_eq!(config.server.write_timeout(), Duration::from_secs(10));
        assert_eq!(config.server.shutdown_grace(), Duration::from_secs(1));
        assert_eq!(config.proxy.user_header, "X-PROXY-USER");
        assert!(config.proxy.endpoints.is_empty());
        assert_eq!(
            config.ldap.filter,
            "(&(objectClass=person)(sAMAccountName={login}))"
        );
        assert_eq!(config.ldap.url(), "ldap://ldap:389");
        assert!(!config.server.tls_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bind_password_is_redacted_in_debug() {
        let config: Config = toml::from_str(
            r#"
[ldap]
bind_password = "topsecret"
"#,
        )
        .unwrap();

        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("topsecret"));
    }

    #[test]
    fn test_static_cert_config() {
        let config: Config = toml::from_str(
            r#"
[server]
cert = "/etc/ssl/gate.pem"
key = "/etc/ssl/gate.key"
"#,
        )
        .unwrap();

        assert!(config.server.tls_enabled());
        match config.server.cert_config().unwrap() {
            Some(CertConfig::Static { cert_path, key_path }) => {
                assert_eq!(cert_path, PathBuf::from("/etc/ssl/gate.pem"));
                assert_eq!(key_path, PathBuf::from("/etc/ssl/gate.key"));
            }
            other => panic!("unexpected cert config: {:?}", other),
        }
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let config: Config = toml::from_str(
            r#"
[server]
cert = "/etc/ssl/gate.pem"
"#,
        )
        .unwrap();

        assert!(!config.server.tls_enabled());
        assert!(config.server.cert_config().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auto_cert_uses_host_and_storage() {
        let config: Config = toml::from_str(
            r#"
[server]
auto_cert = true
host = "https://Gate.Example.com"
storage = "/var/lib/ldapgate"
"#,
        )
        .unwrap();

        match config.server.cert_config().unwrap() {
            Some(CertConfig::Automatic { hostname, cache_dir }) => {
                assert_eq!(hostname, "gate.example.com");
                assert_eq!(cache_dir, PathBuf::from("/var/lib/ldapgate/certs"));
            }
            other => panic!("unexpected cert config: {:?}", other),
        }
    }

    #[test]
    fn test_auto_cert_requires_hostname() {
        let config: Config = toml::from_str(
            r#"
[server]
auto_cert = true
host = "not a url"
"#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policies_follow_flags() {
        let mut server = ServerConfig::default();
        assert_eq!(server.cipher_policy(), CipherPolicy::Default);
        assert_eq!(server.curve_policy(), CurvePolicy::Default);

        server.strict_ciphers = true;
        server.strict_curves = true;
        assert_eq!(server.cipher_policy(), CipherPolicy::Strict);
        assert_eq!(server.curve_policy(), CurvePolicy::Strict);
    }

    #[test]
    fn test_filter_without_placeholder_is_rejected() {
        let config: Config = toml::from_str(
            r#"
[ldap]
filter = "(objectClass=person)"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("{login}"));
    }

    #[test]
    fn test_invalid_listener_address_is_rejected() {
        let config: Config = toml::from_str(
            r#"
[server]
health_addr = "localhost"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("health_addr"));
    }

    #[test]
    fn test_retry_budget_must_fit_write_deadline() {
        let config = Config::default();
        assert!(
            config.proxy.request_timeout_secs * MAX_ATTEMPTS as u64 <= config.server.write_timeout_secs
        );

        let config: Config = toml::from_str(
            r#"
[server]
write_timeout_secs = 10

[proxy]
request_timeout_secs = 4
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("request_timeout_secs"));

        let config: Config = toml::from_str(
            r#"
[server]
write_timeout_secs = 60

[proxy]
request_timeout_secs = 20
"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_listener_address_forms() {
        let config: Config = toml::from_str(
            r#"
[server]
health_addr = "localhost:9000"
public_addr = ":80"
secure_addr = "[::]:443"
"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());

        assert!(has_port("0.0.0.0:8080"));
        assert!(!has_port("localhost"));
        assert!(!has_port("::1"));
        assert!(!has_port("gate:http"));
    }

    #[test]
    fn test_root_prefix_trims_trailing_slash() {
        let mut server = ServerConfig::default();
        server.root = "/".to_string();
        assert_eq!(server.root_prefix(), "");

        server.root = "/gate/".to_string();
        assert_eq!(server.root_prefix(), "/gate");
    }
}

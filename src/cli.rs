//! Command line flags and their environment variables

use crate::config::Config;
use clap::builder::BoolishValueParser;
use clap::Parser;
use secrecy::SecretString;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "ldapgate")]
#[command(version = crate::router::VERSION)]
#[command(about = "Authenticating reverse proxy guarding HTTP backends behind an LDAP login", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "LDAP_PROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, env = "LDAP_PROXY_DEBUG", value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true")]
    pub debug: Option<bool>,

    /// Address of the status listener
    #[arg(long, env = "LDAP_PROXY_HEALTH_ADDR")]
    pub health_addr: Option<String>,

    /// Address of the TLS listener
    #[arg(long, env = "LDAP_PROXY_SERVER_HTTPS")]
    pub secure_addr: Option<String>,

    /// Address of the plain HTTP listener
    #[arg(long, env = "LDAP_PROXY_SERVER_ADDR")]
    pub server_addr: Option<String>,

    /// Path prefix for the login routes
    #[arg(long, env = "LDAP_PROXY_SERVER_ROOT")]
    pub server_root: Option<String>,

    /// External URL of the gateway
    #[arg(long, env = "LDAP_PROXY_SERVER_HOST")]
    pub server_host: Option<String>,

    /// Path to the TLS certificate (PEM)
    #[arg(long, env = "LDAP_PROXY_SERVER_CERT")]
    pub server_cert: Option<String>,

    /// Path to the TLS private key (PEM)
    #[arg(long, env = "LDAP_PROXY_SERVER_KEY")]
    pub server_key: Option<String>,

    /// Obtain certificates automatically via ACME
    #[arg(long = "server-autocert", env = "LDAP_PROXY_AUTO_CERT", value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true")]
    pub auto_cert: Option<bool>,

    /// Restrict key exchange to the NIST P curves
    #[arg(long, env = "LDAP_PROXY_STRICT_CURVES", value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true")]
    pub strict_curves: Option<bool>,

    /// Restrict cipher suites to ECDHE with AES-GCM
    #[arg(long, env = "LDAP_PROXY_STRICT_CIPHERS", value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true")]
    pub strict_ciphers: Option<bool>,

    /// Folder for the certificate cache
    #[arg(long = "storage-path", env = "LDAP_PROXY_SERVER_STORAGE")]
    pub storage: Option<String>,

    /// Title displayed on the login page
    #[arg(long = "proxy-title", env = "LDAP_PROXY_SERVER_TITLE")]
    pub title: Option<String>,

    /// Backend URL, repeat or separate with commas
    #[arg(long = "proxy-endpoint", env = "LDAP_PROXY_SERVER_ENDPOINTS", value_delimiter = ',')]
    pub endpoints: Vec<String>,

    /// Identity header stripped from client requests
    #[arg(long, env = "LDAP_PROXY_USER_HEADER")]
    pub user_header: Option<String>,

    /// Directory address
    #[arg(long, env = "LDAP_PROXY_SERVER_ADDRESS")]
    pub ldap_address: Option<String>,

    /// Service account DN
    #[arg(long, env = "LDAP_PROXY_USERNAME")]
    pub ldap_username: Option<String>,

    /// Service account password
    #[arg(long, env = "LDAP_PROXY_PASSWORD", hide_env_values = true)]
    pub ldap_password: Option<String>,

    /// Base DN searched for users
    #[arg(long, env = "LDAP_PROXY_BASE")]
    pub ldap_base: Option<String>,

    /// Search filter containing {login}
    #[arg(long, env = "LDAP_PROXY_FILTER")]
    pub ldap_filter: Option<String>,

    /// Attribute holding the username
    #[arg(long = "ldap-userattr", env = "LDAP_PROXY_USER_ATTR")]
    pub ldap_user_attr: Option<String>,
}

impl Cli {
    pub fn debug_enabled(&self) -> bool {
        self.debug.unwrap_or(false)
    }

    /// Overlay every flag that was given on top of the file configuration
    pub fn apply(self, config: &mut Config) {
        let server = &mut config.server;
        set(&mut server.health_addr, self.health_addr);
        set(&mut server.secure_addr, self.secure_addr);
        set(&mut server.public_addr, self.server_addr);
        set(&mut server.root, self.server_root);
        set(&mut server.host, self.server_host);
        set(&mut server.storage, self.storage);
        set(&mut server.auto_cert, self.auto_cert);
        set(&mut server.strict_curves, self.strict_curves);
        set(&mut server.strict_ciphers, self.strict_ciphers);
        if self.server_cert.is_some() {
            server.cert = self.server_cert;
        }
        if self.server_key.is_some() {
            server.key = self.server_key;
        }

        let proxy = &mut config.proxy;
        set(&mut proxy.title, self.title);
        set(&mut proxy.user_header, self.user_header);
        let endpoints: Vec<String> = self
            .endpoints
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if !endpoints.is_empty() {
            proxy.endpoints = endpoints;
        }

        let ldap = &mut config.ldap;
        set(&mut ldap.addr, self.ldap_address);
        set(&mut ldap.bind_username, self.ldap_username);
        set(&mut ldap.bind_password, self.ldap_password.map(SecretString::from));
        set(&mut ldap.base_dn, self.ldap_base);
        set(&mut ldap.filter, self.ldap_filter);
        set(&mut ldap.user_attr, self.ldap_user_attr);
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["ldapgate"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_override_file_values() {
        let mut config: Config = toml::from_str(
            r#"
[server]
public_addr = "0.0.0.0:8080"
root = "/auth"

[proxy]
endpoints = ["http://10.0.0.1:8080"]
"#,
        )
        .unwrap();

        parse(&[
            "--server-addr",
            "127.0.0.1:8081",
            "--proxy-endpoint",
            "http://a:1, http://b:2",
            "--ldap-password",
            "s3cret",
            "--ldap-userattr",
            "uid",
            "--strict-ciphers",
        ])
        .apply(&mut config);

        assert_eq!(config.server.public_addr, "127.0.0.1:8081");
        assert_eq!(config.server.root, "/auth");
        assert_eq!(config.proxy.endpoints, vec!["http://a:1", "http://b:2"]);
        assert_eq!(config.ldap.bind_password.expose_secret(), "s3cret");
        assert_eq!(config.ldap.user_attr, "uid");
        assert!(config.server.strict_ciphers);
        assert!(!config.server.strict_curves);
    }

    #[test]
    fn test_no_flags_keep_file_values() {
        let mut config = Config::default();
        config.proxy.endpoints = vec!["http://10.0.0.1".to_string()];
        config.server.auto_cert = true;

        let cli = Cli {
            config: None,
            debug: None,
            health_addr: None,
            secure_addr: None,
            server_addr: None,
            server_root: None,
            server_host: None,
            server_cert: None,
            server_key: None,
            auto_cert: None,
            strict_curves: None,
            strict_ciphers: None,
            storage: None,
            title: None,
            endpoints: Vec::new(),
            user_header: None,
            ldap_address: None,
            ldap_username: None,
            ldap_password: None,
            ldap_base: None,
            ldap_filter: None,
            ldap_user_attr: None,
        };
        cli.apply(&mut config);

        assert_eq!(config.proxy.endpoints, vec!["http://10.0.0.1"]);
        assert!(config.server.auto_cert);
        assert_eq!(config.server.root, "/ldap-proxy");
    }

    #[test]
    fn test_boolean_flags_accept_explicit_values() {
        let cli = parse(&["--debug", "--server-autocert=false"]);
        assert!(cli.debug_enabled());
        assert_eq!(cli.auto_cert, Some(false));
    }
}

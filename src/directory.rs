//! LDAP authentication
//!
//! A login is verified in three steps on one fresh connection:
//!
//! 1. bind as the service account
//! 2. search the base DN for exactly one entry matching the filter
//! 3. rebind as that entry's DN with the submitted password
//!
//! The connection is closed on every exit path. There are no retries.

use crate::config::{LdapConfig, LOGIN_PLACEHOLDER};
use async_trait::async_trait;
use ldap3::{DerefAliases, Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry, SearchOptions};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Message shown to the user for every failed login
pub const LOGIN_FAILED_MESSAGE: &str = "Invalid username or password";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to connect to directory: {0}")]
    ConnectionError(String),

    #[error("service account bind failed: {0}")]
    BindError(String),

    #[error("user search failed: {0}")]
    SearchError(String),

    #[error("no entry matches the login")]
    NoSuchUser,

    #[error("{0} entries match the login")]
    AmbiguousUser(usize),

    #[error("invalid credentials")]
    InvalidCredentials,
}

impl DirectoryError {
    /// What the client is told. Identical for every variant.
    pub fn user_message(&self) -> &'static str {
        LOGIN_FAILED_MESSAGE
    }
}

/// An authenticated directory user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPrincipal {
    pub dn: String,
    pub username: String,
}

/// One search result
#[derive(Debug, Clone, Default)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attrs: HashMap<String, Vec<String>>,
}

/// An open directory connection
#[async_trait]
pub trait DirectorySession: Send {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<(), String>;

    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>, String>;

    async fn close(&mut self);
}

/// Opens directory connections
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DirectorySession>, String>;
}

/// Directory connector backed by `ldap3`
pub struct LdapConnector {
    url: String,
    timeout: Duration,
}

impl LdapConnector {
    pub fn new(config: &LdapConfig) -> Self {
        Self {
            url: config.url(),
            timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl DirectoryConnector for LdapConnector {
    async fn connect(&self) -> Result<Box<dyn DirectorySession>, String> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);

        debug!(url = %self.url, "Connecting to LDAP server");
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &self.url)
            .await
            .map_err(|e| e.to_string())?;

        ldap3::drive!(conn);

        Ok(Box::new(LdapSession {
            ldap,
            timeout: self.timeout,
        }))
    }
}

struct LdapSession {
    ldap: Ldap,
    timeout: Duration,
}

#[async_trait]
impl DirectorySession for LdapSession {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<(), String> {
        self.ldap
            .with_timeout(self.timeout)
            .simple_bind(dn, password)
            .await
            .map_err(|e| e.to_string())?
            .success()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>, String> {
        let (entries, _res) = self
            .ldap
            .with_timeout(self.timeout)
            .with_search_options(SearchOptions::new().deref(DerefAliases::Never))
            .search(base, Scope::Subtree, filter, attrs.to_vec())
            .await
            .map_err(|e| e.to_string())?
            .success()
            .map_err(|e| e.to_string())?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let entry = SearchEntry::construct(entry);
                DirectoryEntry {
                    dn: entry.dn,
                    attrs: entry.attrs,
                }
            })
            .collect())
    }

    async fn close(&mut self) {
        if let Err(e) = self.ldap.unbind().await {
            debug!(error = %e, "LDAP unbind failed");
        }
    }
}

/// Substitute every `{login}` in the filter template
pub fn build_filter(template: &str, login: &str) -> String {
    template.replace(LOGIN_PLACEHOLDER, login)
}

/// Verifies logins against the directory
pub struct DirectoryAuthenticator {
    connector: Arc<dyn DirectoryConnector>,
    bind_dn: String,
    bind_password: SecretString,
    base_dn: String,
    filter: String,
    user_attr: String,
}

impl DirectoryAuthenticator {
    pub fn new(connector: Arc<dyn DirectoryConnector>, config: &LdapConfig) -> Self {
        Self {
            connector,
            bind_dn: config.bind_username.clone(),
            bind_password: config.bind_password.clone(),
            base_dn: config.base_dn.clone(),
            filter: config.filter.clone(),
            user_attr: config.user_attr.clone(),
        }
    }

    pub async fn authenticate(
        &self,
        login: &str,
        password: &SecretString,
    ) -> Result<UserPrincipal, DirectoryError> {
        // An empty password would turn the rebind into an anonymous bind
        if password.expose_secret().is_empty() {
            debug!(login = %login, "Rejecting empty password");
            return Err(DirectoryError::InvalidCredentials);
        }

        let mut session = self.connector.connect().await.map_err(|e| {
            warn!(error = %e, "Directory connection failed");
            DirectoryError::ConnectionError(e)
        })?;

        let result = self.verify(session.as_mut(), login, password).await;
        session.close().await;

        match &result {
            Ok(principal) => info!(login = %login, dn = %principal.dn, "User authenticated"),
            Err(e) => info!(login = %login, reason = %e, "Authentication rejected"),
        }
        result
    }

    async fn verify(
        &self,
        session: &mut dyn DirectorySession,
        login: &str,
        password: &SecretString,
    ) -> Result<UserPrincipal, DirectoryError> {
        session
            .bind(&self.bind_dn, self.bind_password.expose_secret())
            .await
            .map_err(DirectoryError::BindError)?;

        let filter = build_filter(&self.filter, login);
        debug!(base = %self.base_dn, filter = %filter, "Searching for user");

        let mut entries = session
            .search(&self.base_dn, &filter, &[self.user_attr.as_str()])
            .await
            .map_err(DirectoryError::SearchError)?;

        let entry = match entries.len() {
            0 => return Err(DirectoryError::NoSuchUser),
            1 => entries.remove(0),
            n => return Err(DirectoryError::AmbiguousUser(n)),
        };

        session
            .bind(&entry.dn, password.expose_secret())
            .await
            .map_err(|e| {
                debug!(dn = %entry.dn, error = %e, "User bind failed");
                DirectoryError::InvalidCredentials
            })?;

        let username = entry
            .attrs
            .get(&self.user_attr)
            .and_then(|values| values.first())
            .cloned()
            .unwrap_or_else(|| login.to_string());

        Ok(UserPrincipal {
            dn: entry.dn,
            username,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory directory recording every operation
    #[derive(Clone, Default)]
    pub(crate) struct FakeDirectory {
        pub entries: Vec<DirectoryEntry>,
        pub passwords: HashMap<String, String>,
        pub fail_connect: bool,
        pub fail_search: bool,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeDirectory {
        pub fn new() -> Self {
            let mut passwords = HashMap::new();
            passwords.insert("cn=svc,dc=example,dc=com".to_string(), "svc-secret".to_string());
            Self {
                passwords,
                ..Default::default()
            }
        }

        pub fn with_user(mut self, login: &str, password: &str) -> Self {
            let dn = format!("uid={},ou=people,dc=example,dc=com", login);
            let mut attrs = HashMap::new();
            attrs.insert("uid".to_string(), vec![login.to_string()]);
            self.entries.push(DirectoryEntry { dn: dn.clone(), attrs });
            self.passwords.insert(dn, password.to_string());
            self
        }

        pub fn events(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    struct FakeSession {
        dir: FakeDirectory,
    }

    #[async_trait]
    impl DirectorySession for FakeSession {
        async fn bind(&mut self, dn: &str, password: &str) -> Result<(), String> {
            self.dir.log.lock().push(format!("bind {}", dn));
            match self.dir.passwords.get(dn) {
                Some(expected) if expected == password => Ok(()),
                _ => Err("invalidCredentials (49)".to_string()),
            }
        }

        async fn search(
            &mut self,
            _base: &str,
            filter: &str,
            _attrs: &[&str],
        ) -> Result<Vec<DirectoryEntry>, String> {
            self.dir.log.lock().push(format!("search {}", filter));
            if self.dir.fail_search {
                return Err("operationsError (1)".to_string());
            }
            // Match on `uid=<login>` inside the filter
            Ok(self
                .dir
                .entries
                .iter()
                .filter(|e| {
                    e.attrs
                        .get("uid")
                        .and_then(|v| v.first())
                        .map(|uid| filter.contains(&format!("(uid={})", uid)))
                        .unwrap_or(false)
                })
                .cloned()
                .collect())
        }

        async fn close(&mut self) {
            self.dir.log.lock().push("close".to_string());
        }
    }

    #[async_trait]
    impl DirectoryConnector for FakeDirectory {
        async fn connect(&self) -> Result<Box<dyn DirectorySession>, String> {
            self.log.lock().push("connect".to_string());
            if self.fail_connect {
                return Err("connection refused".to_string());
            }
            Ok(Box::new(FakeSession { dir: self.clone() }))
        }
    }

    pub(crate) fn test_config() -> LdapConfig {
        LdapConfig {
            bind_username: "cn=svc,dc=example,dc=com".to_string(),
            bind_password: SecretString::from("svc-secret"),
            base_dn: "dc=example,dc=com".to_string(),
            filter: "(&(objectClass=person)(uid={login}))".to_string(),
            user_attr: "uid".to_string(),
            ..Default::default()
        }
    }

    fn authenticator(dir: &FakeDirectory) -> DirectoryAuthenticator {
        DirectoryAuthenticator::new(Arc::new(dir.clone()), &test_config())
    }

    fn secret(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn test_build_filter_replaces_every_placeholder() {
        assert_eq!(
            build_filter("(|(uid={login})(mail={login}@example.com))", "alice"),
            "(|(uid=alice)(mail=alice@example.com))"
        );
        assert_eq!(build_filter("(objectClass=person)", "alice"), "(objectClass=person)");
    }

    #[tokio::test]
    async fn test_successful_login() {
        let dir = FakeDirectory::new().with_user("alice", "wonderland");
        let principal = authenticator(&dir)
            .authenticate("alice", &secret("wonderland"))
            .await
            .unwrap();

        assert_eq!(principal.dn, "uid=alice,ou=people,dc=example,dc=com");
        assert_eq!(principal.username, "alice");
        assert_eq!(
            dir.events(),
            vec![
                "connect",
                "bind cn=svc,dc=example,dc=com",
                "search (&(objectClass=person)(uid=alice))",
                "bind uid=alice,ou=people,dc=example,dc=com",
                "close",
            ]
        );
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let dir = FakeDirectory::new().with_user("alice", "wonderland");
        let err = authenticator(&dir)
            .authenticate("alice", &secret("looking-glass"))
            .await
            .unwrap_err();

        assert!(matches!(err, DirectoryError::InvalidCredentials));
        assert_eq!(dir.events().last().unwrap(), "close");
    }

    #[tokio::test]
    async fn test_unknown_user_rejected_without_rebind() {
        let dir = FakeDirectory::new().with_user("alice", "wonderland");
        let err = authenticator(&dir)
            .authenticate("bob", &secret("builder"))
            .await
            .unwrap_err();

        assert!(matches!(err, DirectoryError::NoSuchUser));
        let binds = dir.events().iter().filter(|e| e.starts_with("bind")).count();
        assert_eq!(binds, 1);
        assert_eq!(dir.events().last().unwrap(), "close");
    }

    #[tokio::test]
    async fn test_ambiguous_user_rejected_without_rebind() {
        let dir = FakeDirectory::new()
            .with_user("alice", "wonderland")
            .with_user("alice", "wonderland");
        let err = authenticator(&dir)
            .authenticate("alice", &secret("wonderland"))
            .await
            .unwrap_err();

        assert!(matches!(err, DirectoryError::AmbiguousUser(2)));
        let binds = dir.events().iter().filter(|e| e.starts_with("bind")).count();
        assert_eq!(binds, 1);
    }

    #[tokio::test]
    async fn test_service_bind_rejected() {
        let mut dir = FakeDirectory::new().with_user("alice", "wonderland");
        dir.passwords
            .insert("cn=svc,dc=example,dc=com".to_string(), "rotated".to_string());

        let err = authenticator(&dir)
            .authenticate("alice", &secret("wonderland"))
            .await
            .unwrap_err();

        assert!(matches!(err, DirectoryError::BindError(_)));
        assert!(!dir.events().iter().any(|e| e.starts_with("search")));
        assert_eq!(dir.events().last().unwrap(), "close");
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let mut dir = FakeDirectory::new();
        dir.fail_connect = true;

        let err = authenticator(&dir)
            .authenticate("alice", &secret("wonderland"))
            .await
            .unwrap_err();

        assert!(matches!(err, DirectoryError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn test_search_failure() {
        let mut dir = FakeDirectory::new().with_user("alice", "wonderland");
        dir.fail_search = true;

        let err = authenticator(&dir)
            .authenticate("alice", &secret("wonderland"))
            .await
            .unwrap_err();

        assert!(matches!(err, DirectoryError::SearchError(_)));
        assert_eq!(dir.events().last().unwrap(), "close");
    }

    #[tokio::test]
    async fn test_empty_password_never_reaches_directory() {
        let dir = FakeDirectory::new().with_user("alice", "");
        let err = authenticator(&dir)
            .authenticate("alice", &secret(""))
            .await
            .unwrap_err();

        assert!(matches!(err, DirectoryError::InvalidCredentials));
        assert!(dir.events().is_empty());
    }

    #[tokio::test]
    async fn test_username_falls_back_to_login() {
        let mut dir = FakeDirectory::new().with_user("alice", "wonderland");
        dir.entries[0].attrs.insert("uid".to_string(), vec!["alice".to_string()]);
        let config = LdapConfig {
            user_attr: "sAMAccountName".to_string(),
            ..test_config()
        };
        let auth = DirectoryAuthenticator::new(Arc::new(dir.clone()), &config);

        let principal = auth.authenticate("alice", &secret("wonderland")).await.unwrap();
        assert_eq!(principal.username, "alice");
    }

    #[test]
    fn test_every_failure_has_the_same_user_message() {
        let errors = [
            DirectoryError::ConnectionError("refused".into()),
            DirectoryError::BindError("49".into()),
            DirectoryError::SearchError("1".into()),
            DirectoryError::NoSuchUser,
            DirectoryError::AmbiguousUser(3),
            DirectoryError::InvalidCredentials,
        ];
        assert!(errors.iter().all(|e| e.user_message() == LOGIN_FAILED_MESSAGE));
        assert_ne!(
            DirectoryError::NoSuchUser.to_string(),
            DirectoryError::AmbiguousUser(2).to_string()
        );
    }
}

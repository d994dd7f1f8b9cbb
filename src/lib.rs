//! Ldapgate - An authenticating reverse proxy guarded by an LDAP login
//!
//! This library provides a gateway that:
//! - Serves a login form and verifies credentials with a bind, search and rebind
//!   against an LDAP directory
//! - Forwards all other traffic to a round robin pool of HTTP backends, retrying
//!   network failures up to three attempts
//! - Runs its listeners under a supervisor where the first exit stops everyone,
//!   with a bounded graceful drain
//! - Terminates TLS with static certificates or certificates obtained via ACME

pub mod acme;
pub mod assets;
pub mod balancer;
pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod forward;
pub mod listener;
pub mod router;
pub mod server;
pub mod supervisor;
pub mod tls;

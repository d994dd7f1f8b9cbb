use clap::Parser;
use ldapgate::cli::Cli;
use ldapgate::config::Config;
use ldapgate::router::{PKG_NAME, VERSION};
use ldapgate::server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Optional dotenv file, loaded before flags read the environment
    if let Ok(path) = std::env::var("LDAP_PROXY_ENV_FILE") {
        if let Err(e) = dotenvy::from_path(&path) {
            eprintln!("Failed to load env file {}: {}", path, e);
            return ExitCode::FAILURE;
        }
    }

    let cli = Cli::parse();

    let directive = if cli.debug_enabled() {
        "ldapgate=debug"
    } else {
        "ldapgate=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    info!(name = PKG_NAME, version = VERSION, "Starting");

    match run(cli).await {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "Exiting with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::load(path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => Config::default(),
    };

    cli.apply(&mut config);
    config.validate()?;

    server::run(config).await
}

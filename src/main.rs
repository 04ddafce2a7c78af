//! buildsmith - Build service for the Vessel core and its plugins
//!
//! Service entry point: validates flags, selects the log sink, loads the
//! signing key, and serves the request surface.

use buildsmith::config::{self, Cli, Settings};
use buildsmith::server::{self, AppState};
use buildsmith::sign::Signer;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let settings = Arc::new(Settings::from_cli(&cli)?);

    // set up the log sink before anything bad happens
    init_logging(&settings.log_sink)?;

    let sandbox = &settings.sandbox;
    if sandbox.uid_gid.is_none() && sandbox.chroot.is_none() {
        warn!("running as same user and without jail!");
    }
    if sandbox.uid_gid.is_some() != sandbox.chroot.is_some() {
        warn!("either --uid or --chroot is set, but not both; inconsistent use!");
    }
    if settings.credentials.is_none() {
        warn!(
            "no authentication credentials; set {} and {}",
            config::env::CLIENT_ID,
            config::env::CLIENT_KEY
        );
    }

    let (key_file, password_file) = config::signing_key_paths();
    let signer = Signer::load(&key_file, &password_file)?;

    let state = Arc::new(AppState {
        settings: settings.clone(),
        signer,
    });

    let listener = tokio::net::TcpListener::bind(&settings.addr).await?;
    println!("buildsmith serving on {}", settings.addr);
    axum::serve(listener, server::router(state)).await?;
    Ok(())
}

/// Route process logs to a file, stdout, stderr, or nowhere
fn init_logging(sink: &str) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("buildsmith=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match sink {
        "stdout" => builder.with_writer(std::io::stdout).init(),
        "stderr" => builder.with_writer(std::io::stderr).init(),
        "" => builder.with_writer(std::io::sink).init(),
        path => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder.with_writer(Arc::new(file)).init();
        }
    }
    Ok(())
}

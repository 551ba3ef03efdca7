//! SSH honeypot - a low-interaction SSH server with a scripted fake shell
//!
//! Every connection is accepted, every password works, and whatever the
//! client types is answered by a handful of canned responses:
//! - Per-session transcripts of credentials and commands
//! - New-connection alerts with the peer's IP and MAC
//! - Bounded handshake windows so idle clients are dropped

mod alert;
mod cli;
mod commands;
mod config;
mod error;
mod events;
mod handlers;
mod keys;
mod mac;
mod session;
mod transcript;

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::alert::AlertNotifier;
use crate::session::{SessionContext, SessionLimits};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Try 'ssh-honeypot --help' for more information.");
            std::process::exit(2);
        }
    };
    if args.help {
        cli::print_help();
        return Ok(());
    }
    if args.version {
        cli::print_version();
        return Ok(());
    }

    init_logging();
    info!("Starting SSH honeypot...");

    let config = config::Config::load(&args)?;
    info!("Configuration loaded");

    let host_key = keys::load_or_create(&config.server.host_key)?;
    let (transcript, _writer) = transcript::Transcript::open(&config.transcript.path).await?;
    info!("Transcript at {}", config.transcript.path.display());

    // Create event bus for broadcasting new connections
    let (event_tx, _) = tokio::sync::broadcast::channel(1000);
    let event_bus = events::EventBus::new(event_tx);

    let transport = alert::transport_for(&config.alert.recipient, &config.alert.credentials_file);
    AlertNotifier::new(transport, config.alert.recipient.as_str()).spawn(event_bus.subscribe());

    let listener = match handlers::bind(&config.server).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{:#}", e);
            return Err(e);
        }
    };

    let ctx = Arc::new(SessionContext {
        ssh: Arc::new(handlers::ssh::ssh_config(&config.server, host_key)),
        transcript,
        events: event_bus,
        limits: SessionLimits::from(&config.session),
    });

    tokio::select! {
        result = handlers::serve(listener, ctx, config.server.max_sessions) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

/// Use LOG_FORMAT=gcp for structured GCP Cloud Logging
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ssh_honeypot=info"));

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

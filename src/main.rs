//! Villip - Entry Point
//!
//! Loads the rules, starts one listener per configured port plus the optional
//! liveness server, and stops on a signal or on the first fatal error.

use anyhow::{bail, Context};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use villip::api::HealthServer;
use villip::config::LogConfig;
use villip::proxy::{build_dispatchers, create_listeners};
use villip::rule::loader::load_rules;
use villip::{Config, VillipError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to read configuration")?;
    init_tracing(&config.log);

    info!("Starting Villip");

    if !config.has_rule_source() {
        bail!("No rule configured: set VILLIP_URL or VILLIP_FOLDER");
    }

    let rules = load_rules(config.rules.from_env, config.rules.folder.as_deref())
        .map_err(|e| startup_error(e, "Failed to build rules"))?;
    if rules.is_empty() {
        bail!("No rule could be built from the configured sources");
    }
    info!("Loaded {} rules", rules.len());

    let dispatchers =
        build_dispatchers(rules).map_err(|e| startup_error(e, "Failed to assign rules to ports"))?;

    // Create fatal error and shutdown channels
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = watch::channel(false);

    let listeners = create_listeners(&config.host, dispatchers, fatal_tx.clone())
        .context("Failed to create listeners")?;

    let mut tasks = Vec::with_capacity(listeners.len() + 1);
    for listener in listeners {
        let shutdown = shutdown_tx.subscribe();
        let fatal = fatal_tx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.run(shutdown).await {
                error!(port = listener.port(), "Listener error: {}", e);
                let _ = fatal.send(e);
            }
        }));
    }

    if let Some(addr) = config.health_addr() {
        let health_server = HealthServer::new(addr);
        let shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = health_server.run(shutdown).await {
                warn!("Health server error: {}", e);
            }
        }));
    }
    drop(fatal_tx);

    info!(host = %config.host, "Servers started");

    let fatal = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            None
        }
        Some(e) = fatal_rx.recv() => Some(e),
    };

    // Send shutdown signal to all listeners
    let _ = shutdown_tx.send(true);
    futures::future::join_all(tasks).await;

    if let Some(e) = fatal {
        return Err(anyhow::Error::new(e).context("Villip stopped on a fatal error"));
    }

    info!("Villip stopped");
    Ok(())
}

/// Report rule errors as configuration mistakes, anything else with context
fn startup_error(e: VillipError, context: &'static str) -> anyhow::Error {
    if e.is_config_error() {
        error!("Invalid rule configuration: {}", e);
        anyhow::anyhow!("Invalid rule configuration: {}", e)
    } else {
        anyhow::Error::new(e).context(context)
    }
}

/// Install the tracing subscriber, JSON or human readable
fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log.directive().into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.is_json() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bc_broker::api;
use bc_broker::cli::{self, Cli, Command, ConfigCommand};
use bc_broker::coordinator::Coordinator;
use bc_broker::state::AppState;
use bc_domain::config::{Config, ConfigSeverity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = cli::load_config(cli.config.as_deref())?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config(cli.config.as_deref())?;
            if !cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = cli::load_config(cli.config.as_deref())?;
            cli::config::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("beamcode {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the serve path.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bc_broker=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("BeamCode broker starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Wiring ───────────────────────────────────────────────────────
    let coordinator = Coordinator::new(config.clone())?;
    let state = AppState::new(coordinator.clone());

    let listener = tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| format!("binding {}:{}", config.server.host, config.server.port))?;
    let addr = listener.local_addr()?;
    coordinator.launcher.set_port(addr.port());

    coordinator.start();
    tracing::info!(%addr, "broker listening");
    println!("beamcode listening on http://{addr}");

    // ── Serve until ctrl-c ───────────────────────────────────────────
    axum::serve(listener, api::app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("server error")?;

    coordinator.stop().await;
    tracing::info!("broker stopped");
    Ok(())
}

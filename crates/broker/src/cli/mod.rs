//! Command-line interface for the `beamcode` binary.

pub mod config;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use bc_domain::config::Config;

#[derive(Debug, Parser)]
#[command(name = "beamcode", about = "Local session broker for coding-agent CLIs")]
pub struct Cli {
    /// Path to the config file (default: ./beamcode.toml or $BEAMCODE_CONFIG).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the broker (default).
    Serve,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse and validate the config file.
    Validate,
    /// Print the effective configuration.
    Show,
}

/// Load the config file (missing file = defaults), then apply env overrides.
pub fn load_config(cli_path: Option<&Path>) -> anyhow::Result<(Config, PathBuf)> {
    let path = cli_path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("BEAMCODE_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("beamcode.toml"));

    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    } else {
        Config::default()
    };
    config.apply_env_overrides();

    Ok((config, path))
}

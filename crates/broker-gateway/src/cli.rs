//! Command-line entry points.

use std::path::{Path, PathBuf};

use broker_domain::Config;
use clap::{Parser, Subcommand};

/// agent-broker — a multi-backend agent session broker.
#[derive(Debug, Parser)]
#[command(name = "agent-broker", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "config.toml")]
    pub config: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the broker (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report validation issues.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

/// Load configuration from `path`, falling back to defaults (plus
/// environment overrides) when the file does not exist — the broker
/// should come up on a bare `port` env var with no file at all.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)?
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    if let Ok(port) = std::env::var("AGENT_BROKER_PORT") {
        if let Ok(port) = port.parse() {
            config.port = port;
        }
    }

    Ok(config)
}

pub fn show_config(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(toml) => println!("{toml}"),
        Err(e) => eprintln!("failed to render config: {e}"),
    }
}

pub fn validate_config(config: &Config) -> bool {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            broker_domain::ConfigSeverity::Warning => eprintln!("WARNING: {issue}"),
            broker_domain::ConfigSeverity::Error => eprintln!("ERROR: {issue}"),
        }
    }
    !issues
        .iter()
        .any(|i| i.severity == broker_domain::ConfigSeverity::Error)
}

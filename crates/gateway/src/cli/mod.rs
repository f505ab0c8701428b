pub mod config;
pub mod doctor;

use clap::{Parser, Subcommand};

/// wsproxy: a workspace proxy for the primary control plane.
#[derive(Debug, Parser)]
#[command(name = "wsproxy", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the proxy (default when no subcommand is given).
    Serve,
    /// Run diagnostic checks against the configured primary.
    Doctor,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path specified by `WSPROXY_CONFIG` (or
/// `wsproxy.toml` by default).  Returns the parsed [`Config`] and the
/// path that was used.
///
/// [`Config`]: wsp_domain::config::Config
pub fn load_config() -> anyhow::Result<(wsp_domain::config::Config, String)> {
    let config_path =
        std::env::var("WSPROXY_CONFIG").unwrap_or_else(|_| "wsproxy.toml".into());
    let config = load_config_from(&config_path)?;
    Ok((config, config_path))
}

/// Parse `path`, or fall back to defaults when it does not exist.
pub fn load_config_from(path: &str) -> anyhow::Result<wsp_domain::config::Config> {
    if !std::path::Path::new(path).exists() {
        return Ok(wsp_domain::config::Config::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("reading {path}: {e}"))?;
    toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {path}: {e}"))
}

//! Command line front-end for AIOVPN.
//!
//! The CLI works on configuration files: it checks them, shows the tunnel
//! configuration the core would run with, and prints a default file to
//! start from.

use clap::{Parser, Subcommand};
use core_engine::{TunnelConfig, TunnelError};
use serde::Serialize;
use shared_utils::config::{Config, ConfigError, ConfigManager};
use shared_utils::logging::{LogOptions, WorkerGuard, init_logging, init_logging_from_config};
use std::path::{Path, PathBuf};
use tracing::{Level, debug, info};

/// AIOVPN command line client
#[derive(Parser, Debug)]
#[command(
    name = "aiovpn",
    author,
    version,
    about,
    long_about = None,
    after_help = "Examples:\n  aiovpn validate --config client.toml\n  aiovpn show --config client.toml --json\n  aiovpn defaults > client.toml"
)]
pub struct Cli {
    /// Log at the level set in the configuration instead of warnings only
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Print the resolved tunnel configuration
    Show {
        /// Path to the configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Print a default configuration file
    Defaults,
}

/// Error type for CLI operations
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The configuration file could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The configuration does not describe a usable tunnel
    #[error("Tunnel configuration error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Output could not be rendered
    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;

fn init_cli_logging(config: &Config, verbose: bool) -> Option<WorkerGuard> {
    if verbose {
        init_logging_from_config(config, false)
    } else {
        init_logging(LogOptions {
            level: Level::WARN,
            include_file_line: false,
            ..Default::default()
        })
    }
}

/// Logging is set up from the loaded file, so failures here are reported
/// by `main` on stderr rather than logged.
fn load(path: Option<&Path>) -> CliResult<ConfigManager> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(Config::default_path);
    Ok(ConfigManager::load(&path)?)
}

/// Run the CLI application
pub fn run(cli: Cli) -> CliResult<()> {
    match cli.command {
        Commands::Validate { config } => {
            let manager = load(config.as_deref())?;
            let _guard = init_cli_logging(manager.config(), cli.verbose);

            let tunnel = TunnelConfig::from_global_config(manager.config())?;
            info!(
                path = %manager.config_path().display(),
                endpoints = tunnel.endpoints.len(),
                "Configuration is valid"
            );
            println!(
                "{}: ok ({} endpoint{})",
                manager.config_path().display(),
                tunnel.endpoints.len(),
                if tunnel.endpoints.len() == 1 { "" } else { "s" }
            );
        }
        Commands::Show { config, json } => {
            let manager = load(config.as_deref())?;
            let _guard = init_cli_logging(manager.config(), cli.verbose);
            debug!(path = %manager.config_path().display(), "Loaded configuration");

            let tunnel = TunnelConfig::from_global_config(manager.config())?;
            let summary = TunnelSummary::from(&tunnel);
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary.render_text());
            }
        }
        Commands::Defaults => {
            let config = Config::default();
            let _guard = init_cli_logging(&config, cli.verbose);
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}

/// What `show` prints. Credentials are reduced to the user name.
#[derive(Debug, Serialize, PartialEq)]
struct TunnelSummary {
    endpoints: Vec<String>,
    username: Option<String>,
    cipher: Option<String>,
    auth: Option<String>,
    reconnect_enabled: bool,
    max_retries: u32,
    initial_delay_ms: u64,
    backoff_multiplier: f64,
    max_delay_ms: u64,
    keepalive_interval_secs: u64,
    keepalive_timeout_secs: u64,
    negotiation_timeout_secs: u64,
    interface_name: Option<String>,
    allow_lan: bool,
    local_networks: Vec<String>,
    excluded_routes: Vec<String>,
    queue_depth: usize,
    block_timeout_ms: u64,
}

impl From<&TunnelConfig> for TunnelSummary {
    fn from(config: &TunnelConfig) -> Self {
        let keepalive = &config.keepalive;
        TunnelSummary {
            endpoints: config.endpoints.iter().map(ToString::to_string).collect(),
            username: config.credentials.as_ref().map(|c| c.username.clone()),
            cipher: config.protocol.cipher.clone(),
            auth: config.protocol.auth.clone(),
            reconnect_enabled: config.reconnect.enabled,
            max_retries: config.reconnect.attempts(),
            initial_delay_ms: config.reconnect.initial_delay.as_millis() as u64,
            backoff_multiplier: config.reconnect.multiplier,
            max_delay_ms: config.reconnect.max_delay.as_millis() as u64,
            keepalive_interval_secs: keepalive.interval.as_secs(),
            keepalive_timeout_secs: keepalive.interval.as_secs() * u64::from(keepalive.missed_beats),
            negotiation_timeout_secs: config.negotiation_timeout.as_secs(),
            interface_name: config.interface.name.clone(),
            allow_lan: config.interface.allow_lan,
            local_networks: config
                .interface
                .local_networks
                .iter()
                .map(ToString::to_string)
                .collect(),
            excluded_routes: config
                .interface
                .excluded_routes
                .iter()
                .map(ToString::to_string)
                .collect(),
            queue_depth: config.pump.queue_depth,
            block_timeout_ms: config.pump.block_timeout.as_millis() as u64,
        }
    }
}

impl TunnelSummary {
    fn render_text(&self) -> String {
        let or_none = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
        let list = |v: &[String]| if v.is_empty() { "-".to_string() } else { v.join(", ") };

        let mut out = String::new();
        out.push_str(&format!("endpoints:          {}\n", list(&self.endpoints)));
        out.push_str(&format!("username:           {}\n", or_none(&self.username)));
        out.push_str(&format!("cipher:             {}\n", or_none(&self.cipher)));
        out.push_str(&format!("auth:               {}\n", or_none(&self.auth)));
        if self.reconnect_enabled {
            out.push_str(&format!(
                "reconnect:          {} retries, {} ms x{} up to {} ms\n",
                self.max_retries, self.initial_delay_ms, self.backoff_multiplier, self.max_delay_ms
            ));
        } else {
            out.push_str("reconnect:          disabled\n");
        }
        out.push_str(&format!(
            "keepalive:          every {} s, dead after {} s\n",
            self.keepalive_interval_secs, self.keepalive_timeout_secs
        ));
        out.push_str(&format!(
            "negotiation:        {} s timeout\n",
            self.negotiation_timeout_secs
        ));
        out.push_str(&format!("interface:          {}\n", or_none(&self.interface_name)));
        out.push_str(&format!("allow lan:          {}\n", self.allow_lan));
        out.push_str(&format!("local networks:     {}\n", list(&self.local_networks)));
        out.push_str(&format!("excluded routes:    {}\n", list(&self.excluded_routes)));
        out.push_str(&format!(
            "outbound queue:     {} packets, {} ms block\n",
            self.queue_depth, self.block_timeout_ms
        ));
        out
    }
}

//! avalink - live-stream event to OSC avatar control bridge
//!
//! Subcommands:
//! - `avalink serve` - Run the bridge and its admin API
//! - `avalink send <address> [args..]` - Send one OSC message
//! - `avalink discover` - Dump the remote parameter tree
//! - `avalink listen` - Print inbound OSC traffic
//! - `avalink config show|paths` - Inspect the merged configuration

use std::path::PathBuf;

use anyhow::{Context, Result};
use avaconf::BridgeConfig;
use clap::{Parser, Subcommand};

use avalink::{commands, serve, telemetry};

#[derive(Parser)]
#[command(name = "avalink")]
#[command(about = "Live-stream event to OSC avatar control bridge")]
#[command(version)]
struct Cli {
    /// Config file replacing ./avalink.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Per-message debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge and the admin API
    Serve {
        /// Admin API bind address (overrides admin.bind)
        #[arg(long)]
        bind: Option<String>,

        /// OTLP gRPC endpoint (overrides telemetry.otlpEndpoint)
        #[arg(long)]
        otlp_endpoint: Option<String>,
    },

    /// Send one OSC message to the configured target
    Send {
        /// OSC address, e.g. /avatar/parameters/Wave
        address: String,

        /// Arguments: true/false, integers, floats, anything else is a string
        args: Vec<String>,
    },

    /// Query the remote parameter tree
    Discover {
        /// Only parameters whose address matches this regex
        #[arg(short, long)]
        pattern: Option<String>,

        /// Print the nested tree as JSON
        #[arg(long)]
        tree: bool,
    },

    /// Print inbound OSC messages
    Listen {
        /// Stop after this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the merged configuration as TOML
    Show,
    /// List the files and env vars that contributed
    Paths,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = BridgeConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if cli.verbose {
        config.verbose_mode = true;
    }

    match cli.command {
        Commands::Serve {
            bind,
            otlp_endpoint,
        } => {
            if let Some(bind) = bind {
                config.admin.bind = bind;
            }
            if otlp_endpoint.is_some() {
                config.telemetry.otlp_endpoint = otlp_endpoint;
            }
            let _telemetry = telemetry::init(&config.telemetry, config.verbose_mode)
                .context("Failed to initialize telemetry")?;
            for file in &sources.files {
                tracing::info!(file = %file.display(), "loaded config");
            }
            serve::run(config).await?;
        }
        Commands::Send { address, args } => {
            init_cli_logging(&config)?;
            commands::send(&config, &address, &args).await?;
        }
        Commands::Discover { pattern, tree } => {
            init_cli_logging(&config)?;
            commands::discover(&config, pattern.as_deref(), tree).await?;
        }
        Commands::Listen { count } => {
            init_cli_logging(&config)?;
            commands::listen(&config, count).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(&config)?,
            ConfigAction::Paths => commands::config_paths(&sources),
        },
    }

    Ok(())
}

/// One-shot commands log locally only.
fn init_cli_logging(config: &BridgeConfig) -> Result<()> {
    let mut telemetry = config.telemetry.clone();
    telemetry.otlp_endpoint = None;
    // Without an exporter the guard holds nothing to flush.
    let _guard = telemetry::init(&telemetry, config.verbose_mode)?;
    Ok(())
}

// FHIR Gatekeeper - Main Entry Point
//
// CLI interface for running the admission gate and inspecting its
// configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fhir_gatekeeper::config::{Config, DEFAULT_CONFIG_FILE};
use fhir_gatekeeper::server;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Admission control and break-glass governance for clinical APIs
#[derive(Parser, Debug)]
#[command(name = "gatekeeper")]
#[command(version)]
#[command(about = "Rate plans, quotas, and audited emergency overrides for FHIR APIs", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gatekeeper HTTP server
    Serve {
        /// Override the configured listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective rate plans as JSON
    Plans,
    /// Validate the configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_from_path(&args.config)
        .with_context(|| format!("Invalid configuration in {:?}", args.config))?;

    init_tracing(&config, args.verbose)?;

    match args.command {
        Some(Commands::Serve { port }) => {
            if let Some(port) = port {
                config.server.port = port;
            }
            info!("FHIR Gatekeeper v{} starting...", env!("CARGO_PKG_VERSION"));
            server::serve(config).await?;
        }
        Some(Commands::Plans) => {
            let plans = config.plan_registry().list_plans();
            let json = serde_json::to_string_pretty(&plans).context("Failed to encode plans")?;
            println!("{}", json);
        }
        Some(Commands::CheckConfig) => {
            println!("Configuration OK ({:?})", args.config);
        }
        None => {
            info!("No command specified. Use \"gatekeeper --help\" for usage.");
        }
    }

    Ok(())
}

/// Initialize tracing on stderr; `RUST_LOG` refines the configured level
fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }

    Ok(())
}

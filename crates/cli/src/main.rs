mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use devloop_lib::config::EngineConfig;

use crate::output::{OutputFormat, print_error};

#[derive(Parser)]
#[command(name = "devloop")]
#[command(author, version, about = "Inspect scheduling and live-update decisions of a dev loop", long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Engine config file
  #[arg(short, long, global = true, default_value = "devloop.json")]
  config: PathBuf,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value = "text")]
  format: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Show which manifest would build next and why the others are held
  Next {
    /// Engine state snapshot (JSON)
    #[arg(short, long)]
    state: PathBuf,
  },

  /// Show the build order of a manifest's targets
  Order {
    /// Engine state snapshot (JSON)
    #[arg(short, long)]
    state: PathBuf,

    /// Manifest to order
    #[arg(short, long)]
    manifest: String,
  },

  /// Show the live-update plan for changed files
  Plan {
    /// Engine state snapshot (JSON)
    #[arg(short, long)]
    state: PathBuf,

    /// Image target, e.g. image:frontend
    #[arg(short, long)]
    target: String,

    /// Changed files
    #[arg(required = true)]
    files: Vec<PathBuf>,
  },
}

fn main() {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  if let Err(err) = run(cli) {
    print_error(&format!("{:#}", err));
    std::process::exit(1);
  }
}

fn run(cli: Cli) -> Result<()> {
  let config = EngineConfig::load(&cli.config)
    .with_context(|| format!("Failed to load config: {}", cli.config.display()))?;

  match cli.command {
    Commands::Next { state } => cmd::cmd_next(&state, &config, cli.format),
    Commands::Order { state, manifest } => cmd::cmd_order(&state, &manifest, cli.format),
    Commands::Plan { state, target, files } => cmd::cmd_plan(&state, &target, &files, &config, cli.format),
  }
}

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use geopoint_sync::app::App;
use geopoint_sync::commands::Command;
use geopoint_sync::config::Config;
use geopoint_sync::telemetry;

#[derive(Parser, Debug)]
#[command(name = "geopoint-sync")]
#[command(about = "Offline queue, sync agent and cache gateway for GeoPoint")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./geopoint.yaml or $XDG_CONFIG_HOME/geopoint/config.yaml)
  #[arg(long)]
  config: Option<PathBuf>,

  /// Debug logging (RUST_LOG takes precedence)
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let log_dir = config.data_dir()?.join("logs");
  let _guard = telemetry::init_tracing(args.verbose, Some(&log_dir))?;

  let app = App::new(config)?;
  app.execute(args.command).await?;

  Ok(())
}

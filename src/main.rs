mod commands;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use repocat::config::Config;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "repocat")]
#[command(about = "Offline-first browser for a user's GitHub repositories")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/repocat/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// GitHub user whose repositories to browse
  #[arg(short, long)]
  owner: Option<String>,

  /// Repositories per page (1-100)
  #[arg(long)]
  page_size: Option<u32>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration, then apply command line overrides
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(owner) = args.owner {
    config.github.owner = Some(owner);
  }
  if let Some(page_size) = args.page_size {
    config.cache.page_size = page_size;
  }
  config.validate()?;

  let _log_guard = init_logging(&config)?;

  commands::run(args.command, &config).await
}

/// Log to a daily file next to the cache so output stays clean.
fn init_logging(config: &Config) -> Result<WorkerGuard> {
  let cache_path = config.cache_path()?;
  let log_dir = cache_path
    .parent()
    .ok_or_else(|| eyre!("Cache path {} has no parent directory", cache_path.display()))?;
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "repocat.log"));

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("repocat=info")),
    )
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

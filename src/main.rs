use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use datasync::{Config, SyncService};

#[derive(Parser, Debug)]
#[command(name = "datasync")]
#[command(about = "Keeps dashboard datasets cached and fresh, local snapshots first")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./datasync.yaml or $XDG_CONFIG_HOME/datasync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also write logs to a daily rotated file in this directory
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Keep refreshing in the background until interrupted
  Run,
  /// Refresh now, ignoring freshness, and print the resulting status
  Refresh {
    /// Source ids or dataset keys (default: everything)
    sources: Vec<String>,
  },
  /// Show cached datasets and whether they are fresh
  Status,
  /// Drop one cached dataset, or all of them
  Clear { key: Option<String> },
}

fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

  let (file, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "datasync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr)
    .with(file)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_dir.as_deref());

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let service = SyncService::from_config(&config)?;

  match args.command {
    Command::Run => {
      let handle = service.start()?;
      tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
      info!("Interrupted, shutting down");
      service.dispose();
      handle.join().await;
    }
    Command::Refresh { sources } => {
      let names: Vec<&str> = sources.iter().map(String::as_str).collect();
      let result = service
        .force_update((!names.is_empty()).then_some(names.as_slice()))
        .await;

      println!("{}", serde_json::to_string_pretty(&service.status())?);
      result?;
    }
    Command::Status => {
      for key in service.keys() {
        match service.get_entry(&key) {
          Some(entry) => println!(
            "{:<32} {:<6} {:<15} fetched {}",
            key,
            if entry.is_fresh() { "fresh" } else { "stale" },
            entry.origin.as_str(),
            entry.fetched_at.to_rfc3339()
          ),
          None => println!("{:<32} {:<6}", key, "-"),
        }
      }
    }
    Command::Clear { key } => {
      service.clear_cache(key.as_deref());
    }
  }

  Ok(())
}

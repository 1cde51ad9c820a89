use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use url::Url;

use standby::config::Config;
use standby::engine::Engine;
use standby::http::RequestDescriptor;
use standby::sync::OperationKind;

#[derive(Parser, Debug)]
#[command(name = "standby")]
#[command(about = "Offline-first request interception and cache engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/standby/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-populate critical and optional tiers for the configured version
  Install,
  /// Activate the configured version and delete tiers from other versions
  Activate,
  /// Print per-tier entry counts and pending sync operations
  Status,
  /// Flush every pending sync-queue kind
  Sync,
  /// Delete tiers left over from previous versions
  Clear,
  /// Download pack resources matching a selector into the model tier
  Pack {
    /// Substring matched against configured model resources
    selector: String,
  },
  /// Classify and execute a single GET request, printing the outcome
  Fetch {
    url: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  init_tracing()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let engine = Engine::open(config)?;

  match args.command {
    Command::Install => {
      engine.install().await?;
      println!("install complete for version {}", engine.config().version);
    }
    Command::Activate => {
      engine.activate().await?;
      println!("activated version {}", engine.config().version);
    }
    Command::Status => {
      print_status(&engine)?;
    }
    Command::Sync => {
      engine.periodic().await;
      println!("sync pass finished");
    }
    Command::Clear => {
      engine
        .handle_message(standby::ClientMessage::ClearCache)
        .await;
      println!("stale tiers cleared");
    }
    Command::Pack { selector } => {
      engine
        .handle_message(standby::ClientMessage::DownloadPack { selector })
        .await;
      println!("pack download finished");
    }
    Command::Fetch { url } => {
      let url = Url::parse(&url).map_err(|e| eyre!("Invalid url {url}: {e}"))?;
      let response = engine.handle(&RequestDescriptor::get(url)).await;
      println!("status: {}", response.status);
      println!("bytes:  {}", response.body.len());
    }
  }

  Ok(())
}

fn print_status(engine: &Engine) -> Result<()> {
  let per_tier = engine.cache_status()?;
  if per_tier.is_empty() {
    println!("no cache tiers yet");
  } else {
    for tier in per_tier {
      println!("{:<20} {:>6} entries", tier.name, tier.size);
    }
  }

  for kind in OperationKind::ALL {
    let pending = engine.pending_operations(kind)?;
    println!("{:<20} {:>6} pending", kind.as_str(), pending);
  }

  Ok(())
}

/// Log to a daily file under the data directory; stdout stays reserved for
/// command output.
fn init_tracing() -> Result<()> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("standby")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "standby.log");
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("standby=info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(appender)
    .with_ansi(false)
    .init();

  Ok(())
}

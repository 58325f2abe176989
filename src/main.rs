use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use storefront_offline::cache::{CacheStorage, PartitionStore, SqliteStorage};
use storefront_offline::network::{HttpNetwork, Network, OfflineNetwork};
use storefront_offline::worker::{Clients, LifecycleState, ServiceWorker, WorkerSettings};
use storefront_offline::{Config, Destination, Request};

#[derive(Parser, Debug)]
#[command(name = "storefront-offline")]
#[command(about = "Offline-first request cache for a storefront site")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storefront-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version (warm-up), then activate it
  Install,
  /// Activate the configured version, or re-run stale partition cleanup
  /// when it is already active
  Activate,
  /// Fetch one URL through the caching layer
  Fetch {
    url: String,
    /// Resource type of the request
    #[arg(short, long, value_enum, default_value_t = Destination::Document)]
    destination: Destination,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Write the body to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Treat the network as unreachable
    #[arg(long)]
    offline: bool,
  },
  /// List partitions and their entry counts
  Partitions,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(&config)?;

  let storage = SqliteStorage::open(&config.database_path()?)?;
  let store = PartitionStore::new(storage);

  if matches!(args.command, Command::Fetch { offline: true, .. }) {
    run(&config, args.command, store, OfflineNetwork).await
  } else {
    let network = HttpNetwork::new(&config)?;
    run(&config, args.command, store, network).await
  }
}

/// Log to stderr, or to a daily rolling file when `log_dir` is set.
fn init_tracing(config: &Config) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| "storefront_offline=info".into());

  match &config.log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "storefront-offline.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(None)
    }
  }
}

async fn run<S: CacheStorage, N: Network>(
  config: &Config,
  command: Command,
  store: PartitionStore<S>,
  network: N,
) -> Result<()> {
  let settings = WorkerSettings::from_config(config)?;
  let worker = ServiceWorker::resume(
    settings,
    store,
    Arc::new(network),
    Arc::new(Clients::new()),
  )?;

  match command {
    Command::Install => {
      if worker.state() == LifecycleState::Active {
        eprintln!("version {} is already active", worker.settings().version);
        return Ok(());
      }
      install_and_activate(&worker).await?;
    }
    Command::Activate => {
      if worker.state() == LifecycleState::Active {
        let deleted = worker.retire_stale_partitions().await?;
        eprintln!("deleted {} stale partition(s)", deleted.len());
      } else {
        install_and_activate(&worker).await?;
      }
    }
    Command::Fetch {
      url,
      destination,
      method,
      output,
      ..
    } => {
      if worker.state() != LifecycleState::Active {
        install_and_activate(&worker).await?;
      }

      let url = Url::parse(&url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
      let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let request = Request::new(method, url, destination);

      let response = worker.handle(&request).await?;
      eprintln!(
        "{} {} ({}, {})",
        response.status,
        request.url,
        response.source,
        response.content_type().unwrap_or("no content-type")
      );

      match output {
        Some(path) => std::fs::write(&path, &response.body)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
        None => std::io::stdout().write_all(&response.body)?,
      }
    }
    Command::Partitions => {
      let partitions = &worker.settings().partitions;
      for name in worker.store().names()? {
        let count = worker.store().entry_count(&name)?;
        let status = if partitions.contains(&name) {
          "current"
        } else {
          "stale"
        };
        println!("{:<24} {:>6} entries  {}", name, count, status);
      }
    }
  }

  // Detached writes must land before the process exits
  worker.settle().await;
  Ok(())
}

async fn install_and_activate<S: CacheStorage, N: Network>(
  worker: &ServiceWorker<S, N>,
) -> Result<()> {
  let report = worker.install().await?;
  eprintln!("{}", report);

  let activation = worker.activate().await?;
  if !activation.deleted.is_empty() {
    eprintln!("deleted stale partitions: {}", activation.deleted.join(", "));
  }
  eprintln!("version {} active", worker.settings().version);

  Ok(())
}

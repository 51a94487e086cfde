use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use feedsync::cache::{CacheIndex, Cacheable, TieredCache};
use feedsync::config::{self, Config};
use feedsync::mutation::CounterSnapshot;
use feedsync::remote::Document;

#[derive(Parser, Debug)]
#[command(name = "feedsync")]
#[command(about = "Inspect and maintain the feedsync local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/feedsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show cached entries and bytes per entity type and tier
  Stats,
  /// Delete disk entries older than the configured TTL
  Purge,
  /// Drop index rows whose disk file is gone
  PruneIndex,
  /// Remove every cached entry (e.g. after logout)
  Clear,
  /// Print the effective configuration
  Config,
}

fn init_logging() -> Result<WorkerGuard> {
  let log_dir = config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .wrap_err_with(|| format!("creating log directory {}", log_dir.display()))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "feedsync.log"));
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feedsync=info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
    .init();
  Ok(guard)
}

/// The caches this binary maintains, opened against one index.
struct Caches {
  index: Arc<CacheIndex>,
  documents: TieredCache<Document>,
  counters: TieredCache<CounterSnapshot>,
  /// Index rows dropped while opening because their disk file was gone.
  pruned: usize,
}

impl Caches {
  async fn open(config: &Config) -> Result<Self> {
    let index_path = config.cache.index_path()?;
    let index = Arc::new(
      CacheIndex::open(&index_path)
        .wrap_err_with(|| format!("opening cache index {}", index_path.display()))?,
    );
    let rows_before = index.entries(None)?.len();

    // Opening a cache reconciles its index rows with the files on disk.
    let documents = open_cache::<Document>(config, &index).await?;
    let counters = open_cache::<CounterSnapshot>(config, &index).await?;
    let pruned = rows_before.saturating_sub(index.entries(None)?.len());

    Ok(Self {
      index,
      documents,
      counters,
      pruned,
    })
  }
}

async fn open_cache<T: Cacheable>(config: &Config, index: &Arc<CacheIndex>) -> Result<TieredCache<T>> {
  TieredCache::open(&config.cache, index.clone())
    .await
    .wrap_err_with(|| format!("opening {} cache", T::entity_type()))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_logging()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Stats => {
      let caches = Caches::open(&config).await?;
      for stats in [caches.documents.stats(), caches.counters.stats()] {
        println!("{}", stats.entity_type);
        for tier in &stats.indexed {
          println!(
            "  {:<8} {:>8} entries {:>12} bytes",
            tier.tier.as_str(),
            tier.entries,
            tier.bytes
          );
        }
      }
      println!("{} index rows total", caches.index.entries(None)?.len());
    }
    Command::Purge => {
      let caches = Caches::open(&config).await?;
      let purged = caches.documents.purge_expired().await + caches.counters.purge_expired().await;
      info!(purged, "purged expired cache entries");
      println!("purged {} expired entries", purged);
    }
    Command::PruneIndex => {
      let caches = Caches::open(&config).await?;
      info!(pruned = caches.pruned, "pruned cache index");
      println!("pruned {} index rows", caches.pruned);
    }
    Command::Clear => {
      let caches = Caches::open(&config).await?;
      let cleared = caches.documents.invalidate_all().await + caches.counters.invalidate_all().await;
      info!(cleared, "cleared cache");
      println!("cleared {} entries", cleared);
    }
    Command::Config => println!("{:#?}", config),
  }

  Ok(())
}

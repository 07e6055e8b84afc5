mod app;
mod cache;
mod config;
mod controller;
mod event;
mod fetcher;
mod logging;
mod store;
mod ui;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use cache::{CacheLayer, NoopStorage, SqliteStorage};
use config::Config;
use controller::RefreshController;
use fetcher::HttpFetcher;

#[derive(Parser, Debug)]
#[command(name = "pulseboard")]
#[command(about = "A terminal KPI dashboard that keeps itself fresh")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pulseboard/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Dataset key to display
  #[arg(short, long)]
  dataset: Option<String>,

  /// Reporting period (e.g. 7d, 30d, 90d)
  #[arg(short, long)]
  period: Option<String>,

  /// Fetch once, print the payload as JSON and exit
  #[arg(long)]
  once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = logging::init()?;

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override from command line
  if let Some(dataset) = args.dataset {
    config.api.dataset = dataset;
  }
  if let Some(period) = args.period {
    config.preferences.period = period;
  }

  let controller = build_controller(&config)?;

  if args.once {
    return print_once(&controller).await;
  }

  let mut app = app::App::new(config, controller);
  app.run().await?;

  Ok(())
}

fn build_controller(config: &Config) -> Result<RefreshController> {
  let fetcher = HttpFetcher::new(config)?;

  let cache = if config.cache.enabled {
    match SqliteStorage::open() {
      Ok(storage) => CacheLayer::new(storage),
      Err(e) => {
        // The dashboard works without a cache, just without cold start
        tracing::warn!(error = %e, "cache unavailable, continuing without it");
        CacheLayer::new(NoopStorage)
      }
    }
  } else {
    CacheLayer::new(NoopStorage)
  };

  Ok(
    RefreshController::builder(config.api.dataset.clone(), Arc::new(fetcher))
      .cache(
        cache.with_namespace(config.cache.namespace.clone()),
        config.cache.max_age(),
      )
      .max_retries(config.refresh.max_retries)
      .retry_delay(config.refresh.retry_delay())
      .fetch_timeout(config.refresh.fetch_timeout())
      .preferences(config.preferences.clone().into())
      .build(),
  )
}

async fn print_once(controller: &RefreshController) -> Result<()> {
  controller.refresh_now().await;
  // Drop any retry the failure scheduled; this mode reports and exits
  controller.stop();
  let state = controller.state();

  if let Some(error) = state.error {
    return Err(eyre!("Failed to fetch {}: {}", controller.dataset_key(), error));
  }

  let dataset = state
    .data
    .ok_or_else(|| eyre!("No data returned for {}", controller.dataset_key()))?;

  let json = serde_json::to_string_pretty(&dataset.payload)
    .map_err(|e| eyre!("Failed to format payload: {}", e))?;
  println!("{}", json);

  Ok(())
}

pub mod app_state;
pub mod engine;
pub mod error;
pub mod events;
pub mod local_api;
pub mod model;
pub mod persistence;
pub mod providers;

use app_state::{AppConfig, AppPaths, AppState};
use engine::{provider::ProviderRegistry, queue::DownloadQueue, DownloadOrchestrator, OrchestratorConfig};
use std::sync::Arc;

pub async fn run() -> anyhow::Result<()> {
  // Logging + data dirs
  let config = AppConfig::from_env();
  let paths = AppPaths::from_config(&config)?;
  error::init_tracing(&paths)?;

  tracing::info!(
    data_dir = %paths.data_dir.display(),
    download_dir = %paths.download_dir.display(),
    port = config.port,
    "starting tunefetch"
  );

  let db = persistence::Db::open(paths.db_path.clone())?;
  db.init_schema()?;

  let settings = persistence::SettingsStore::new(db.clone());
  settings.ensure_bootstrap_defaults()?;
  let history: Arc<dyn persistence::HistoryStore> = Arc::new(persistence::SqliteHistoryStore::new(db));

  // Shared queue + broker + orchestrator
  let queue = DownloadQueue::new();
  let broker = events::ProgressBroker::spawn(config.observer_buffer);
  let providers = ProviderRegistry::with_defaults()?;
  tracing::info!(services = ?providers.services(), "providers registered");
  let orchestrator = DownloadOrchestrator::new(
    queue.clone(),
    broker.clone(),
    providers,
    history.clone(),
    OrchestratorConfig {
      max_concurrent_downloads: config.max_concurrent_downloads,
      ..Default::default()
    },
  );

  let state = AppState {
    config,
    paths,
    settings,
    history,
    queue,
    broker,
    orchestrator: orchestrator.clone(),
  };

  local_api::serve(state, async move {
    shutdown_signal().await;
    tracing::info!("shutdown requested");
    orchestrator.shutdown();
  })
  .await
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!(error = %e, "failed to listen for ctrl-c");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut sig) => {
        sig.recv().await;
      }
      Err(e) => {
        tracing::error!(error = %e, "failed to listen for SIGTERM");
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }
}

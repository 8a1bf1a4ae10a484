use crate::{
  engine::{queue::DownloadQueue, DownloadOrchestrator},
  events::{ProgressBroker, DEFAULT_OBSERVER_BUFFER},
  persistence::{HistoryStore, SettingsStore},
};
use anyhow::Context;
use std::{path::PathBuf, sync::Arc};

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
  pub port: u16,
  pub download_path: PathBuf,
  pub data_dir: PathBuf,
  /// `ENV=development`; enables permissive CORS.
  pub development: bool,
  pub max_concurrent_downloads: usize,
  pub observer_buffer: usize,
}

impl AppConfig {
  pub fn from_env() -> Self {
    Self::from_lookup(|k| std::env::var(k).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    Self {
      port: get("PORT").and_then(|v| v.parse().ok()).unwrap_or(8080),
      download_path: PathBuf::from(get("DOWNLOAD_PATH").unwrap_or_else(|| "./downloads".to_string())),
      data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".to_string())),
      development: get("ENV").is_some_and(|v| v == "development"),
      max_concurrent_downloads: get("MAX_CONCURRENT_DOWNLOADS")
        .and_then(|v| v.parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(4),
      observer_buffer: get("OBSERVER_BUFFER")
        .and_then(|v| v.parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_OBSERVER_BUFFER),
    }
  }
}

#[derive(Clone)]
pub struct AppPaths {
  pub download_dir: PathBuf,
  pub data_dir: PathBuf,
  pub logs_dir: PathBuf,
  pub db_path: PathBuf,
}

impl AppPaths {
  pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
    let download_dir = cfg.download_path.clone();
    std::fs::create_dir_all(&download_dir).context("failed to create download dir")?;

    let data_dir = cfg.data_dir.clone();
    std::fs::create_dir_all(&data_dir).context("failed to create data dir")?;

    let logs_dir = data_dir.join("logs");
    std::fs::create_dir_all(&logs_dir).context("failed to create logs dir")?;

    let db_path = data_dir.join("tunefetch.sqlite3");

    Ok(Self {
      download_dir,
      data_dir,
      logs_dir,
      db_path,
    })
  }
}

#[derive(Clone)]
pub struct AppState {
  pub config: AppConfig,
  pub paths: AppPaths,
  pub settings: SettingsStore,
  pub history: Arc<dyn HistoryStore>,
  pub queue: DownloadQueue,
  pub broker: ProgressBroker,
  pub orchestrator: DownloadOrchestrator,
}

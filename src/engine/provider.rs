//! Seam between the orchestrator and the per-service download clients.

use crate::engine::sink::ProgressSink;
use async_trait::async_trait;
use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::Arc,
};

/// Prefix older clients put in front of a path to mean "already on disk".
pub const LEGACY_EXISTS_PREFIX: &str = "EXISTS:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
  Downloaded { path: PathBuf },
  AlreadyExists { path: PathBuf },
}

impl DownloadOutcome {
  /// Adapter for clients that still signal existing files with a path prefix.
  pub fn from_legacy_path(raw: &str) -> Self {
    match raw.strip_prefix(LEGACY_EXISTS_PREFIX) {
      Some(path) => DownloadOutcome::AlreadyExists { path: PathBuf::from(path) },
      None => DownloadOutcome::Downloaded { path: PathBuf::from(raw) },
    }
  }

  pub fn path(&self) -> &Path {
    match self {
      DownloadOutcome::Downloaded { path } | DownloadOutcome::AlreadyExists { path } => path,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackMetadata {
  pub track_name: String,
  pub artist_name: String,
  pub album_name: String,
  pub album_artist: String,
  pub release_date: String,
  pub cover_url: String,
  pub track_number: u32,
  pub disc_number: u32,
}

/// Everything a client needs for one attempt.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
  /// Source track id (e.g. a Spotify id) the service resolves.
  pub source_ref: String,
  pub output_dir: PathBuf,
  pub query_hint: String,
  pub filename_template: String,
  pub audio_format: String,
  /// Service-specific link, when the caller already resolved one.
  pub service_url: String,
  pub metadata: TrackMetadata,
}

#[async_trait]
pub trait DownloaderProvider: Send + Sync {
  fn service(&self) -> &'static str;

  /// Whether the service cannot resolve a track without `source_ref`.
  fn requires_source_ref(&self) -> bool {
    false
  }

  async fn download(&self, req: &ProviderRequest, sink: &ProgressSink) -> anyhow::Result<DownloadOutcome>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
  providers: HashMap<&'static str, Arc<dyn DownloaderProvider>>,
}

impl ProviderRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_defaults() -> anyhow::Result<Self> {
    let mut reg = Self::new();
    reg.register(Arc::new(crate::providers::direct::DirectUrlProvider::new()?));
    Ok(reg)
  }

  /// Replaces any provider already registered for the same service.
  pub fn register(&mut self, provider: Arc<dyn DownloaderProvider>) {
    self.providers.insert(provider.service(), provider);
  }

  pub fn get(&self, service: &str) -> Option<Arc<dyn DownloaderProvider>> {
    self.providers.get(service).cloned()
  }

  pub fn services(&self) -> Vec<&'static str> {
    let mut names: Vec<_> = self.providers.keys().copied().collect();
    names.sort_unstable();
    names
  }
}

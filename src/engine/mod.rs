pub mod naming;
pub mod provider;
pub mod queue;
pub mod sink;

use crate::{
  error::{DownloadError, QueueAction, QueueError},
  events::{EventStatus, ProgressBroker, ProgressEvent},
  model::{DownloadRequest, HistoryRecord, JobStatus},
  persistence::HistoryStore,
};
use dashmap::DashMap;
use provider::{DownloadOutcome, DownloaderProvider, ProviderRegistry, ProviderRequest, TrackMetadata};
use queue::DownloadQueue;
use sink::ProgressSink;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::Semaphore;
use uuid::Uuid;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
  /// Provider calls allowed to run at once; further attempts wait with their job still queued.
  pub max_concurrent_downloads: usize,
  /// Minimum gap between progress events for one attempt.
  pub progress_interval: std::time::Duration,
  pub history_namespace: String,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      max_concurrent_downloads: 4,
      progress_interval: std::time::Duration::from_millis(250),
      history_namespace: crate::persistence::DEFAULT_HISTORY_NAMESPACE.to_string(),
    }
  }
}

/// What one successful attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
  pub item_id: Option<String>,
  pub service: String,
  pub outcome: DownloadOutcome,
  /// Final size on disk; zero for files that already existed.
  pub size_mb: f64,
}

#[derive(Clone)]
pub struct DownloadOrchestrator {
  inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
  queue: DownloadQueue,
  broker: ProgressBroker,
  providers: ProviderRegistry,
  history: Arc<dyn HistoryStore>,
  permits: Semaphore,
  in_flight: DashMap<String, ()>,
  config: OrchestratorConfig,
}

/// Marks a job id as having a running attempt until dropped.
struct InFlightGuard<'a> {
  map: &'a DashMap<String, ()>,
  id: String,
}

impl<'a> InFlightGuard<'a> {
  fn acquire(map: &'a DashMap<String, ()>, id: &str) -> Result<Self, DownloadError> {
    match map.entry(id.to_string()) {
      dashmap::mapref::entry::Entry::Occupied(_) => Err(DownloadError::AttemptInFlight(id.to_string())),
      dashmap::mapref::entry::Entry::Vacant(v) => {
        v.insert(());
        Ok(Self {
          map,
          id: id.to_string(),
        })
      }
    }
  }
}

impl Drop for InFlightGuard<'_> {
  fn drop(&mut self) {
    self.map.remove(&self.id);
  }
}

impl DownloadOrchestrator {
  pub fn new(
    queue: DownloadQueue,
    broker: ProgressBroker,
    providers: ProviderRegistry,
    history: Arc<dyn HistoryStore>,
    config: OrchestratorConfig,
  ) -> Self {
    let permits = Semaphore::new(config.max_concurrent_downloads.max(1));
    Self {
      inner: Arc::new(OrchestratorInner {
        queue,
        broker,
        providers,
        history,
        permits,
        in_flight: DashMap::new(),
        config,
      }),
    }
  }

  pub fn queue(&self) -> &DownloadQueue {
    &self.inner.queue
  }

  pub fn providers(&self) -> &ProviderRegistry {
    &self.inner.providers
  }

  /// Rejects attempts still waiting for a slot, and every later one.
  pub fn shutdown(&self) {
    self.inner.permits.close();
  }

  /// Runs a single attempt against `req.service`.
  ///
  /// With `allow_fallback` and an item id, an upstream failure is returned
  /// without touching the job so the caller can retry with another service;
  /// otherwise the job is marked failed.
  pub async fn download(&self, req: &DownloadRequest) -> Result<AttemptReport, DownloadError> {
    let service = req.service.trim();
    let provider = self.resolve(service, req)?;
    let item_id = req.item_id();

    let _guard = match item_id {
      Some(id) => Some(InFlightGuard::acquire(&self.inner.in_flight, id)?),
      None => None,
    };

    if let Some(id) = item_id {
      let job = self
        .inner
        .queue
        .enqueue(id, &req.track_name, &req.artist_name, &req.album_name, &req.spotify_id);
      if job.status.is_terminal() {
        return Err(not_startable(id, job.status));
      }
    }

    let _permit = self
      .inner
      .permits
      .acquire()
      .await
      .map_err(|_| DownloadError::ShuttingDown)?;

    if let Some(id) = item_id {
      self.begin(id)?;
      self.inner.broker.broadcast(
        &ProgressEvent::download(id, EventStatus::Downloading)
          .percent(0.0)
          .message("Starting download..."),
      );
    }
    tracing::info!(item_id = item_id.unwrap_or(""), service, track = %req.track_name, "download attempt started");

    let sink = match item_id {
      Some(id) => ProgressSink::new(
        id,
        self.inner.queue.clone(),
        self.inner.broker.clone(),
        self.inner.config.progress_interval,
      ),
      None => ProgressSink::detached(),
    };
    let result = provider.download(&provider_request(req), &sink).await;
    sink.close();

    match result {
      Ok(DownloadOutcome::AlreadyExists { path }) => {
        let path_str = path.display().to_string();
        if let Some(id) = item_id {
          if let Err(qe) = self.inner.queue.skip(id, &path_str) {
            tracing::warn!(item_id = id, error = %qe, "could not mark job skipped");
          }
          self.inner.broker.broadcast(
            &ProgressEvent::download(id, EventStatus::Exists)
              .percent(100.0)
              .message("File already exists"),
          );
        }
        tracing::info!(item_id = item_id.unwrap_or(""), service, path = %path_str, "file already exists");
        Ok(AttemptReport {
          item_id: item_id.map(str::to_string),
          service: service.to_string(),
          outcome: DownloadOutcome::AlreadyExists { path },
          size_mb: 0.0,
        })
      }
      Ok(DownloadOutcome::Downloaded { path }) => {
        let path_str = path.display().to_string();
        let size_mb = tokio::fs::metadata(&path)
          .await
          .map(|m| m.len() as f64 / MIB)
          .unwrap_or(0.0);
        if let Some(id) = item_id {
          // The file is on disk even if the job was cleared or skipped meanwhile.
          if let Err(qe) = self.inner.queue.complete(id, &path_str, size_mb) {
            tracing::warn!(item_id = id, error = %qe, "could not mark job completed");
          }
          self.inner.broker.broadcast(
            &ProgressEvent::download(id, EventStatus::Done)
              .percent(100.0)
              .message("Download completed"),
          );
        }
        self.record_history(req, item_id, &path_str);
        tracing::info!(item_id = item_id.unwrap_or(""), service, path = %path_str, size_mb, "download completed");
        Ok(AttemptReport {
          item_id: item_id.map(str::to_string),
          service: service.to_string(),
          outcome: DownloadOutcome::Downloaded { path },
          size_mb,
        })
      }
      Err(e) => {
        let message = format!("{e:#}");
        let committed = !(req.allow_fallback && item_id.is_some());
        if let Some(id) = item_id.filter(|_| committed) {
          if let Err(qe) = self.inner.queue.fail(id, &message) {
            tracing::warn!(item_id = id, error = %qe, "could not mark job failed");
          }
          self.inner.broker.broadcast(
            &ProgressEvent::download(id, EventStatus::Error).message(message.clone()),
          );
        }
        tracing::warn!(item_id = item_id.unwrap_or(""), service, committed, error = %message, "download attempt failed");
        Err(DownloadError::Upstream {
          service: service.to_string(),
          message,
          committed,
        })
      }
    }
  }

  /// Tries `services` in order. Every attempt except the last is fallback
  /// eligible, so the job is only marked failed once the chain is exhausted.
  pub async fn download_with_fallback(
    &self,
    req: &DownloadRequest,
    services: &[String],
  ) -> Result<AttemptReport, DownloadError> {
    if services.is_empty() {
      return Err(DownloadError::Validation("no services to try".to_string()));
    }
    for service in services {
      self.resolve(service.trim(), req)?;
    }

    let mut last_err = None;
    for (i, service) in services.iter().enumerate() {
      let is_last = i + 1 == services.len();
      let mut attempt = req.clone();
      attempt.service = service.clone();
      attempt.allow_fallback = !is_last;

      match self.download(&attempt).await {
        Ok(report) => return Ok(report),
        Err(e) if e.is_upstream() && !is_last => {
          tracing::info!(item_id = req.item_id().unwrap_or(""), service = %service, error = %e, "falling back to next service");
          last_err = Some(e);
        }
        Err(e) => return Err(e),
      }
    }
    Err(last_err.unwrap_or_else(|| DownloadError::Validation("no services to try".to_string())))
  }

  fn resolve(&self, service: &str, req: &DownloadRequest) -> Result<Arc<dyn DownloaderProvider>, DownloadError> {
    if service.is_empty() {
      return Err(DownloadError::Validation("service is required".to_string()));
    }
    let provider = self
      .inner
      .providers
      .get(service)
      .ok_or_else(|| DownloadError::Validation(format!("unknown service: {service}")))?;
    if provider.requires_source_ref() && req.spotify_id.trim().is_empty() {
      return Err(DownloadError::Validation(format!("{service} requires a source track id")));
    }
    Ok(provider)
  }

  /// Moves a queued job to downloading. A job that is already downloading is
  /// a fallback continuation and is left as is.
  fn begin(&self, id: &str) -> Result<(), DownloadError> {
    let job = self
      .inner
      .queue
      .get(id)
      .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
    match job.status {
      JobStatus::Queued => {
        self.inner.queue.start(id)?;
        Ok(())
      }
      JobStatus::Downloading => Ok(()),
      other => Err(not_startable(id, other)),
    }
  }

  fn record_history(&self, req: &DownloadRequest, item_id: Option<&str>, path: &str) {
    let record = HistoryRecord {
      id: Uuid::new_v4().to_string(),
      item_id: item_id.map(str::to_string),
      title: req.track_name.clone(),
      artists: req.artist_name.clone(),
      album: req.album_name.clone(),
      format: req.audio_format.clone(),
      timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
      path: path.to_string(),
      source_id: req.spotify_id.clone(),
    };
    if let Err(e) = self.inner.history.add(&record, &self.inner.config.history_namespace) {
      tracing::warn!(item_id = item_id.unwrap_or(""), error = %e, "failed to record download history");
    }
  }
}

fn not_startable(id: &str, from: JobStatus) -> DownloadError {
  QueueError::InvalidTransition {
    id: id.to_string(),
    from,
    action: QueueAction::Start,
  }
  .into()
}

fn provider_request(req: &DownloadRequest) -> ProviderRequest {
  let track_number = if req.spotify_track_number > 0 {
    req.spotify_track_number
  } else {
    req.position
  };
  ProviderRequest {
    source_ref: req.spotify_id.clone(),
    output_dir: PathBuf::from(&req.output_dir),
    query_hint: req.query.clone(),
    filename_template: req.filename_format.clone(),
    audio_format: req.audio_format.clone(),
    service_url: req.service_url.clone(),
    metadata: TrackMetadata {
      track_name: req.track_name.clone(),
      artist_name: req.artist_name.clone(),
      album_name: req.album_name.clone(),
      album_artist: req.album_artist.clone(),
      release_date: req.release_date.clone(),
      cover_url: req.cover_url.clone(),
      track_number,
      disc_number: req.spotify_disc_number,
    },
  }
}

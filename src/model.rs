use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Queued,
  Downloading,
  #[serde(rename = "completed")]
  Done,
  Failed,
  Skipped,
  Cancelled,
}

impl JobStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      JobStatus::Done | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
    )
  }

  pub fn is_active(&self) -> bool {
    matches!(self, JobStatus::Queued | JobStatus::Downloading)
  }
}

impl std::fmt::Display for JobStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      JobStatus::Queued => "queued",
      JobStatus::Downloading => "downloading",
      JobStatus::Done => "done",
      JobStatus::Failed => "failed",
      JobStatus::Skipped => "skipped",
      JobStatus::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}

/// One tracked attempt to acquire a track, keyed by the caller's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
  pub id: String,
  pub track_name: String,
  pub artist_name: String,
  pub album_name: String,
  /// Source track id (e.g. the Spotify id) the job was requested for.
  pub source_ref: String,
  pub status: JobStatus,
  pub progress_mb: f64,
  pub speed_mbps: f64,
  pub total_size_mb: Option<f64>,
  pub file_path: Option<String>,
  pub error_message: Option<String>,
  pub created_at: String,
  pub updated_at: String,
  pub started_at: Option<String>,
  pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
  pub is_downloading: bool,
  pub queue: Vec<Job>,
  pub current_speed: f64,
  pub total_downloaded: f64,
  pub session_start_time: Option<i64>,
  pub queued_count: usize,
  pub completed_count: usize,
  pub failed_count: usize,
  pub skipped_count: usize,
  pub cancelled_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
  pub is_downloading: bool,
  pub active_count: usize,
  pub mb_downloaded: f64,
  pub speed_mbps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
  pub id: String,
  pub item_id: Option<String>,
  pub title: String,
  pub artists: String,
  pub album: String,
  pub format: String,
  pub timestamp: i64,
  pub path: String,
  pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsSnapshot {
  pub filename_format: String,
  pub audio_format: String,
  pub default_service: String,
  pub fallback_services: Vec<String>,
}

impl Default for SettingsSnapshot {
  fn default() -> Self {
    Self {
      filename_format: "{track_number}. {track_name}".to_string(),
      audio_format: "flac".to_string(),
      default_service: "direct".to_string(),
      fallback_services: Vec::new(),
    }
  }
}

/// Body of `POST /api/download`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadRequest {
  pub service: String,
  pub query: String,
  pub track_name: String,
  pub artist_name: String,
  pub album_name: String,
  pub album_artist: String,
  pub release_date: String,
  pub cover_url: String,
  pub service_url: String,
  pub output_dir: String,
  pub audio_format: String,
  pub filename_format: String,
  pub position: u32,
  pub spotify_id: String,
  pub spotify_track_number: u32,
  pub spotify_disc_number: u32,
  pub item_id: String,
  pub allow_fallback: bool,
  pub use_first_artist_only: bool,
  /// When non-empty the server walks this chain itself instead of the caller.
  pub fallback_services: Vec<String>,
}

impl DownloadRequest {
  pub fn item_id(&self) -> Option<&str> {
    let id = self.item_id.trim();
    if id.is_empty() {
      None
    } else {
      Some(id)
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadResponse {
  pub success: bool,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub file: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub already_exists: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub item_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkipItemQuery {
  pub item_id: Option<String>,
  pub file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResponse {
  pub success: bool,
  pub message: String,
  pub data: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn terminal_states_are_exactly_the_four_end_states() {
    assert!(!JobStatus::Queued.is_terminal());
    assert!(!JobStatus::Downloading.is_terminal());
    for s in [JobStatus::Done, JobStatus::Failed, JobStatus::Skipped, JobStatus::Cancelled] {
      assert!(s.is_terminal());
      assert!(!s.is_active());
    }
  }

  #[test]
  fn done_serializes_as_completed_for_queue_consumers() {
    let v = serde_json::to_value(JobStatus::Done).unwrap();
    assert_eq!(v, serde_json::json!("completed"));
    let v = serde_json::to_value(JobStatus::Cancelled).unwrap();
    assert_eq!(v, serde_json::json!("cancelled"));
  }

  #[test]
  fn download_request_tolerates_missing_fields() {
    let req: DownloadRequest = serde_json::from_str(r#"{"service":"direct","item_id":"  "}"#).unwrap();
    assert_eq!(req.service, "direct");
    assert!(!req.allow_fallback);
    assert_eq!(req.item_id(), None);
  }
}

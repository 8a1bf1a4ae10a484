//! Authoritative job registry. Every read and write goes through one mutex so a
//! snapshot never observes a job mid-transition.

use crate::{
  error::{QueueAction, QueueError},
  model::{Job, JobStatus, ProgressSummary, QueueSnapshot},
};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct DownloadQueue {
  inner: Arc<Mutex<QueueState>>,
}

#[derive(Default)]
struct QueueState {
  // Insertion order is the snapshot order.
  jobs: Vec<Job>,
  session_start: Option<i64>,
}

impl QueueState {
  fn find_mut(&mut self, id: &str) -> Option<&mut Job> {
    self.jobs.iter_mut().find(|j| j.id == id)
  }
}

impl DownloadQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a `Queued` job, or refreshes the descriptive fields of an existing
  /// one. The status of an existing job is left alone.
  pub fn enqueue(&self, id: &str, track: &str, artist: &str, album: &str, source_ref: &str) -> Job {
    let now = now_rfc3339();
    let mut st = self.inner.lock();
    if st.session_start.is_none() {
      st.session_start = Some(time::OffsetDateTime::now_utc().unix_timestamp());
    }

    if let Some(job) = st.find_mut(id) {
      job.track_name = track.to_string();
      job.artist_name = artist.to_string();
      job.album_name = album.to_string();
      job.source_ref = source_ref.to_string();
      job.updated_at = now;
      return job.clone();
    }

    let job = Job {
      id: id.to_string(),
      track_name: track.to_string(),
      artist_name: artist.to_string(),
      album_name: album.to_string(),
      source_ref: source_ref.to_string(),
      status: JobStatus::Queued,
      progress_mb: 0.0,
      speed_mbps: 0.0,
      total_size_mb: None,
      file_path: None,
      error_message: None,
      created_at: now.clone(),
      updated_at: now,
      started_at: None,
      finished_at: None,
    };
    st.jobs.push(job.clone());
    job
  }

  pub fn get(&self, id: &str) -> Option<Job> {
    self.inner.lock().jobs.iter().find(|j| j.id == id).cloned()
  }

  pub fn start(&self, id: &str) -> Result<Job, QueueError> {
    self.transition(id, QueueAction::Start, |s| s == JobStatus::Queued, |job, now| {
      job.status = JobStatus::Downloading;
      job.progress_mb = 0.0;
      job.speed_mbps = 0.0;
      job.started_at = Some(now.to_string());
    })
  }

  pub fn complete(&self, id: &str, path: &str, size_mb: f64) -> Result<Job, QueueError> {
    self.transition(id, QueueAction::Complete, |s| s == JobStatus::Downloading, |job, now| {
      job.status = JobStatus::Done;
      job.file_path = Some(path.to_string());
      job.total_size_mb = Some(size_mb);
      job.progress_mb = size_mb;
      job.speed_mbps = 0.0;
      job.finished_at = Some(now.to_string());
    })
  }

  pub fn fail(&self, id: &str, message: &str) -> Result<Job, QueueError> {
    self.transition(id, QueueAction::Fail, |s| s == JobStatus::Downloading, |job, now| {
      job.status = JobStatus::Failed;
      job.error_message = Some(message.to_string());
      job.speed_mbps = 0.0;
      job.finished_at = Some(now.to_string());
    })
  }

  /// The target artifact turned out to exist already.
  pub fn skip(&self, id: &str, path: &str) -> Result<Job, QueueError> {
    self.transition(id, QueueAction::Skip, |s| s.is_active(), |job, now| {
      job.status = JobStatus::Skipped;
      job.file_path = Some(path.to_string());
      job.speed_mbps = 0.0;
      job.finished_at = Some(now.to_string());
    })
  }

  /// Live progress from a running attempt. Ignored unless the job is downloading.
  pub fn update_progress(&self, id: &str, mb_downloaded: f64, speed_mbps: f64) {
    let mut st = self.inner.lock();
    if let Some(job) = st.find_mut(id) {
      if job.status == JobStatus::Downloading {
        job.progress_mb = mb_downloaded;
        job.speed_mbps = speed_mbps;
      }
    }
  }

  /// Returns how many jobs were cancelled.
  pub fn cancel_all_queued(&self) -> usize {
    let now = now_rfc3339();
    let mut st = self.inner.lock();
    let mut n = 0;
    for job in st.jobs.iter_mut().filter(|j| j.status == JobStatus::Queued) {
      job.status = JobStatus::Cancelled;
      job.updated_at = now.clone();
      job.finished_at = Some(now.clone());
      n += 1;
    }
    n
  }

  pub fn clear_all(&self) {
    let mut st = self.inner.lock();
    st.jobs.clear();
    st.session_start = None;
  }

  /// Drops terminal jobs, keeping anything still queued or downloading.
  pub fn clear_finished(&self) -> usize {
    let mut st = self.inner.lock();
    let before = st.jobs.len();
    st.jobs.retain(|j| !j.status.is_terminal());
    before - st.jobs.len()
  }

  pub fn snapshot(&self) -> QueueSnapshot {
    let st = self.inner.lock();
    let mut snap = QueueSnapshot {
      queue: st.jobs.clone(),
      session_start_time: st.session_start,
      ..Default::default()
    };
    for job in &st.jobs {
      match job.status {
        JobStatus::Queued => snap.queued_count += 1,
        JobStatus::Downloading => {
          snap.is_downloading = true;
          snap.current_speed += job.speed_mbps;
          snap.total_downloaded += job.progress_mb;
        }
        JobStatus::Done => {
          snap.completed_count += 1;
          snap.total_downloaded += job.total_size_mb.unwrap_or(0.0);
        }
        JobStatus::Failed => snap.failed_count += 1,
        JobStatus::Skipped => snap.skipped_count += 1,
        JobStatus::Cancelled => snap.cancelled_count += 1,
      }
    }
    snap
  }

  pub fn progress_summary(&self) -> ProgressSummary {
    let st = self.inner.lock();
    st.jobs
      .iter()
      .filter(|j| j.status == JobStatus::Downloading)
      .fold(ProgressSummary::default(), |mut acc, job| {
        acc.is_downloading = true;
        acc.active_count += 1;
        acc.mb_downloaded += job.progress_mb;
        acc.speed_mbps += job.speed_mbps;
        acc
      })
  }

  /// Plain-text report of failed jobs. Returns the count and the report (empty
  /// when nothing failed).
  pub fn export_failed(&self) -> (usize, String) {
    let failed: Vec<Job> = {
      let st = self.inner.lock();
      st.jobs.iter().filter(|j| j.status == JobStatus::Failed).cloned().collect()
    };
    if failed.is_empty() {
      return (0, String::new());
    }

    let exported_at = time::OffsetDateTime::now_utc()
      .format(time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
      .unwrap_or_default();
    let mut lines = vec![
      "# Failed Downloads".to_string(),
      format!("# Exported: {exported_at}"),
      String::new(),
    ];
    for job in &failed {
      lines.push(format!("Track: {}", job.track_name));
      lines.push(format!("Artist: {}", job.artist_name));
      lines.push(format!("Album: {}", job.album_name));
      lines.push(format!("Spotify ID: {}", job.source_ref));
      lines.push(format!("Error: {}", job.error_message.as_deref().unwrap_or("")));
      lines.push("---".to_string());
      lines.push(String::new());
    }
    (failed.len(), lines.join("\n"))
  }

  fn transition(
    &self,
    id: &str,
    action: QueueAction,
    allowed: impl Fn(JobStatus) -> bool,
    apply: impl FnOnce(&mut Job, &str),
  ) -> Result<Job, QueueError> {
    let now = now_rfc3339();
    let mut st = self.inner.lock();
    let job = st.find_mut(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
    if !allowed(job.status) {
      return Err(QueueError::InvalidTransition {
        id: id.to_string(),
        from: job.status,
        action,
      });
    }
    apply(job, &now);
    job.updated_at = now;
    Ok(job.clone())
  }
}

fn now_rfc3339() -> String {
  time::OffsetDateTime::now_utc()
    .format(&time::format_description::well_known::Rfc3339)
    .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  fn queue_with(ids: &[&str]) -> DownloadQueue {
    let q = DownloadQueue::new();
    for id in ids {
      q.enqueue(id, "Track", "Artist", "Album", "sp");
    }
    q
  }

  #[test]
  fn completed_job_shows_done_with_path() {
    let q = DownloadQueue::new();
    q.enqueue("abc123", "Song A", "Artist A", "Album A", "sp-a");
    q.start("abc123").unwrap();
    q.complete("abc123", "/downloads/Song A.flac", 4.2).unwrap();

    let snap = q.snapshot();
    assert_eq!(snap.queue.len(), 1);
    let job = &snap.queue[0];
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.file_path.as_deref(), Some("/downloads/Song A.flac"));
    assert_eq!(job.total_size_mb, Some(4.2));
    assert_eq!(snap.completed_count, 1);
  }

  #[test]
  fn start_on_unknown_id_creates_nothing() {
    let q = DownloadQueue::new();
    assert_eq!(q.start("ghost").unwrap_err(), QueueError::NotFound("ghost".to_string()));
    assert!(q.snapshot().queue.is_empty());
  }

  #[test]
  fn enqueue_twice_upserts_without_duplicating() {
    let q = DownloadQueue::new();
    q.enqueue("a", "Old", "X", "Y", "1");
    q.start("a").unwrap();
    let job = q.enqueue("a", "New", "X", "Y", "2");
    assert_eq!(job.track_name, "New");
    assert_eq!(job.status, JobStatus::Downloading);

    let snap = q.snapshot();
    let ids: HashSet<_> = snap.queue.iter().map(|j| j.id.clone()).collect();
    assert_eq!(ids.len(), snap.queue.len());
    assert_eq!(snap.queue.len(), 1);
  }

  #[test]
  fn complete_on_queued_job_is_rejected_and_harmless() {
    let q = queue_with(&["a"]);
    let err = q.complete("a", "/x", 1.0).unwrap_err();
    assert_eq!(
      err,
      QueueError::InvalidTransition {
        id: "a".to_string(),
        from: JobStatus::Queued,
        action: QueueAction::Complete,
      }
    );
    assert_eq!(q.get("a").unwrap().status, JobStatus::Queued);
  }

  #[test]
  fn terminal_states_are_never_left() {
    let q = queue_with(&["a"]);
    q.start("a").unwrap();
    q.fail("a", "boom").unwrap();

    assert!(q.start("a").is_err());
    assert!(q.complete("a", "/x", 1.0).is_err());
    assert!(q.skip("a", "/x").is_err());
    assert_eq!(q.cancel_all_queued(), 0);
    assert_eq!(q.get("a").unwrap().status, JobStatus::Failed);
    assert_eq!(q.get("a").unwrap().error_message.as_deref(), Some("boom"));
  }

  #[test]
  fn cancel_only_touches_queued_jobs() {
    let q = queue_with(&["queued", "running", "done", "also-queued"]);
    q.start("running").unwrap();
    q.start("done").unwrap();
    q.complete("done", "/d", 2.0).unwrap();

    assert_eq!(q.cancel_all_queued(), 2);
    assert_eq!(q.get("queued").unwrap().status, JobStatus::Cancelled);
    assert_eq!(q.get("also-queued").unwrap().status, JobStatus::Cancelled);
    assert_eq!(q.get("running").unwrap().status, JobStatus::Downloading);
    assert_eq!(q.get("done").unwrap().status, JobStatus::Done);
  }

  #[test]
  fn skip_applies_to_queued_and_downloading() {
    let q = queue_with(&["a", "b"]);
    q.start("b").unwrap();
    q.skip("a", "/a.flac").unwrap();
    q.skip("b", "/b.flac").unwrap();
    assert_eq!(q.get("a").unwrap().status, JobStatus::Skipped);
    assert_eq!(q.get("b").unwrap().file_path.as_deref(), Some("/b.flac"));
  }

  #[test]
  fn snapshot_preserves_insertion_order() {
    let q = queue_with(&["c", "a", "b"]);
    let ids: Vec<_> = q.snapshot().queue.into_iter().map(|j| j.id).collect();
    assert_eq!(ids, vec!["c", "a", "b"]);
  }

  #[test]
  fn progress_summary_only_counts_downloading_jobs() {
    let q = queue_with(&["a", "b", "c"]);
    q.start("a").unwrap();
    q.start("b").unwrap();
    q.update_progress("a", 1.5, 0.5);
    q.update_progress("b", 2.5, 1.0);
    // Not downloading: ignored.
    q.update_progress("c", 9.0, 9.0);

    let s = q.progress_summary();
    assert!(s.is_downloading);
    assert_eq!(s.active_count, 2);
    assert!((s.mb_downloaded - 4.0).abs() < f64::EPSILON);
    assert!((s.speed_mbps - 1.5).abs() < f64::EPSILON);
    assert_eq!(q.get("c").unwrap().progress_mb, 0.0);
  }

  #[test]
  fn clear_all_is_a_full_reset() {
    let q = queue_with(&["a", "b"]);
    q.start("a").unwrap();
    q.clear_all();
    let snap = q.snapshot();
    assert!(snap.queue.is_empty());
    assert_eq!(snap.session_start_time, None);
  }

  #[test]
  fn clear_finished_keeps_active_jobs() {
    let q = queue_with(&["a", "b", "c"]);
    q.start("b").unwrap();
    q.start("c").unwrap();
    q.fail("c", "nope").unwrap();
    assert_eq!(q.clear_finished(), 1);
    let ids: Vec<_> = q.snapshot().queue.into_iter().map(|j| j.id).collect();
    assert_eq!(ids, vec!["a", "b"]);
  }

  #[test]
  fn export_lists_failed_jobs_only() {
    let q = queue_with(&["a", "b"]);
    assert_eq!(q.export_failed(), (0, String::new()));

    q.start("a").unwrap();
    q.fail("a", "upstream 503").unwrap();
    let (n, report) = q.export_failed();
    assert_eq!(n, 1);
    assert!(report.starts_with("# Failed Downloads"));
    assert!(report.contains("Error: upstream 503"));
    assert!(report.contains("Spotify ID: sp"));
  }

  #[test]
  fn concurrent_transitions_stay_consistent() {
    let q = DownloadQueue::new();
    let handles: Vec<_> = (0..8)
      .map(|t| {
        let q = q.clone();
        std::thread::spawn(move || {
          for i in 0..50 {
            let id = format!("job-{}", i % 10);
            q.enqueue(&id, "T", "A", "B", "s");
            let _ = q.start(&id);
            if t % 2 == 0 {
              let _ = q.complete(&id, "/p", 1.0);
            } else {
              let _ = q.fail(&id, "x");
            }
            let snap = q.snapshot();
            let ids: HashSet<_> = snap.queue.iter().map(|j| j.id.clone()).collect();
            assert_eq!(ids.len(), snap.queue.len());
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }
    let snap = q.snapshot();
    assert_eq!(snap.queue.len(), 10);
    assert!(snap.queue.iter().all(|j| j.status.is_terminal()));
  }
}

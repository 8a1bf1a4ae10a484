use crate::app_state::AppPaths;
use crate::model::JobStatus;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// What a queue operation was asked to do; used in transition errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
  Start,
  Complete,
  Fail,
  Skip,
}

impl std::fmt::Display for QueueAction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      QueueAction::Start => "start",
      QueueAction::Complete => "complete",
      QueueAction::Fail => "fail",
      QueueAction::Skip => "skip",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueueError {
  #[error("job {0} not found")]
  NotFound(String),
  #[error("cannot {action} job {id} while it is {from}")]
  InvalidTransition {
    id: String,
    from: JobStatus,
    action: QueueAction,
  },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DownloadError {
  #[error("invalid request: {0}")]
  Validation(String),
  #[error(transparent)]
  Queue(#[from] QueueError),
  #[error("an attempt for job {0} is already running")]
  AttemptInFlight(String),
  #[error("downloads are shutting down")]
  ShuttingDown,
  /// `committed` is false when the job was left in place for a fallback retry.
  #[error("{service}: {message}")]
  Upstream {
    service: String,
    message: String,
    committed: bool,
  },
}

impl DownloadError {
  pub fn is_upstream(&self) -> bool {
    matches!(self, DownloadError::Upstream { .. })
  }
}

pub fn init_tracing(paths: &AppPaths) -> anyhow::Result<()> {
  let file_appender = tracing_appender::rolling::daily(&paths.logs_dir, "tunefetch.jsonl");
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
  let _ = LOG_GUARD.set(guard);

  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,reqwest=warn,hyper=warn"));

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(non_blocking)
    .json()
    .with_current_span(true)
    .with_span_list(true)
    .try_init()
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

  Ok(())
}

use crate::{
  engine::queue::DownloadQueue,
  events::{EventStatus, ProgressBroker, ProgressEvent},
};
use parking_lot::Mutex;
use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};
use tokio::time::{Duration, Instant};

const MIB: f64 = 1024.0 * 1024.0;

/// Progress reporter handed to a provider for one attempt. Each attempt gets
/// its own sink bound to its job id, so concurrent attempts never mix their
/// progress streams. Closed sinks drop every report.
#[derive(Clone)]
pub struct ProgressSink {
  inner: Arc<SinkInner>,
}

struct SinkInner {
  target: Option<SinkTarget>,
  min_interval: Duration,
  closed: AtomicBool,
  state: Mutex<SinkState>,
}

struct SinkTarget {
  item_id: String,
  queue: DownloadQueue,
  broker: ProgressBroker,
}

#[derive(Default)]
struct SinkState {
  last_emit: Option<Instant>,
  total_bytes: Option<u64>,
}

impl ProgressSink {
  pub fn new(item_id: &str, queue: DownloadQueue, broker: ProgressBroker, min_interval: Duration) -> Self {
    Self::build(
      Some(SinkTarget {
        item_id: item_id.to_string(),
        queue,
        broker,
      }),
      min_interval,
    )
  }

  /// A sink not bound to any job; reports go nowhere.
  pub fn detached() -> Self {
    Self::build(None, Duration::ZERO)
  }

  fn build(target: Option<SinkTarget>, min_interval: Duration) -> Self {
    Self {
      inner: Arc::new(SinkInner {
        target,
        min_interval,
        closed: AtomicBool::new(false),
        state: Mutex::new(SinkState::default()),
      }),
    }
  }

  pub fn item_id(&self) -> Option<&str> {
    self.inner.target.as_ref().map(|t| t.item_id.as_str())
  }

  /// Lets the sink compute a real percentage instead of reporting size only.
  pub fn set_total_bytes(&self, total: u64) {
    if total > 0 {
      self.inner.state.lock().total_bytes = Some(total);
    }
  }

  /// Cumulative bytes transferred so far and the current speed in bytes/s.
  pub fn report(&self, downloaded_bytes: u64, speed_bps: f64) {
    let Some(target) = self.inner.target.as_ref() else {
      return;
    };
    // Held through the broadcast so nothing goes out after `close` returns.
    let mut st = self.inner.state.lock();
    if self.is_closed() {
      return;
    }

    let mb = downloaded_bytes as f64 / MIB;
    let speed_mbps = speed_bps.max(0.0) / MIB;
    target.queue.update_progress(&target.item_id, mb, speed_mbps);

    let now = Instant::now();
    if let Some(last) = st.last_emit {
      if now.saturating_duration_since(last) < self.inner.min_interval {
        return;
      }
    }
    st.last_emit = Some(now);
    let percent = st
      .total_bytes
      .map(|total| ((downloaded_bytes as f64 / total as f64) * 100.0).min(100.0));

    let mut evt = ProgressEvent::download(&target.item_id, EventStatus::Downloading)
      .speed(speed_mbps)
      .message(format!("Downloading: {mb:.2} MB ({speed_mbps:.2} MB/s)"));
    evt.percent = percent;
    target.broker.broadcast(&evt);
  }

  pub fn close(&self) {
    let _st = self.inner.state.lock();
    self.inner.closed.store(true, Ordering::Release);
  }

  pub fn is_closed(&self) -> bool {
    self.inner.closed.load(Ordering::Acquire)
  }
}

//! Progress fan-out. A single actor task owns the observer set; handles only
//! talk to it through messages.

use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub const EVENT_DOWNLOAD_PROGRESS: &str = "download:progress";

/// Matches the buffer the web client was built against.
pub const DEFAULT_OBSERVER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
  Downloading,
  Exists,
  Done,
  Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
  #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
  pub kind: Option<String>,
  pub item_id: String,
  pub status: EventStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub percent: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub speed: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

impl ProgressEvent {
  pub fn download(item_id: &str, status: EventStatus) -> Self {
    Self {
      kind: Some(EVENT_DOWNLOAD_PROGRESS.to_string()),
      item_id: item_id.to_string(),
      status,
      percent: None,
      speed: None,
      message: None,
    }
  }

  pub fn percent(mut self, percent: f64) -> Self {
    self.percent = Some(percent);
    self
  }

  pub fn speed(mut self, speed: f64) -> Self {
    self.speed = Some(speed);
    self
  }

  pub fn message(mut self, message: impl Into<String>) -> Self {
    self.message = Some(message.into());
    self
  }
}

/// One server-sent-events frame derived from a serialized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
  pub event: Option<String>,
  pub data: String,
}

impl SseFrame {
  /// The event name is the payload's string `type` field; anything else
  /// (including non-JSON) goes out as an untyped message.
  pub fn from_payload(payload: &str) -> Self {
    let event = serde_json::from_str::<serde_json::Value>(payload)
      .ok()
      .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string));
    Self {
      event,
      data: payload.to_string(),
    }
  }

  pub fn to_event(&self) -> axum::response::sse::Event {
    // Fields are written in call order; `event:` precedes `data:` on the wire.
    let mut evt = axum::response::sse::Event::default();
    if let Some(name) = &self.event {
      evt = evt.event(name);
    }
    evt.data(&self.data)
  }
}

impl std::fmt::Display for SseFrame {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if let Some(name) = &self.event {
      writeln!(f, "event: {name}")?;
    }
    writeln!(f, "data: {}\n", self.data)
  }
}

pub type ObserverId = Uuid;

#[derive(Debug)]
enum BrokerCommand {
  Register {
    id: ObserverId,
    tx: mpsc::Sender<Arc<str>>,
  },
  Unregister {
    id: ObserverId,
  },
  Broadcast {
    payload: Arc<str>,
  },
  Count {
    reply: oneshot::Sender<usize>,
  },
}

#[derive(Clone)]
pub struct ProgressBroker {
  tx: mpsc::UnboundedSender<BrokerCommand>,
  observer_buffer: usize,
}

impl ProgressBroker {
  /// Spawns the broker task on the current tokio runtime. The task exits once
  /// every handle is dropped.
  pub fn spawn(observer_buffer: usize) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_broker(rx));
    Self {
      tx,
      observer_buffer: observer_buffer.max(1),
    }
  }

  pub fn register(&self) -> Observer {
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(self.observer_buffer);
    self.send(BrokerCommand::Register { id, tx });
    Observer {
      id,
      rx,
      broker: self.clone(),
    }
  }

  /// Safe to call any number of times for the same id.
  pub fn unregister(&self, id: ObserverId) {
    self.send(BrokerCommand::Unregister { id });
  }

  /// Never blocks; delivery to each observer is best-effort.
  pub fn broadcast(&self, event: &ProgressEvent) {
    match serde_json::to_string(event) {
      Ok(json) => self.broadcast_raw(json),
      Err(e) => tracing::warn!(item_id = %event.item_id, error = %e, "failed to encode progress event"),
    }
  }

  pub fn broadcast_raw(&self, payload: impl Into<Arc<str>>) {
    self.send(BrokerCommand::Broadcast {
      payload: payload.into(),
    });
  }

  pub async fn observer_count(&self) -> usize {
    let (reply, rx) = oneshot::channel();
    self.send(BrokerCommand::Count { reply });
    rx.await.unwrap_or(0)
  }

  fn send(&self, cmd: BrokerCommand) {
    if self.tx.send(cmd).is_err() {
      tracing::debug!("progress broker is gone; dropping command");
    }
  }
}

async fn run_broker(mut rx: mpsc::UnboundedReceiver<BrokerCommand>) {
  let mut observers: HashMap<ObserverId, mpsc::Sender<Arc<str>>> = HashMap::new();

  while let Some(cmd) = rx.recv().await {
    match cmd {
      BrokerCommand::Register { id, tx } => {
        observers.insert(id, tx);
        tracing::debug!(observer = %id, total = observers.len(), "observer registered");
      }
      BrokerCommand::Unregister { id } => {
        // Dropping the sender closes the observer's queue.
        if observers.remove(&id).is_some() {
          tracing::debug!(observer = %id, total = observers.len(), "observer unregistered");
        }
      }
      BrokerCommand::Broadcast { payload } => {
        observers.retain(|id, tx| match tx.try_send(payload.clone()) {
          Ok(()) => true,
          Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::trace!(observer = %id, "observer lagging; event dropped");
            true
          }
          Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
      }
      BrokerCommand::Count { reply } => {
        let _ = reply.send(observers.len());
      }
    }
  }
}

/// A live subscription. Dropping it unregisters from the broker.
pub struct Observer {
  id: ObserverId,
  rx: mpsc::Receiver<Arc<str>>,
  broker: ProgressBroker,
}

impl Observer {
  pub fn id(&self) -> ObserverId {
    self.id
  }

  /// Next serialized event, or `None` once unregistered.
  pub async fn recv(&mut self) -> Option<Arc<str>> {
    self.rx.recv().await
  }

  pub fn try_recv(&mut self) -> Option<Arc<str>> {
    self.rx.try_recv().ok()
  }
}

impl Drop for Observer {
  fn drop(&mut self) {
    self.broker.unregister(self.id);
  }
}

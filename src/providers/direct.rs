use crate::engine::{
  naming::{ensure_dir, filename_from_url, render_track_filename},
  provider::{DownloadOutcome, DownloaderProvider, ProviderRequest},
  sink::ProgressSink,
};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::{io::AsyncWriteExt, time::Instant};
use url::Url;

pub const SERVICE_DIRECT: &str = "direct";

const SPEED_SAMPLE: std::time::Duration = std::time::Duration::from_millis(200);
const SPEED_ALPHA: f64 = 0.2;

/// Fetches `service_url` as-is. Used when the caller already resolved a
/// downloadable link for the track.
pub struct DirectUrlProvider {
  client: reqwest::Client,
}

impl DirectUrlProvider {
  pub fn new() -> anyhow::Result<Self> {
    Ok(Self::with_client(build_client()?))
  }

  pub fn with_client(client: reqwest::Client) -> Self {
    Self { client }
  }

  fn target_path(req: &ProviderRequest, url: &Url) -> PathBuf {
    let name = render_track_filename(&req.filename_template, &req.metadata, &req.audio_format)
      .or_else(|| filename_from_url(url))
      .unwrap_or_else(|| "download".to_string());
    req.output_dir.join(name)
  }
}

#[async_trait]
impl DownloaderProvider for DirectUrlProvider {
  fn service(&self) -> &'static str {
    SERVICE_DIRECT
  }

  async fn download(&self, req: &ProviderRequest, sink: &ProgressSink) -> anyhow::Result<DownloadOutcome> {
    let raw = req.service_url.trim();
    if raw.is_empty() {
      anyhow::bail!("no download url for this track");
    }
    let url = Url::parse(raw).context("invalid download url")?;

    ensure_dir(&req.output_dir)?;
    let final_path = Self::target_path(req, &url);
    if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
      tracing::debug!(path = %final_path.display(), "target already on disk");
      return Ok(DownloadOutcome::AlreadyExists { path: final_path });
    }

    let temp_path = part_path(&final_path);
    let res = fetch_to(&self.client, &url, &temp_path, sink).await;
    if let Err(e) = res {
      let _ = tokio::fs::remove_file(&temp_path).await;
      return Err(e);
    }

    tokio::fs::rename(&temp_path, &final_path)
      .await
      .context("failed to move temp file to final path")?;
    Ok(DownloadOutcome::Downloaded { path: final_path })
  }
}

async fn fetch_to(client: &reqwest::Client, url: &Url, temp_path: &Path, sink: &ProgressSink) -> anyhow::Result<()> {
  let resp = client.get(url.clone()).send().await?;
  let status = resp.status();
  if status.is_client_error() || status.is_server_error() {
    anyhow::bail!("http {}", status.as_u16());
  }
  if let Some(len) = resp.content_length() {
    sink.set_total_bytes(len);
  }

  let mut file = tokio::fs::File::create(temp_path)
    .await
    .context("failed to create temp file")?;
  let mut stream = resp.bytes_stream();

  let mut bytes_total: u64 = 0;
  let mut sample_bytes: u64 = 0;
  let mut sample_at = Instant::now();
  let mut speed_ewma = 0.0_f64;

  while let Some(chunk) = stream.next().await {
    let chunk = chunk?;
    file.write_all(&chunk).await?;
    bytes_total += chunk.len() as u64;

    let elapsed = sample_at.elapsed();
    if elapsed >= SPEED_SAMPLE || speed_ewma == 0.0 {
      let secs = elapsed.as_secs_f64().max(1e-3);
      let inst = (bytes_total - sample_bytes) as f64 / secs;
      speed_ewma = if speed_ewma == 0.0 {
        inst
      } else {
        speed_ewma * (1.0 - SPEED_ALPHA) + inst * SPEED_ALPHA
      };
      sample_bytes = bytes_total;
      sample_at = Instant::now();
    }
    sink.report(bytes_total, speed_ewma);
  }

  file.flush().await?;
  Ok(())
}

fn part_path(final_path: &Path) -> PathBuf {
  let mut name = final_path
    .file_name()
    .map(|n| n.to_os_string())
    .unwrap_or_default();
  name.push(".part");
  final_path.with_file_name(name)
}

fn build_client() -> anyhow::Result<reqwest::Client> {
  reqwest::Client::builder()
    .user_agent(concat!("tunefetch/", env!("CARGO_PKG_VERSION")))
    .redirect(reqwest::redirect::Policy::limited(10))
    .connect_timeout(std::time::Duration::from_secs(15))
    .build()
    .context("failed to build reqwest client")
}

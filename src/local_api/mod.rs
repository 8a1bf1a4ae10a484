use crate::{
  app_state::AppState,
  engine::{naming::first_artist, provider::DownloadOutcome, AttemptReport},
  error::{DownloadError, QueueError},
  events::SseFrame,
  model::{DownloadRequest, DownloadResponse, ExportResponse, SettingsSnapshot, SkipItemQuery},
  persistence::DEFAULT_HISTORY_NAMESPACE,
};
use anyhow::Context;
use axum::{
  extract::{rejection::JsonRejection, Path, Query, State},
  http::StatusCode,
  response::{sse::Event, IntoResponse, Response, Sse},
  routing::{delete, get, post},
  Json, Router,
};
use futures_util::Stream;
use serde_json::json;
use std::{convert::Infallible, future::Future, net::SocketAddr, path::Path as FsPath, time::Duration};
use tower_http::cors::CorsLayer;

pub fn router(state: AppState) -> Router {
  let development = state.config.development;
  let api = Router::new()
    .route("/health", get(get_health))
    .route("/download", post(post_download))
    .route("/events", get(get_events))
    .route("/download-progress", get(get_progress))
    .route("/download-queue", get(get_queue))
    .route("/clear-completed", post(post_clear_completed))
    .route("/clear-all", post(post_clear_all))
    .route("/cancel-queued", post(post_cancel_queued))
    .route("/skip-item", post(post_skip_item))
    .route("/export-failed", get(get_export_failed))
    .route("/history", get(get_history).delete(delete_history))
    .route("/history/:id", delete(delete_history_item))
    .route("/settings", get(get_settings).post(post_settings))
    .route("/download-path", get(get_download_path))
    .with_state(state);

  let app = Router::new().nest("/api", api);
  if development {
    app.layer(CorsLayer::permissive())
  } else {
    app
  }
}

pub async fn serve<F>(state: AppState, shutdown: F) -> anyhow::Result<()>
where
  F: Future<Output = ()> + Send + 'static,
{
  let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .with_context(|| format!("failed to bind {addr}"))?;
  tracing::info!(%addr, "starting local api");
  serve_listener(listener, state, shutdown).await
}

pub async fn serve_listener<F>(listener: tokio::net::TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
  F: Future<Output = ()> + Send + 'static,
{
  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown)
    .await
    .context("local api server stopped")
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
  (status, Json(json!({ "error": message.into() }))).into_response()
}

fn ok_status() -> Response {
  Json(json!({ "status": "ok" })).into_response()
}

fn error_status(err: &DownloadError) -> StatusCode {
  match err {
    DownloadError::Validation(_) => StatusCode::BAD_REQUEST,
    DownloadError::Queue(QueueError::NotFound(_)) => StatusCode::NOT_FOUND,
    DownloadError::Queue(QueueError::InvalidTransition { .. }) | DownloadError::AttemptInFlight(_) => StatusCode::CONFLICT,
    DownloadError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    // Upstream failures are reported in the body, not the status line.
    DownloadError::Upstream { .. } => StatusCode::OK,
  }
}

/// Fills request gaps from stored settings and pins the output directory to
/// the server's own download path.
fn normalize_request(mut req: DownloadRequest, settings: &SettingsSnapshot, download_dir: &FsPath) -> DownloadRequest {
  req.output_dir = download_dir.display().to_string();
  if req.audio_format.trim().is_empty() {
    req.audio_format = settings.audio_format.clone();
  }
  if req.filename_format.trim().is_empty() {
    req.filename_format = settings.filename_format.clone();
  }
  if req.service.trim().is_empty() {
    req.service = settings.default_service.clone();
    if req.fallback_services.is_empty() {
      req.fallback_services = settings.fallback_services.clone();
    }
  }
  if req.use_first_artist_only && !req.artist_name.is_empty() {
    req.artist_name = first_artist(&req.artist_name);
    if !req.album_artist.is_empty() {
      req.album_artist = first_artist(&req.album_artist);
    }
  }
  req
}

/// Primary service first, then the fallbacks, each tried once.
fn service_chain(req: &DownloadRequest) -> Vec<String> {
  let mut chain: Vec<String> = Vec::with_capacity(req.fallback_services.len() + 1);
  for s in std::iter::once(&req.service).chain(req.fallback_services.iter()) {
    let s = s.trim();
    if !s.is_empty() && !chain.iter().any(|c| c == s) {
      chain.push(s.to_string());
    }
  }
  chain
}

fn download_response(item_id: Option<String>, res: Result<AttemptReport, DownloadError>) -> Response {
  match res {
    Ok(report) => {
      let already_exists = matches!(report.outcome, DownloadOutcome::AlreadyExists { .. });
      let body = DownloadResponse {
        success: true,
        message: if already_exists {
          "File already exists".to_string()
        } else {
          "Download completed successfully".to_string()
        },
        file: Some(report.outcome.path().display().to_string()),
        error: None,
        already_exists,
        item_id,
      };
      Json(body).into_response()
    }
    Err(e) => {
      let error = match &e {
        DownloadError::Upstream { message, .. } => message.clone(),
        other => other.to_string(),
      };
      let body = DownloadResponse {
        success: false,
        error: Some(error),
        item_id,
        ..Default::default()
      };
      (error_status(&e), Json(body)).into_response()
    }
  }
}

async fn get_health() -> impl IntoResponse {
  ok_status()
}

async fn post_download(State(st): State<AppState>, body: Result<Json<DownloadRequest>, JsonRejection>) -> Response {
  let Ok(Json(req)) = body else {
    let body = DownloadResponse {
      success: false,
      error: Some("Invalid request".to_string()),
      ..Default::default()
    };
    return (StatusCode::BAD_REQUEST, Json(body)).into_response();
  };

  let settings = match st.settings.get_snapshot() {
    Ok(s) => s,
    Err(e) => {
      tracing::warn!(error = %e, "failed to load settings; using defaults");
      SettingsSnapshot::default()
    }
  };
  let req = normalize_request(req, &settings, &st.paths.download_dir);
  let item_id = req.item_id().map(str::to_string);

  // Detached so a client disconnect cannot cancel an attempt mid-flight.
  let orchestrator = st.orchestrator.clone();
  let attempt = tokio::spawn(async move {
    if req.fallback_services.is_empty() {
      orchestrator.download(&req).await
    } else {
      let chain = service_chain(&req);
      orchestrator.download_with_fallback(&req, &chain).await
    }
  });
  match attempt.await {
    Ok(res) => download_response(item_id, res),
    Err(e) => {
      tracing::error!(item_id = item_id.as_deref().unwrap_or(""), error = %e, "download task failed");
      json_error(StatusCode::INTERNAL_SERVER_ERROR, "download task failed")
    }
  }
}

async fn get_events(State(st): State<AppState>) -> Response {
  // The observer unregisters itself when the client goes away and the stream is dropped.
  let observer = st.broker.register();
  tracing::debug!(observer = %observer.id(), "sse client connected");
  let stream = futures_util::stream::unfold(observer, |mut obs| async move {
    let payload = obs.recv().await?;
    let frame = SseFrame::from_payload(&payload);
    tracing::trace!(frame = %frame, "sse frame");
    Some((Ok::<Event, Infallible>(frame.to_event()), obs))
  });
  sse(stream).into_response()
}

fn sse<S>(stream: S) -> Sse<S>
where
  S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
  Sse::new(stream).keep_alive(
    axum::response::sse::KeepAlive::new()
      .interval(Duration::from_secs(15))
      .text("keep-alive"),
  )
}

async fn get_progress(State(st): State<AppState>) -> impl IntoResponse {
  Json(st.queue.progress_summary())
}

async fn get_queue(State(st): State<AppState>) -> impl IntoResponse {
  Json(st.queue.snapshot())
}

async fn post_clear_completed(State(st): State<AppState>) -> impl IntoResponse {
  let removed = st.queue.clear_finished();
  Json(json!({ "status": "ok", "removed": removed }))
}

async fn post_clear_all(State(st): State<AppState>) -> impl IntoResponse {
  st.queue.clear_all();
  ok_status()
}

async fn post_cancel_queued(State(st): State<AppState>) -> impl IntoResponse {
  let cancelled = st.queue.cancel_all_queued();
  tracing::info!(cancelled, "cancelled queued downloads");
  Json(json!({ "status": "ok", "cancelled": cancelled }))
}

async fn post_skip_item(State(st): State<AppState>, Query(q): Query<SkipItemQuery>) -> Response {
  let Some(item_id) = q.item_id.filter(|s| !s.trim().is_empty()) else {
    return json_error(StatusCode::BAD_REQUEST, "item_id is required");
  };
  match st.queue.skip(&item_id, q.file_path.as_deref().unwrap_or("")) {
    Ok(_) => ok_status(),
    Err(e) => {
      let err = DownloadError::from(e);
      json_error(error_status(&err), err.to_string())
    }
  }
}

async fn get_export_failed(State(st): State<AppState>) -> impl IntoResponse {
  let (count, data) = st.queue.export_failed();
  let message = if count == 0 {
    "No failed downloads to export".to_string()
  } else {
    format!("Exported {count} failed downloads")
  };
  Json(ExportResponse {
    success: true,
    message,
    data,
  })
}

async fn get_history(State(st): State<AppState>) -> Response {
  match st.history.list(DEFAULT_HISTORY_NAMESPACE) {
    Ok(items) => Json(items).into_response(),
    Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
  }
}

async fn delete_history(State(st): State<AppState>) -> Response {
  match st.history.clear(DEFAULT_HISTORY_NAMESPACE) {
    Ok(_) => ok_status(),
    Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
  }
}

async fn delete_history_item(State(st): State<AppState>, Path(id): Path<String>) -> Response {
  match st.history.delete(&id, DEFAULT_HISTORY_NAMESPACE) {
    Ok(true) => ok_status(),
    Ok(false) => json_error(StatusCode::NOT_FOUND, format!("history item {id} not found")),
    Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
  }
}

async fn get_settings(State(st): State<AppState>) -> Response {
  match st.settings.get_snapshot() {
    Ok(s) => Json(s).into_response(),
    Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
  }
}

async fn post_settings(State(st): State<AppState>, body: Result<Json<SettingsSnapshot>, JsonRejection>) -> Response {
  let Ok(Json(snap)) = body else {
    return json_error(StatusCode::BAD_REQUEST, "Invalid request");
  };
  if !snap.default_service.trim().is_empty() && st.orchestrator.providers().get(snap.default_service.trim()).is_none() {
    return json_error(
      StatusCode::BAD_REQUEST,
      format!("unknown service: {}", snap.default_service.trim()),
    );
  }
  match st.settings.set_snapshot(&snap) {
    Ok(()) => ok_status(),
    Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
  }
}

async fn get_download_path(State(st): State<AppState>) -> impl IntoResponse {
  Json(json!({ "path": st.paths.download_dir.display().to_string() }))
}

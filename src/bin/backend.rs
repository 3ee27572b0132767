#![forbid(unsafe_code)]

//! Axum backend that exposes the download pipeline over HTTP.
//!
//! Handlers stay thin: they unpack JSON, call into the library, and map
//! [`PipelineError`] onto status codes. Stored files are streamed straight
//! from the storage root with Range support.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use grabtube::{
    PipelineError,
    config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config},
    download::DownloadExecutor,
    extractor::{MediaExtractor, YtDlpExtractor},
    janitor::{Janitor, SweepReport},
    metadata::{MediaMetadata, MetadataResolver},
    security::ensure_not_root,
    store::{FileStore, StoredFile, blocking},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const FILE_ROUTE_PREFIX: &str = "/api/video/file";

#[derive(Debug, Parser)]
#[command(author, version, about = "HTTP backend for the grabtube download pipeline")]
struct BackendArgs {
    /// Directory that holds downloaded files
    #[arg(long)]
    storage_root: Option<PathBuf>,
    /// Address to listen on
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,
    /// Path to the yt-dlp executable
    #[arg(long)]
    ytdlp_bin: Option<PathBuf>,
    /// Age after which the janitor evicts downloads
    #[arg(long)]
    max_age_hours: Option<u64>,
    /// Alternative .env file
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            storage_root: self.storage_root,
            host: self.host,
            port: self.port,
            ytdlp_bin: self.ytdlp_bin,
            max_age_hours: self.max_age_hours,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/GRABTUBE_HOST")
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    extractor: Arc<dyn MediaExtractor>,
    resolver: MetadataResolver,
    executor: DownloadExecutor,
    store: FileStore,
    janitor: Janitor,
}

impl AppState {
    fn new(config: &RuntimeConfig, extractor: Arc<dyn MediaExtractor>) -> Self {
        let store = FileStore::from_config(config);
        Self {
            resolver: MetadataResolver::new(extractor.clone(), config.metadata_concurrency),
            executor: DownloadExecutor::new(
                extractor.clone(),
                store.clone(),
                config.download_concurrency,
            ),
            janitor: Janitor::new(store.clone(), config.max_file_age, config.sweep_interval),
            store,
            extractor,
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "file not found".into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        if err.is_not_found() {
            return Self::not_found();
        }
        let status = match &err {
            PipelineError::InvalidUrl(_) | PipelineError::UnsupportedPlatform(_) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::ExtractionFailure(_) | PipelineError::DownloadFailure(_) => {
                StatusCode::BAD_GATEWAY
            }
            PipelineError::ToolUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {err}");
            return Self::internal("internal storage error");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Success envelope shared by every JSON endpoint.
#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
    })
}

#[derive(Debug, Deserialize)]
struct InfoRequest {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    url: String,
    #[serde(alias = "quality", default = "default_quality")]
    quality_label: String,
    #[serde(default = "default_extension")]
    extension: String,
}

fn default_quality() -> String {
    "best".to_string()
}

fn default_extension() -> String {
    "mp4".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    file_name: String,
    size_bytes: u64,
    size: String,
    download_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredFileResponse {
    file_name: String,
    size_bytes: u64,
    size: String,
    download_url: String,
    downloaded_at: String,
}

impl From<StoredFile> for StoredFileResponse {
    fn from(file: StoredFile) -> Self {
        Self {
            size: file.size_label(),
            download_url: download_url(&file.file_name),
            downloaded_at: file.created_at.to_rfc3339(),
            size_bytes: file.size_bytes,
            file_name: file.file_name,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    success: bool,
    message: &'static str,
    ytdlp_installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_sweep: Option<SweepReport>,
}

fn download_url(file_name: &str) -> String {
    format!("{FILE_ROUTE_PREFIX}/{file_name}")
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/video/health", get(health))
        .route("/api/video/info", post(video_info))
        .route("/api/video/download", post(download_video))
        .route("/api/video/downloads", get(list_downloads))
        .route(
            "/api/video/file/{file_name}",
            get(get_file).delete(delete_file),
        )
        .fallback(|| async {
            ApiError {
                status: StatusCode::NOT_FOUND,
                message: "endpoint not found".into(),
            }
        })
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("grabtube=info")),
        )
        .init();

    let config = resolve_runtime_config(BackendArgs::parse().into_overrides())?;
    ensure_not_root("backend")?;
    let host = parse_host_arg(&config.host)?;

    let extractor: Arc<dyn MediaExtractor> = Arc::new(YtDlpExtractor::from_config(&config));
    if let Err(err) = extractor.probe().await {
        warn!("extractor probe failed, downloads will be unavailable: {err}");
    }
    let state = AppState::new(&config, extractor);

    let (stop_janitor, janitor_stopped) = tokio::sync::oneshot::channel::<()>();
    let janitor = tokio::spawn(state.janitor.clone().run(async move {
        let _ = janitor_stopped.await;
    }));

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        %addr,
        storage_root = %config.storage_root.display(),
        "API server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    let _ = stop_janitor.send(());
    if let Err(err) = janitor.await {
        warn!("janitor task ended abnormally: {err}");
    }
    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates.
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let last_sweep = state.janitor.last_report();
    match state.extractor.probe().await {
        Ok(version) => Json(HealthResponse {
            success: true,
            message: "Video downloader service is running",
            ytdlp_installed: true,
            version: Some(version),
            error: None,
            last_sweep,
        })
        .into_response(),
        Err(err) => {
            warn!("health probe failed: {err}");
            let body = HealthResponse {
                success: false,
                message: "Video downloader service is not available",
                ytdlp_installed: false,
                version: None,
                error: Some(PipelineError::ToolUnavailable.to_string()),
                last_sweep,
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

async fn video_info(
    State(state): State<AppState>,
    payload: Result<Json<InfoRequest>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<MediaMetadata>>> {
    let Json(request) = payload?;
    let metadata = state.resolver.resolve(&request.url).await?;
    Ok(ok(metadata))
}

async fn download_video(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<DownloadResponse>>> {
    let Json(request) = payload?;
    let stored = state
        .executor
        .execute(&request.url, &request.quality_label, &request.extension)
        .await?;
    Ok(ok(DownloadResponse {
        size: stored.size_label(),
        download_url: download_url(&stored.file_name),
        size_bytes: stored.size_bytes,
        file_name: stored.file_name,
    }))
}

async fn list_downloads(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<Vec<StoredFileResponse>>>> {
    let store = state.store.clone();
    let files = blocking(move || store.list()).await?;
    Ok(ok(files.into_iter().map(StoredFileResponse::from).collect()))
}

async fn get_file(
    State(state): State<AppState>,
    AxumPath(file_name): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let path = state.store.resolve(&file_name)?;
    stream_file(path, &file_name, &headers).await
}

async fn delete_file(
    State(state): State<AppState>,
    AxumPath(file_name): AxumPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let store = state.store.clone();
    let deleted = blocking(move || store.delete(&file_name)).await?;
    if !deleted {
        return Err(ApiError::not_found());
    }
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "File deleted successfully",
    })))
}

fn header_value(value: impl AsRef<str>) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value.as_ref()).map_err(|err| ApiError::internal(err.to_string()))
}

/// Streams a stored file, honouring single byte-range requests.
async fn stream_file(path: PathBuf, file_name: &str, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(&path).await.map_err(|_| ApiError::not_found())?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found())?
        .len();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found())?;
            let mut response = Body::from_stream(ReaderStream::new(file.take(length))).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(format!("attachment; filename=\"{file_name}\""))?,
    );
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let range = value.strip_prefix("bytes=")?.trim();
    // Multi-range requests are served as a full response.
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means the last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
